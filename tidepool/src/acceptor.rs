//! Inbound TCP listener.
//!
//! Accepts at most one connection per readiness event (level-triggered; the
//! next poll reports the listener again if more are pending) and hands raw
//! accepted sockets to the new-connection callback. A reserve fd on /dev/null
//! recovers from process fd exhaustion without spinning.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use socket2::{Domain, Socket};
use tracing::{error, trace};

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Listens for inbound TCP and emits raw accepted sockets.
///
/// Teardown must run on the owning loop thread; `TcpServer` marshals the
/// final drop there.
pub struct Acceptor {
    loop_handle: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    /// Reserve fd, burned and reopened when accept hits EMFILE.
    idle_fd: Mutex<Option<OwnedFd>>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Create and bind the listening socket. Listening starts separately.
    pub fn new(
        loop_handle: LoopHandle,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let sock = socket::new_nonblocking(Domain::for_address(listen_addr))?;
        sock.set_reuse_address(true)?;
        if reuse_port {
            socket::set_reuse_port(&sock)?;
        }
        sock.bind(&listen_addr.into())?;
        let idle_fd = socket::open_dev_null()?;

        let channel = Channel::new(loop_handle.clone(), sock.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            loop_handle,
            socket: sock,
            channel,
            idle_fd: Mutex::new(Some(idle_fd)),
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Arc::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    /// The bound address; resolves port 0 to the kernel-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        socket::local_addr(&self.socket)
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    /// Start listening and enable readiness. Loop thread only.
    pub fn listen(self: &Arc<Self>, backlog: i32) -> io::Result<()> {
        self.loop_handle.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        self.socket.listen(backlog)?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        match socket::accept(&self.socket) {
            Ok((sock, peer)) => {
                let mut cb = self.new_connection_cb.lock();
                if let Some(cb) = cb.as_mut() {
                    cb(sock, peer);
                } else {
                    trace!(peer = %peer, "no new-connection callback, dropping");
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                error!("accept: too many open files");
                // Burn the reserve fd to make room, shed the pending
                // connection, then re-arm the reserve. Without this the
                // listener would spin on a readiness event it can never
                // clear.
                let mut idle = self.idle_fd.lock();
                idle.take();
                if let Ok((sock, _)) = socket::accept(&self.socket) {
                    drop(sock);
                }
                *idle = socket::open_dev_null().ok();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!(error = %e, "accept"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening.load(Ordering::Acquire) {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}
