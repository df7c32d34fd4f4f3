//! Asynchronous outbound TCP connection establishment.
//!
//! Issues a nonblocking connect, watches the socket for writability, and
//! classifies the outcome: deliver the socket, retry with doubling backoff
//! (500 ms up to 30 s), or abandon. Shared-lifetime: retry timers capture a
//! weak self-reference and may outlive the original caller.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Socket};
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::config::{INIT_RETRY_DELAY, MAX_RETRY_DELAY};
use crate::event_loop::LoopHandle;
use crate::socket;

pub(crate) type ConnectedCallback = Box<dyn FnMut(Socket) + Send>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Establishes one outbound TCP connection, with retry.
pub struct Connector {
    loop_handle: LoopHandle,
    server_addr: SocketAddr,
    /// Cleared by `stop()`; every deferred step re-checks it.
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    /// Channel watching the in-flight connect; present only while connecting.
    channel: Mutex<Option<Arc<Channel>>>,
    /// The socket owned during the pending connect.
    pending: Mutex<Option<Socket>>,
    connected_cb: Mutex<Option<ConnectedCallback>>,
}

impl Connector {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new(Connector {
            loop_handle,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            channel: Mutex::new(None),
            pending: Mutex::new(None),
            connected_cb: Mutex::new(None),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Callback invoked with the established socket.
    pub(crate) fn set_connected_callback(&self, cb: ConnectedCallback) {
        *self.connected_cb.lock() = Some(cb);
    }

    /// Begin connecting. Thread-safe.
    pub fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        let this = self.clone();
        self.loop_handle.run_in_loop(move || this.start_in_loop());
    }

    /// Stop connecting. An in-flight backoff timer may still fire once; it
    /// re-checks the connect flag and no-ops.
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        let this = self.clone();
        self.loop_handle.queue_in_loop(move || this.stop_in_loop());
    }

    /// Reset backoff and reconnect. Loop thread only.
    pub fn restart(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Release);
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.do_connect();
        } else {
            debug!("do not connect");
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            self.remove_and_reset_channel();
            if let Some(sock) = self.pending.lock().take() {
                // connect flag is already clear, so this just closes the
                // socket and logs.
                self.retry(sock);
            }
        }
    }

    fn do_connect(self: &Arc<Self>) {
        let sock = match socket::new_nonblocking(Domain::for_address(self.server_addr)) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "connector socket");
                return;
            }
        };
        let errno = match sock.connect(&self.server_addr.into()) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(0),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(sock),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(sock),

            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!(errno, server = %self.server_addr, "connect error");
            }

            _ => {
                error!(errno, server = %self.server_addr, "unexpected connect error");
            }
        }
    }

    /// The connect is in flight: watch the socket for writability.
    fn connecting(self: &Arc<Self>, sock: Socket) {
        self.set_state(State::Connecting);
        let channel = Channel::new(self.loop_handle.clone(), sock.as_raw_fd());
        *self.pending.lock() = Some(sock);

        let weak = Arc::downgrade(self);
        channel.set_write_callback(Arc::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        }));
        let weak = Arc::downgrade(self);
        channel.set_error_callback(Arc::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        }));

        *self.channel.lock() = Some(channel.clone());
        channel.enable_writing();
    }

    /// Detach the watch channel. The slot is cleared in a deferred task
    /// because this runs inside the channel's own handler.
    fn remove_and_reset_channel(self: &Arc<Self>) {
        if let Some(channel) = self.channel.lock().as_ref() {
            channel.disable_all();
            channel.remove();
        }
        let this = self.clone();
        self.loop_handle.queue_in_loop(move || {
            this.channel.lock().take();
        });
    }

    fn handle_write(self: &Arc<Self>) {
        trace!(state = ?self.state(), "connector writable");
        if self.state() == State::Connecting {
            self.remove_and_reset_channel();
            let sock = match self.pending.lock().take() {
                Some(s) => s,
                None => return,
            };
            if let Some(err) = socket::socket_error(&sock) {
                warn!(error = %err, server = %self.server_addr, "connect SO_ERROR");
                self.retry(sock);
            } else if socket::is_self_connect(&sock) {
                warn!(server = %self.server_addr, "self connect");
                self.retry(sock);
            } else {
                self.set_state(State::Connected);
                if self.connect.load(Ordering::Acquire) {
                    let mut cb = self.connected_cb.lock();
                    if let Some(cb) = cb.as_mut() {
                        cb(sock);
                    }
                } else {
                    // Stopped while the handshake completed; discard.
                    drop(sock);
                }
            }
        } else {
            assert_eq!(self.state(), State::Disconnected);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        error!(state = ?self.state(), server = %self.server_addr, "connector error");
        if self.state() == State::Connecting {
            self.remove_and_reset_channel();
            if let Some(sock) = self.pending.lock().take() {
                if let Some(err) = socket::socket_error(&sock) {
                    warn!(error = %err, "connect SO_ERROR");
                }
                self.retry(sock);
            }
        }
    }

    /// Close the failed socket and schedule another attempt with backoff.
    fn retry(self: &Arc<Self>, sock: Socket) {
        drop(sock);
        self.set_state(State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = self.retry_delay_ms.load(Ordering::Acquire);
            info!(
                server = %self.server_addr,
                delay_ms = delay,
                "retry connecting"
            );
            let weak = Arc::downgrade(self);
            self.loop_handle
                .run_after(Duration::from_millis(delay), move || {
                    if let Some(connector) = weak.upgrade() {
                        connector.start_in_loop();
                    }
                });
            self.retry_delay_ms.store(
                (delay * 2).min(MAX_RETRY_DELAY.as_millis() as u64),
                Ordering::Release,
            );
        } else {
            debug!("do not connect");
        }
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}
