//! Per-connection state machine with buffered send and flow control.
//!
//! A `TcpConnection` is shared: the server's map, user code, and in-flight
//! deferred tasks all hold strong references, and the channel ties a weak
//! reference so dispatch never runs into a destroyed owner. State moves
//! `connecting -> connected -> disconnecting -> disconnected`; the connection
//! callback fires exactly once for up and once for down.
//!
//! `send` is safe from any thread. On the loop thread it writes directly
//! when nothing is buffered, then buffers the remainder and enables
//! writability; crossing the high-watermark from below fires the
//! backpressure callback once per crossing.

use std::any::Any;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Default connection callback: trace the up/down transition.
///
/// Installed on every new connection; replaced by `set_connection_callback`.
/// Deliberately does not close the connection — registering only a message
/// callback is a supported pattern.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        local = %conn.local_addr(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection"
    );
}

/// Default message callback: drain the input so an unhandled connection
/// cannot grow its buffer without bound.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _receive_time: Instant) {
    buf.retrieve_all();
}

/// Connection lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

/// One established (or establishing) TCP connection.
pub struct TcpConnection {
    loop_handle: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    /// User-opaque per-connection context.
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    /// Wrap an established socket. The caller must follow with exactly one
    /// `connect_established` on the owning loop and exactly one
    /// `connect_destroyed` at end of life.
    pub fn new(
        loop_handle: LoopHandle,
        name: String,
        sock: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let channel = Channel::new(loop_handle.clone(), sock.as_raw_fd());
        if let Err(e) = sock.set_keepalive(true) {
            debug!(error = %e, "SO_KEEPALIVE");
        }
        debug!(name = %name, fd = sock.as_raw_fd(), "connection created");

        let conn = Arc::new(TcpConnection {
            loop_handle,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            reading: AtomicBool::new(true),
            socket: sock,
            channel,
            local_addr,
            peer_addr,
            connection_cb: Mutex::new(Some(Arc::new(default_connection_callback))),
            message_cb: Mutex::new(Some(Arc::new(default_message_callback))),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(Arc::new(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Disconnected,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            _ => ConnState::Disconnecting,
        }
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    /// `cb(conn, buffered)` fires when buffered output crosses the threshold
    /// from below.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_mark_cb.lock() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_nodelay(on) {
            warn!(name = %self.name, error = %e, "TCP_NODELAY");
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = self.socket.set_keepalive(on) {
            warn!(name = %self.name, error = %e, "SO_KEEPALIVE");
        }
    }

    /// Attach a user-opaque value to this connection.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock() = Some(context);
    }

    /// Typed copy of the context value; `None` when empty or not a `T`.
    pub fn context<T: Any + Clone>(&self) -> Option<T> {
        self.context
            .lock()
            .as_ref()
            .and_then(|context| context.downcast_ref::<T>())
            .cloned()
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().take()
    }

    /// Borrow the context slot under its lock.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.context.lock())
    }

    /// Send bytes. Safe from any thread: dispatches synchronously on the
    /// owning loop, copies and marshals otherwise.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Connected {
            if self.loop_handle.is_in_loop_thread() {
                self.send_in_loop(data);
            } else {
                let this = self.clone();
                let payload = data.to_vec();
                self.loop_handle
                    .run_in_loop(move || this.send_in_loop(&payload));
            }
        }
    }

    /// Send the readable contents of `buf`, draining it.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() == ConnState::Connected {
            if self.loop_handle.is_in_loop_thread() {
                self.send_in_loop(buf.peek());
                buf.retrieve_all();
            } else {
                let this = self.clone();
                let payload = buf.peek().to_vec();
                buf.retrieve_all();
                self.loop_handle
                    .run_in_loop(move || this.send_in_loop(&payload));
            }
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;
        let mut output = self.output_buffer.lock();

        // Nothing queued: try the direct write first.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match (&self.socket).write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, error = %e, "write");
                        if matches!(
                            e.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                let cb = self.high_water_mark_cb.lock().clone();
                if let Some(cb) = cb {
                    let this = self.clone();
                    let buffered = old_len + remaining;
                    self.loop_handle.queue_in_loop(move || cb(&this, buffered));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once buffered output drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let this = self.clone();
            self.loop_handle.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown(std::net::Shutdown::Write) {
                error!(name = %self.name, error = %e, "shutdown");
            }
        }
        // Still writing: handle_write issues the shutdown once the buffer
        // empties.
    }

    /// Close without waiting for buffered output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.set_state(ConnState::Disconnecting);
            let this = self.clone();
            self.loop_handle
                .queue_in_loop(move || this.force_close_in_loop());
        }
    }

    /// Close after `delay`, unless the connection is gone by then.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.set_state(ConnState::Disconnecting);
            let weak = Arc::downgrade(self);
            // Not force_close_in_loop, to avoid racing a concurrent close.
            self.loop_handle.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            // As if the peer closed.
            self.handle_close();
        }
    }

    /// Resume reading. Thread-safe.
    pub fn start_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_handle.run_in_loop(move || {
            if !this.reading.load(Ordering::Acquire) || !this.channel.is_reading() {
                this.channel.enable_reading();
                this.reading.store(true, Ordering::Release);
            }
        });
    }

    /// Stop reading; input backpressure. Thread-safe.
    pub fn stop_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_handle.run_in_loop(move || {
            if this.reading.load(Ordering::Acquire) || this.channel.is_reading() {
                this.channel.disable_reading();
                this.reading.store(false, Ordering::Release);
            }
        });
    }

    /// Complete establishment: tie the channel, enable reading, fire the
    /// connection callback. Loop thread only; called exactly once.
    pub fn connect_established(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        let owner: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(Arc::downgrade(&owner));
        self.channel.enable_reading();

        let cb = self.connection_cb.lock().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown: unregister the channel, fire the connection callback
    /// with the disconnected state if it has not fired yet. Loop thread only;
    /// called exactly once, after removal from any owner map.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            let cb = self.connection_cb.lock().clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.loop_handle.assert_in_loop_thread();
        let result = {
            let mut input = self.input_buffer.lock();
            input.read_fd(self.channel.fd())
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "read");
                let cb = self.message_cb.lock().clone();
                if let Some(cb) = cb {
                    let mut input = self.input_buffer.lock();
                    cb(self, &mut input, receive_time);
                }
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "read");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }
        let drained = {
            let mut output = self.output_buffer.lock();
            match (&self.socket).write(output.peek()) {
                Ok(n) if n > 0 => {
                    output.retrieve(n);
                    output.readable_bytes() == 0
                }
                Ok(_) => false,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, error = %e, "write");
                    }
                    false
                }
            }
        };
        if drained {
            self.channel.disable_writing();
            self.queue_write_complete();
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.loop_handle.assert_in_loop_thread();
        trace!(fd = self.channel.fd(), state = ?self.state(), "close");
        assert!(matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ));
        // The socket stays open until the connection drops; the channel just
        // stops watching it.
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let guard: TcpConnectionPtr = self.clone();
        let cb = self.connection_cb.lock().clone();
        if let Some(cb) = cb {
            cb(&guard);
        }
        // Must be last: the owner uses it to drop its reference.
        let cb = self.close_cb.lock().clone();
        if let Some(cb) = cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match socket::socket_error(&self.socket) {
            Some(e) => error!(name = %self.name, error = %e, "SO_ERROR"),
            None => error!(name = %self.name, "error event with no SO_ERROR"),
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.write_complete_cb.lock().clone();
        if let Some(cb) = cb {
            let this = self.clone();
            self.loop_handle.queue_in_loop(move || cb(&this));
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection dropped");
        if !std::thread::panicking() {
            assert_eq!(self.state(), ConnState::Disconnected);
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish()
    }
}
