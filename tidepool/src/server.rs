//! TCP server: acceptor plus loop pool plus connection map.
//!
//! The acceptor runs on the base loop; each accepted socket is wrapped in a
//! `TcpConnection` assigned to a worker loop. The server's per-name map holds
//! the owning references; removal hops base loop -> worker loop so a closing
//! connection outlives its map entry by at least one loop iteration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::socket;

/// A multi-loop TCP server.
pub struct TcpServer {
    loop_handle: LoopHandle,
    name: String,
    ip_port: String,
    config: Config,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    pool: Arc<EventLoopThreadPool>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    /// Bind `listen_addr` on the base loop. Listening starts with `start()`.
    pub fn new(
        loop_handle: LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
        config: Config,
    ) -> Result<Arc<TcpServer>, Error> {
        let acceptor = Acceptor::new(loop_handle.clone(), listen_addr, config.reuse_port)?;
        let ip_port = acceptor.local_addr().to_string();
        let pool = EventLoopThreadPool::new(loop_handle.clone(), name);

        let server = Arc::new(TcpServer {
            loop_handle,
            name: name.to_string(),
            ip_port,
            config,
            acceptor: Mutex::new(Some(acceptor)),
            pool,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .lock()
            .as_ref()
            .unwrap()
            .set_new_connection_callback(Box::new(move |sock, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(sock, peer);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address as `ip:port`; port 0 resolves to the assigned port.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().as_ref().map(|a| a.local_addr())
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn pool(&self) -> &Arc<EventLoopThreadPool> {
        &self.pool
    }

    /// Worker loops to spawn; 0 keeps all I/O on the base loop. Set before
    /// `start`.
    pub fn set_thread_num(&self, n: usize) {
        self.pool.set_thread_num(n);
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

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_cb.lock() = Some(cb);
    }

    /// Start the pool and the listener. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.pool.start(self.thread_init_cb.lock().clone())?;

            let acceptor = self
                .acceptor
                .lock()
                .clone()
                .expect("server already torn down");
            assert!(!acceptor.listening());
            info!(name = %self.name, addr = %self.ip_port, "server starting");
            let backlog = self.config.backlog;
            self.loop_handle.run_in_loop(move || {
                if let Err(e) = acceptor.listen(backlog) {
                    error!(error = %e, "listen");
                }
            });
        }
        Ok(())
    }

    /// Runs on the base loop for every accepted socket.
    fn new_connection(self: &Arc<Self>, sock: Socket, peer_addr: SocketAddr) {
        self.loop_handle.assert_in_loop_thread();
        let worker = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            server = %self.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = socket::local_addr(&sock);
        let conn = TcpConnection::new(worker.clone(), conn_name.clone(), sock, local_addr, peer_addr);
        conn.set_tcp_no_delay(self.config.tcp_nodelay);
        if !self.config.keep_alive {
            conn.set_keep_alive(false);
        }
        conn.set_high_water_mark(self.config.high_water_mark);

        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        worker.run_in_loop(move || conn.connect_established());
    }

    /// Called from the worker via the connection's close callback.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let this = self.clone();
        let conn = conn.clone();
        self.loop_handle
            .run_in_loop(move || this.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.loop_handle.assert_in_loop_thread();
        info!(server = %self.name, conn = %conn.name(), "remove connection");
        let removed = self.connections.lock().remove(conn.name());
        assert!(removed.is_some());
        let worker = conn.owner_loop().clone();
        let conn = conn.clone();
        worker.queue_in_loop(move || conn.connect_destroyed());
    }

    /// Connections currently in the map. Base-loop callers see an exact
    /// snapshot; others a racy one.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!(name = %self.name, "server dropping");
        let conns = std::mem::take(&mut *self.connections.lock());
        for (_, conn) in conns {
            let worker = conn.owner_loop().clone();
            worker.run_in_loop(move || conn.connect_destroyed());
        }
        // The acceptor unregisters its channel on the base loop.
        if let Some(acceptor) = self.acceptor.get_mut().take() {
            self.loop_handle.run_in_loop(move || drop(acceptor));
        }
        // Pool drop then quits and joins the workers, after the
        // connect_destroyed tasks queued above.
    }
}
