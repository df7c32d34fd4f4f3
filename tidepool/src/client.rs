//! TCP client: connector plus at most one live connection.
//!
//! The connector delivers an established socket on the loop thread; the
//! client wraps it, publishes it under a mutex, and optionally reconnects
//! when the connection closes. Dropping the client detaches the live
//! connection rather than tearing it down with the peer mid-flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, info};

use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::socket;

/// A single outbound TCP connection with optional reconnect.
pub struct TcpClient {
    loop_handle: LoopHandle,
    name: String,
    connector: Arc<Connector>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    /// Reconnect when an established connection goes down.
    retry: AtomicBool,
    /// Cleared by `disconnect`/`stop`.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr, name: &str) -> Arc<TcpClient> {
        let connector = Connector::new(loop_handle.clone(), server_addr);
        let client = Arc::new(TcpClient {
            loop_handle,
            name: name.to_string(),
            connector,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        client
            .connector
            .set_connected_callback(Box::new(move |sock| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(sock);
                }
            }));
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().clone()
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Reconnect automatically after an established connection closes.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
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

    /// Start connecting. Thread-safe.
    pub fn connect(&self) {
        info!(name = %self.name, server = %self.connector.server_addr(), "connecting");
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Half-close the live connection and stay disconnected.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection.lock().clone() {
            conn.shutdown();
        }
    }

    /// Abort connection establishment.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    /// Runs on the loop thread with the freshly connected socket.
    fn new_connection(self: &Arc<Self>, sock: Socket) {
        self.loop_handle.assert_in_loop_thread();
        let peer_addr = socket::peer_addr(&sock);
        let local_addr = socket::local_addr(&sock);
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);
        debug!(conn = %conn_name, "client connection up");

        let conn = TcpConnection::new(
            self.loop_handle.clone(),
            conn_name,
            sock,
            local_addr,
            peer_addr,
        );
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
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock() = Some(conn.clone());
        conn.connect_established();
    }

    /// Close callback of the live connection; loop thread.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.loop_handle.assert_in_loop_thread();
        assert_eq!(conn.owner_loop(), &self.loop_handle);
        {
            let mut slot = self.connection.lock();
            assert!(slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)));
            slot.take();
        }
        let c = conn.clone();
        self.loop_handle.queue_in_loop(move || c.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                name = %self.name,
                server = %self.connector.server_addr(),
                "reconnecting"
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!(name = %self.name, "client dropping");
        let (conn, sole_owner) = {
            let slot = self.connection.lock();
            let sole = slot.as_ref().map(|c| Arc::strong_count(c) == 1).unwrap_or(false);
            (slot.clone(), sole)
        };
        if let Some(conn) = conn {
            // Detach: after this, closing only destroys the connection and
            // never touches the (gone) client.
            let handle = conn.owner_loop().clone();
            let conn2 = conn.clone();
            handle.run_in_loop(move || {
                let loop_handle = conn2.owner_loop().clone();
                conn2.set_close_callback(Arc::new(move |c| {
                    let c = c.clone();
                    loop_handle.queue_in_loop(move || c.connect_destroyed());
                }));
            });
            if sole_owner {
                conn.force_close();
            }
        } else {
            // A backoff retry may still be in flight; keep the connector
            // alive long enough for its timer to fire and no-op.
            self.connector.stop();
            let mut parked = Some(self.connector.clone());
            self.loop_handle
                .run_after(Duration::from_secs(1), move || {
                    parked.take();
                });
        }
    }
}
