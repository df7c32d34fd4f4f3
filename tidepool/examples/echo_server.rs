use std::sync::Arc;

use tidepool::{Config, EventLoop, TcpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let addr = bind_addr.parse().expect("invalid address");

    let mut event_loop = EventLoop::new().expect("event loop");
    let server = TcpServer::new(event_loop.handle(), addr, "echo", Config::default())
        .expect("failed to bind");
    server.set_thread_num(2);

    server.set_connection_callback(Arc::new(|conn| {
        info!(
            conn = conn.name(),
            peer = %conn.peer_addr(),
            up = conn.connected(),
            "connection"
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));

    server.start().expect("failed to start");
    info!(addr = server.ip_port(), "echo server running");
    event_loop.run();
}
