use std::sync::Arc;

use tidepool::{EventLoop, TcpClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let addr = server_addr.parse().expect("invalid address");

    let mut event_loop = EventLoop::new().expect("event loop");
    let handle = event_loop.handle();

    let client = TcpClient::new(handle.clone(), addr, "echo-client");
    client.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!(peer = %conn.peer_addr(), "connected, sending greeting");
            conn.send(b"hello tidepool\r\n");
        } else {
            info!(conn = conn.name(), "disconnected");
        }
    }));
    let quitter = handle.clone();
    client.set_message_callback(Arc::new(move |_conn, buf, _receive_time| {
        let reply = buf.retrieve_all_as_string();
        info!(reply = reply.trim_end(), "echo received");
        quitter.quit();
    }));

    client.connect();
    event_loop.run();
}
