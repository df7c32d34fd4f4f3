//! Connector retry and stop behavior.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tidepool::{EventLoopThread, TcpClient};

fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// A local port with nothing listening on it.
fn dead_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[test]
fn connector_retries_until_server_appears() {
    let worker = EventLoopThread::start("conn-retry".into(), None).unwrap();
    let addr = dead_port();

    let client = TcpClient::new(worker.handle(), addr, "retrier");
    let ups = Arc::new(AtomicUsize::new(0));
    {
        let ups = ups.clone();
        client.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    client.connect();

    // First attempt is refused; give the 500 ms backoff a moment to arm,
    // then occupy the port so a retry lands.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(ups.load(Ordering::SeqCst), 0);
    let listener = TcpListener::bind(addr).expect("rebind retry target");

    assert!(
        wait_for(|| ups.load(Ordering::SeqCst) == 1, Duration::from_secs(3)),
        "connector never retried into the live listener"
    );
    let (_peer, _) = listener.accept().unwrap();
    assert!(client.connection().is_some());

    drop(client);
}

#[test]
fn stop_halts_retries() {
    let worker = EventLoopThread::start("conn-stop".into(), None).unwrap();
    let addr = dead_port();

    let client = TcpClient::new(worker.handle(), addr, "stopper");
    let ups = Arc::new(AtomicUsize::new(0));
    {
        let ups = ups.clone();
        client.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    client.connect();

    thread::sleep(Duration::from_millis(150));
    client.stop();

    // A backoff timer may already be in flight; it re-checks the connect
    // flag and must not dial out.
    let listener = TcpListener::bind(addr).expect("rebind retry target");
    listener.set_nonblocking(true).unwrap();

    let deadline = Instant::now() + Duration::from_millis(1500);
    while Instant::now() < deadline {
        match listener.accept() {
            Ok(_) => panic!("connector dialed after stop()"),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => panic!("accept: {e}"),
        }
    }
    assert_eq!(ups.load(Ordering::SeqCst), 0);

    drop(client);
}
