//! High-watermark backpressure and write-complete notification.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tidepool::{Config, EventLoopThread, TcpServer};

const PAYLOAD: usize = 4 * 1024 * 1024;

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

#[test]
fn high_watermark_then_write_complete() {
    let base = EventLoopThread::start("flow-base".into(), None).unwrap();
    let config = Config {
        high_water_mark: 1024,
        ..Config::default()
    };
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        "flood",
        config,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_value = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    {
        let hwm_hits = hwm_hits.clone();
        let hwm_value = hwm_value.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let hits = hwm_hits.clone();
                let value = hwm_value.clone();
                conn.set_high_water_mark_callback(Arc::new(move |_conn, buffered| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    value.store(buffered, Ordering::SeqCst);
                }));
                // One oversized burst: the direct write fills the socket
                // buffer, the rest lands in the output buffer and crosses
                // the 1 KiB mark in one step.
                conn.send(&vec![b'x'; PAYLOAD]);
            }
        }));
    }
    {
        let write_completes = write_completes.clone();
        server.set_write_complete_callback(Arc::new(move |_conn| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.start().unwrap();

    let mut stream = {
        let start = Instant::now();
        loop {
            match TcpStream::connect(addr) {
                Ok(s) => break s,
                Err(e) if start.elapsed() > Duration::from_secs(2) => panic!("connect: {e}"),
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
    };

    // The slow peer is not reading yet; the watermark callback fires once,
    // with at least the threshold buffered.
    assert!(wait_for(
        || hwm_hits.load(Ordering::SeqCst) == 1,
        Duration::from_secs(3)
    ));
    assert!(hwm_value.load(Ordering::SeqCst) >= 1024);

    // Drain everything; the buffered tail flushes and write-complete fires.
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut total = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    while total < PAYLOAD {
        let n = stream.read(&mut chunk).expect("read payload");
        assert!(n > 0, "peer closed early at {total} bytes");
        total += n;
    }
    assert_eq!(total, PAYLOAD);

    assert!(wait_for(
        || write_completes.load(Ordering::SeqCst) >= 1,
        Duration::from_secs(3)
    ));
    // Exactly one crossing, so exactly one watermark callback.
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);

    drop(stream);
    drop(server);
}
