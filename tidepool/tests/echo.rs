//! End-to-end echo scenarios over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidepool::{Config, EventLoopThread, TcpClient, TcpConnectionPtr, TcpServer};

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

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    let start = Instant::now();
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if start.elapsed() < Duration::from_secs(2) => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("connect to {addr}: {e}"),
        }
    }
}

fn start_echo_server(
    base: &EventLoopThread,
    config: Config,
) -> (Arc<TcpServer>, SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse().unwrap(),
        "echo",
        config,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    {
        let ups = ups.clone();
        let downs = downs.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::SeqCst);
            } else {
                downs.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    server.set_message_callback(Arc::new(|conn, buf, _| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));
    server.start().unwrap();
    (server, addr, ups, downs)
}

#[test]
fn echo_round_trip() {
    let base = EventLoopThread::start("echo-base".into(), None).unwrap();
    let (server, addr, ups, downs) = start_echo_server(&base, Config::default());

    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    assert!(wait_for(|| ups.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
    drop(stream);
    assert!(wait_for(
        || downs.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    // Connection callback fired exactly once in each direction.
    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(downs.load(Ordering::SeqCst), 1);
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_secs(2)));

    // Loop introspection reflects the traffic that just happened: iterations
    // advanced, the last poll return is recent, the task queue drains.
    let handle = base.handle();
    assert!(handle.iteration() > 0);
    assert!(handle.poll_return_time().elapsed() < Duration::from_secs(30));
    assert!(wait_for(|| handle.queue_size() == 0, Duration::from_secs(2)));

    drop(server);
}

#[test]
fn send_buffer_echo_with_context_counter() {
    let base = EventLoopThread::start("ctx-base".into(), None).unwrap();
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse().unwrap(),
        "ctx-echo",
        Config::default(),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let lines_seen = Arc::new(AtomicUsize::new(0));
    {
        let lines_seen = lines_seen.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                // Per-connection line counter carried in the context slot.
                conn.set_context(Box::new(0usize));
            } else {
                let counted = conn.context::<usize>().unwrap_or(0);
                lines_seen.store(counted, Ordering::SeqCst);
                assert!(conn.take_context().is_some());
                assert!(conn.context::<usize>().is_none());
            }
        }));
    }
    server.set_message_callback(Arc::new(|conn, buf, _| {
        let lines = buf.peek().iter().filter(|&&b| b == b'\n').count();
        conn.with_context(|slot| {
            if let Some(counter) = slot.as_mut().and_then(|c| c.downcast_mut::<usize>()) {
                *counter += lines;
            }
        });
        // Echo by draining the input buffer wholesale.
        conn.send_buffer(buf);
    }));
    server.start().unwrap();

    let mut stream = connect_with_retry(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    for msg in [b"one\n".as_slice(), b"two\n", b"three\n"] {
        stream.write_all(msg).unwrap();
        let mut reply = vec![0u8; msg.len()];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg);
    }
    drop(stream);

    assert!(wait_for(
        || lines_seen.load(Ordering::SeqCst) == 3,
        Duration::from_secs(2)
    ));
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_secs(2)));
    drop(server);
}

#[test]
fn stop_read_pauses_message_delivery() {
    let base = EventLoopThread::start("pause-base".into(), None).unwrap();
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse().unwrap(),
        "paused",
        Config::default(),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let messages = Arc::new(AtomicUsize::new(0));
    let server_conn: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));
    {
        let server_conn = server_conn.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                // Input backpressure from the first moment of the connection.
                conn.stop_read();
                *server_conn.lock() = Some(conn.clone());
            } else {
                server_conn.lock().take();
            }
        }));
    }
    {
        let messages = messages.clone();
        server.set_message_callback(Arc::new(move |_conn, buf, _| {
            buf.retrieve_all();
            messages.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.start().unwrap();

    let mut stream = connect_with_retry(addr);
    stream.write_all(b"held back\n").unwrap();

    assert!(wait_for(|| server_conn.lock().is_some(), Duration::from_secs(2)));
    let conn = server_conn.lock().clone().unwrap();

    // Data sits in the kernel buffer while reading is disabled.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(messages.load(Ordering::SeqCst), 0);
    assert!(!conn.is_reading());

    conn.start_read();
    assert!(wait_for(
        || messages.load(Ordering::SeqCst) >= 1,
        Duration::from_secs(2)
    ));
    assert!(conn.is_reading());

    drop(stream);
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_secs(2)));
    drop(server);
}

#[test]
fn echo_across_worker_pool() {
    let base = EventLoopThread::start("pool-echo-base".into(), None).unwrap();
    let server = TcpServer::new(
        base.handle(),
        "127.0.0.1:0".parse().unwrap(),
        "pool-echo",
        Config::default(),
    )
    .unwrap();
    server.set_thread_num(4);
    server.set_message_callback(Arc::new(|conn, buf, _| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // More connections than workers, all answered.
    let mut streams: Vec<TcpStream> = (0..8).map(|_| connect_with_retry(addr)).collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let msg = format!("msg-{i}\n");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut reply = vec![0u8; msg.len()];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg.as_bytes());
    }

    drop(streams);
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_secs(2)));
    drop(server);
}

#[test]
fn client_round_trip_and_disconnect() {
    let server_loop = EventLoopThread::start("srv-loop".into(), None).unwrap();
    let (_server, addr, _ups, downs) = start_echo_server(&server_loop, Config::default());

    let client_loop = EventLoopThread::start("cli-loop".into(), None).unwrap();
    let client = TcpClient::new(client_loop.handle(), addr, "cli");

    let echoed = Arc::new(AtomicUsize::new(0));
    client.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            conn.send(b"ping");
        }
    }));
    {
        let echoed = echoed.clone();
        client.set_message_callback(Arc::new(move |_conn, buf, _| {
            if buf.readable_bytes() >= 4 {
                assert_eq!(&buf.peek()[..4], b"ping");
                buf.retrieve_all();
                echoed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    client.connect();
    assert!(wait_for(
        || echoed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    assert!(client.connection().is_some());

    client.disconnect();
    // Half-close propagates: the server echoes EOF back by closing, the
    // client connection unwinds fully.
    assert!(wait_for(
        || client.connection().is_none(),
        Duration::from_secs(2)
    ));
    assert!(wait_for(
        || downs.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));

    drop(client);
}
