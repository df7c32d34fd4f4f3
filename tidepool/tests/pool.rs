//! Loop-pool assignment: round-robin, hash affinity, base-loop fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tidepool::{EventLoopThread, EventLoopThreadPool};

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
fn hash_assignment_is_deterministic_and_covers_all_loops() {
    let base = EventLoopThread::start("pool-base".into(), None).unwrap();
    let pool = EventLoopThreadPool::new(base.handle(), "pool");
    pool.set_thread_num(4);
    pool.start(None).unwrap();

    let loops = pool.all_loops();
    assert_eq!(loops.len(), 4);
    for handle in &loops {
        assert_ne!(handle, &base.handle());
    }

    // Same hash, same loop.
    for h in 0..16usize {
        assert_eq!(pool.loop_for_hash(h), pool.loop_for_hash(h));
    }
    // Varying hash covers all four loops.
    for h in 0..4usize {
        assert_eq!(pool.loop_for_hash(h), loops[h]);
        assert_eq!(pool.loop_for_hash(h + 4), loops[h]);
    }
}

#[test]
fn next_loop_round_robins() {
    let base = EventLoopThread::start("rr-base".into(), None).unwrap();
    let pool = EventLoopThreadPool::new(base.handle(), "rr");
    pool.set_thread_num(3);
    pool.start(None).unwrap();

    let loops = pool.all_loops();
    for round in 0..3 {
        for expected in &loops {
            let got = pool.next_loop();
            assert_eq!(&got, expected, "round {round}");
        }
    }
}

#[test]
fn empty_pool_falls_back_to_base_loop() {
    let base = EventLoopThread::start("solo-base".into(), None).unwrap();
    let pool = EventLoopThreadPool::new(base.handle(), "solo");

    let init_runs = Arc::new(AtomicUsize::new(0));
    {
        let init_runs = init_runs.clone();
        let base_handle = base.handle();
        pool.start(Some(Arc::new(move |handle| {
            assert_eq!(handle, &base_handle);
            assert!(handle.is_in_loop_thread());
            init_runs.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    }

    assert!(wait_for(
        || init_runs.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    assert_eq!(pool.next_loop(), base.handle());
    assert_eq!(pool.loop_for_hash(42), base.handle());
    assert_eq!(pool.all_loops(), vec![base.handle()]);
}

#[test]
fn init_callback_runs_on_every_worker() {
    let base = EventLoopThread::start("init-base".into(), None).unwrap();
    let pool = EventLoopThreadPool::new(base.handle(), "init");
    pool.set_thread_num(4);

    let init_runs = Arc::new(AtomicUsize::new(0));
    {
        let init_runs = init_runs.clone();
        pool.start(Some(Arc::new(move |handle| {
            assert!(handle.is_in_loop_thread());
            init_runs.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    }
    assert_eq!(init_runs.load(Ordering::SeqCst), 4);
}
