//! Timer queue behavior under a live loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidepool::{EventLoopThread, TimerId};

fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn run_after_fires_once() {
    let worker = EventLoopThread::start("timer-once".into(), None).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    worker.handle().run_after(Duration::from_millis(50), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_for(
        || fired.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn run_every_fires_periodically() {
    let worker = EventLoopThread::start("timer-periodic".into(), None).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    let id = worker.handle().run_every(Duration::from_millis(100), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(1050));
    worker.handle().cancel(id);
    let seen = fired.load(Ordering::SeqCst);
    // ~10 fires in 1.05 s; slack for scheduler noise.
    assert!((8..=12).contains(&seen), "fired {seen} times");

    // No further fires after cancel.
    thread::sleep(Duration::from_millis(300));
    let after = fired.load(Ordering::SeqCst);
    assert!(after <= seen + 1, "fired after cancel: {seen} -> {after}");
}

#[test]
fn cancel_before_fire() {
    let worker = EventLoopThread::start("timer-cancel".into(), None).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    let id = worker.handle().run_after(Duration::from_millis(200), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    worker.handle().cancel(id);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn periodic_timer_cancelled_in_own_callback() {
    let worker = EventLoopThread::start("timer-self-cancel".into(), None).unwrap();
    let handle = worker.handle();

    let fired = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let count = fired.clone();
    let slot = id_slot.clone();
    let canceller = handle.clone();
    let id = handle.run_every(Duration::from_millis(100), move || {
        let n = count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            // Cancelling inside the callback must drop the pending
            // re-insertion.
            let id = (*slot.lock()).expect("timer id published");
            canceller.cancel(id);
        }
    });
    *id_slot.lock() = Some(id);

    assert!(wait_for(
        || fired.load(Ordering::SeqCst) == 3,
        Duration::from_secs(3)
    ));
    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn timers_fire_in_expiration_order() {
    let worker = EventLoopThread::start("timer-order".into(), None).unwrap();
    let handle = worker.handle();
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    for (delay_ms, tag) in [(150u64, 3u32), (50, 1), (100, 2)] {
        let order = order.clone();
        handle.run_after(Duration::from_millis(delay_ms), move || {
            order.lock().push(tag);
        });
    }

    assert!(wait_for(|| order.lock().len() == 3, Duration::from_secs(2)));
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}
