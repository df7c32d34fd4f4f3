//! Loop-per-thread pool.
//!
//! Each worker thread builds its own `EventLoop` on the stack, hands the
//! handle back over a channel, runs an optional per-thread init callback, and
//! loops until teardown. The pool assigns loops round-robin or by hash for
//! connection affinity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once on each worker loop after it exists, before it polls.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// One worker: an event loop on its own named thread.
pub struct EventLoopThread {
    thread: Option<thread::JoinHandle<()>>,
    handle: LoopHandle,
}

impl EventLoopThread {
    /// Spawn the thread and block until its loop exists.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> Result<EventLoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded::<Result<LoopHandle, Error>>(1);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let handle = event_loop.handle();
                if let Some(init) = init {
                    init(&handle);
                }
                let _ = tx.send(Ok(handle));
                event_loop.run();
            })
            .map_err(|e| Error::ThreadSpawn(e.to_string()))?;

        let handle = rx
            .recv()
            .map_err(|_| Error::ThreadSpawn("worker exited before reporting its loop".into()))??;
        Ok(EventLoopThread {
            thread: Some(thread),
            handle,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

/// N worker loops plus the base loop, with round-robin and hash assignment.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    workers: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> Arc<EventLoopThreadPool> {
        Arc::new(EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Number of worker loops; 0 keeps all I/O on the base loop. Set before
    /// `start`.
    pub fn set_thread_num(&self, n: usize) {
        assert!(!self.started.load(Ordering::Acquire));
        self.num_threads.store(n, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the workers and run `init` on each loop once it exists. With
    /// zero workers, `init` runs on the base loop and no threads spawn.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(!self.started.swap(true, Ordering::AcqRel), "pool started twice");
        let n = self.num_threads.load(Ordering::Acquire);
        debug!(name = %self.name, workers = n, "starting loop pool");

        let mut workers = self.workers.lock();
        let mut loops = self.loops.lock();
        for i in 0..n {
            let worker = EventLoopThread::start(format!("{}-loop-{}", self.name, i), init.clone())?;
            loops.push(worker.handle());
            workers.push(worker);
        }

        if n == 0 {
            if let Some(init) = init {
                let base = self.base.clone();
                self.base.run_in_loop(move || init(&base));
            }
        }
        Ok(())
    }

    /// Next loop, round-robin; the base loop when the pool is empty.
    pub fn next_loop(&self) -> LoopHandle {
        let loops = self.loops.lock();
        if loops.is_empty() {
            self.base.clone()
        } else {
            let i = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[i].clone()
        }
    }

    /// Deterministic assignment by hash, for connection affinity.
    pub fn loop_for_hash(&self, hash: usize) -> LoopHandle {
        let loops = self.loops.lock();
        if loops.is_empty() {
            self.base.clone()
        } else {
            loops[hash % loops.len()].clone()
        }
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }
}

impl Drop for EventLoopThreadPool {
    fn drop(&mut self) {
        debug!(name = %self.name, "loop pool stopping");
        // EventLoopThread::drop quits and joins each worker.
        self.workers.get_mut().clear();
    }
}
