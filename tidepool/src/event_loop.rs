//! Single-threaded reactor.
//!
//! An `EventLoop` is created on the thread that will run it and never leaves
//! that thread; a thread-local flag enforces at most one loop per thread.
//! `LoopHandle` is the `Send + Sync` surface other threads use: it marshals
//! tasks onto the loop through a mutex-guarded queue and preempts the
//! demultiplexer with an eventfd write. All loop state is mutated only on the
//! owning thread — every public mutator either runs there or enqueues.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::config::POLL_TIMEOUT_MS;
use crate::error::Error;
use crate::poller::Poller;
use crate::timer::{TimerId, TimerQueue};

thread_local! {
    static LOOP_BOUND: Cell<bool> = const { Cell::new(false) };
}

static IGNORE_SIGPIPE: std::sync::Once = std::sync::Once::new();

type Task = Box<dyn FnOnce() + Send>;

/// State shared between the loop and its handles.
pub(crate) struct LoopShared {
    owner: ThreadId,
    wakeup_fd: OwnedFd,
    poller: Mutex<Poller>,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    looping: AtomicBool,
    handling_events: AtomicBool,
    iteration: AtomicU64,
    poll_return: Mutex<Instant>,
    timer_queue: OnceLock<Arc<TimerQueue>>,
}

impl LoopShared {
    pub(crate) fn handle_from(shared: &Arc<LoopShared>) -> LoopHandle {
        LoopHandle {
            shared: shared.clone(),
        }
    }
}

/// The reactor. Owned by exactly one thread; not `Send`.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    wakeup_channel: Arc<Channel>,
    timer_channel: Arc<Channel>,
    active_channels: Vec<Arc<Channel>>,
    current_active: Option<RawFd>,
    // EventLoop must stay on its creating thread.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl EventLoop {
    /// Create a loop bound to the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> Result<EventLoop, Error> {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });
        LOOP_BOUND.with(|bound| {
            assert!(
                !bound.get(),
                "another EventLoop already exists on this thread"
            );
            bound.set(true);
        });

        let wakeup_fd = new_eventfd()?;
        let poller = Poller::new_default()?;

        let shared = Arc::new(LoopShared {
            owner: thread::current().id(),
            wakeup_fd,
            poller: Mutex::new(poller),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            handling_events: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return: Mutex::new(Instant::now()),
            timer_queue: OnceLock::new(),
        });
        let handle = LoopShared::handle_from(&shared);

        let timer_queue = TimerQueue::new(Arc::downgrade(&shared))?;
        let _ = shared.timer_queue.set(timer_queue.clone());

        let wakeup_channel = Channel::new(handle.clone(), shared.wakeup_fd.as_raw_fd());
        let weak = Arc::downgrade(&shared);
        wakeup_channel.set_read_callback(Arc::new(move |_| {
            if let Some(shared) = weak.upgrade() {
                read_wakeup_fd(&shared);
            }
        }));
        wakeup_channel.enable_reading();

        let timer_channel = Channel::new(handle, timer_queue.fd());
        let queue = timer_queue.clone();
        timer_channel.set_read_callback(Arc::new(move |_| queue.handle_expired()));
        timer_channel.enable_reading();

        debug!(wakeup_fd = shared.wakeup_fd.as_raw_fd(), "event loop created");
        Ok(EventLoop {
            shared,
            wakeup_channel,
            timer_channel,
            active_channels: Vec::new(),
            current_active: None,
            _not_send: std::marker::PhantomData,
        })
    }

    /// The cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopShared::handle_from(&self.shared)
    }

    /// Run until `quit()`. Only callable on the owning thread.
    ///
    /// Each iteration polls readiness (10 s ceiling), dispatches the ready
    /// channels in demultiplexer order, then drains the deferred-task queue.
    pub fn run(&mut self) {
        let shared = self.shared.clone();
        assert_eq!(
            thread::current().id(),
            shared.owner,
            "EventLoop::run called off the owner thread"
        );
        assert!(!shared.looping.swap(true, Ordering::AcqRel));
        // quit() may already have been called between construction and run;
        // the flag is never reset, so that request still honors.
        debug!("event loop running");

        while !shared.quit.load(Ordering::Acquire) {
            self.active_channels.clear();
            let poll_return = shared
                .poller
                .lock()
                .poll(POLL_TIMEOUT_MS, &mut self.active_channels);
            *shared.poll_return.lock() = poll_return;
            let iteration = shared.iteration.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(iteration, active = self.active_channels.len(), "poll returned");

            shared.handling_events.store(true, Ordering::Release);
            for i in 0..self.active_channels.len() {
                let channel = self.active_channels[i].clone();
                self.current_active = Some(channel.fd());
                channel.handle_event(poll_return);
            }
            self.current_active = None;
            shared.handling_events.store(false, Ordering::Release);

            self.do_pending_tasks();
        }

        shared.looping.store(false, Ordering::Release);
        debug!("event loop stopped");
    }

    /// Swap the queue under the mutex, run the tasks outside it. Tasks queued
    /// while this runs land in the next iteration; `calling_pending` makes
    /// their enqueue wake the loop so the next poll returns immediately.
    fn do_pending_tasks(&mut self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.shared.pending.lock());
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("event loop destroyed");
        if let Some(timer_queue) = self.shared.timer_queue.get() {
            timer_queue.clear();
        }
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        self.timer_channel.disable_all();
        self.timer_channel.remove();
        LOOP_BOUND.with(|bound| bound.set(false));
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("owner", &self.shared.owner)
            .field("iteration", &self.shared.iteration.load(Ordering::Relaxed))
            .field("current_active", &self.current_active)
            .finish()
    }
}

/// Cloneable, `Send + Sync` reference to a loop.
///
/// Two handles compare equal when they refer to the same loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop state touched off the owner thread"
        );
    }

    /// Run `task` on the loop thread: immediately when called there,
    /// otherwise enqueued for the current or next iteration's drain.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` for the loop's deferred drain.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().push(Box::new(task));
        // A task queued from the loop thread outside the drain is picked up
        // by the drain at the end of this iteration; anything else might be
        // missed, so preempt the poll.
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Ask the loop to stop. Advisory: the in-flight poll finishes first.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Whether the loop is currently inside channel dispatch.
    pub fn is_handling_events(&self) -> bool {
        self.shared.handling_events.load(Ordering::Acquire)
    }

    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent demultiplexer return.
    pub fn poll_return_time(&self) -> Instant {
        *self.shared.poll_return.lock()
    }

    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Run `cb` at `when`. Thread-safe; marshals onto the loop.
    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue().add_timer(Box::new(cb), when, None)
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Run `cb` every `interval`, first fire one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue()
            .add_timer(Box::new(cb), Instant::now() + interval, Some(interval))
    }

    /// Cancel a timer. Safe from any thread, including from inside the
    /// timer's own callback.
    pub fn cancel(&self, id: TimerId) {
        self.timer_queue().cancel(id);
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.shared.poller.lock().has_channel(channel)
    }

    fn timer_queue(&self) -> &Arc<TimerQueue> {
        self.shared
            .timer_queue
            .get()
            .expect("timer queue not initialized")
    }

    fn wakeup(&self) {
        write_wakeup_fd(&self.shared);
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner", &self.shared.owner)
            .finish()
    }
}

pub(crate) type WeakLoopShared = Weak<LoopShared>;

fn new_eventfd() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn write_wakeup_fd(shared: &LoopShared) {
    let one: u64 = 1;
    let n = unsafe {
        libc::write(
            shared.wakeup_fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            8,
        )
    };
    if n != 8 {
        error!(bytes = n, "wakeup fd write");
    }
}

fn read_wakeup_fd(shared: &LoopShared) {
    let mut one: u64 = 0;
    let n = unsafe {
        libc::read(
            shared.wakeup_fd.as_raw_fd(),
            &mut one as *mut u64 as *mut libc::c_void,
            8,
        )
    };
    if n != 8 {
        error!(bytes = n, "wakeup fd read");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_loop_on_owner_thread_is_immediate() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn quit_from_timer_stops_run() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let quitter = handle.clone();
        handle.run_after(Duration::from_millis(20), move || quitter.quit());
        let start = Instant::now();
        event_loop.run();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cross_thread_tasks_run_before_quit() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let count = Arc::new(AtomicUsize::new(0));

        let worker = {
            let handle = handle.clone();
            let count = count.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let count = count.clone();
                    handle.queue_in_loop(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                }
                // Tasks drain FIFO, so quitting via the queue runs after all
                // hundred increments.
                let quitter = handle.clone();
                handle.queue_in_loop(move || quitter.quit());
            })
        };

        event_loop.run();
        worker.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn channel_dispatches_readable_fd() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let dispatched = Arc::new(AtomicUsize::new(0));
        let channel = Channel::new(handle.clone(), rd);
        let count = dispatched.clone();
        let quitter = handle.clone();
        channel.set_read_callback(Arc::new(move |_receive_time| {
            let mut buf = [0u8; 8];
            unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            count.fetch_add(1, Ordering::SeqCst);
            quitter.quit();
        }));
        channel.enable_reading();
        assert!(handle.has_channel(&channel));

        unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
        event_loop.run();
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);

        channel.disable_all();
        channel.remove();
        assert!(!handle.has_channel(&channel));
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn one_loop_per_thread() {
        let handle = thread::spawn(|| {
            let _event_loop = EventLoop::new().unwrap();
            let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(EventLoop::new));
            assert!(second.is_err());
        });
        handle.join().unwrap();
    }

    #[test]
    fn handles_compare_by_loop() {
        let event_loop = EventLoop::new().unwrap();
        let a = event_loop.handle();
        let b = event_loop.handle();
        assert_eq!(a, b);
    }
}
