//! Monotonic timer queue backed by a timerfd.
//!
//! One kernel timer fd per loop, armed to the earliest expiration. Timers are
//! ordered by `(expiration, sequence)` — the globally-unique sequence keeps
//! the ordering total for equal expirations and doubles as the cancellation
//! id. Add and cancel marshal onto the owning loop; a cancellation set makes
//! cancel-during-dispatch safe for periodic timers about to be re-inserted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::error::Error;
use crate::event_loop::{LoopShared, WeakLoopShared};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque id for a scheduled timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

struct Timer {
    callback: Box<dyn FnMut() + Send>,
    expiration: Instant,
    /// `Some` makes the timer periodic.
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    fn restart(&mut self, now: Instant) {
        // Restart from the dispatch time, not the scheduled time.
        self.expiration = now + self.interval.expect("restart of one-shot timer");
    }
}

struct TimerQueueState {
    /// Ordered by (expiration, sequence); the dispatch path splits off
    /// everything at or before "now".
    timers: BTreeMap<(Instant, u64), Timer>,
    /// sequence -> current expiration, for cancellation lookup.
    active: HashMap<u64, Instant>,
    /// Cancellations observed while expired callbacks run.
    cancelling: HashSet<u64>,
    calling_expired: bool,
}

pub(crate) struct TimerQueue {
    loop_shared: WeakLoopShared,
    timer_fd: OwnedFd,
    state: Mutex<TimerQueueState>,
}

impl TimerQueue {
    pub fn new(loop_shared: WeakLoopShared) -> Result<Arc<TimerQueue>, Error> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Arc::new(TimerQueue {
            loop_shared,
            timer_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            state: Mutex::new(TimerQueueState {
                timers: BTreeMap::new(),
                active: HashMap::new(),
                cancelling: HashSet::new(),
                calling_expired: false,
            }),
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.timer_fd.as_raw_fd()
    }

    /// Schedule `callback` for `when`, repeating every `interval` if given.
    /// Thread-safe; the insertion runs on the owning loop.
    pub fn add_timer(
        self: &Arc<Self>,
        callback: Box<dyn FnMut() + Send>,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = Timer {
            callback,
            expiration: when,
            interval,
            sequence,
        };
        if let Some(shared) = self.loop_shared.upgrade() {
            let queue = self.clone();
            LoopShared::handle_from(&shared).run_in_loop(move || queue.add_timer_in_loop(timer));
        }
        TimerId(sequence)
    }

    /// Cancel by id. Safe from any thread; a periodic timer cancelled inside
    /// its own callback is dropped instead of re-inserted.
    pub fn cancel(self: &Arc<Self>, id: TimerId) {
        if let Some(shared) = self.loop_shared.upgrade() {
            let queue = self.clone();
            LoopShared::handle_from(&shared).run_in_loop(move || queue.cancel_in_loop(id));
        }
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        let when = timer.expiration;
        let earliest_changed = {
            let mut state = self.state.lock();
            let earliest = state.timers.first_key_value().map(|(key, _)| key.0);
            let changed = earliest.map(|e| when < e).unwrap_or(true);
            state.active.insert(timer.sequence, when);
            state.timers.insert((when, timer.sequence), timer);
            changed
        };
        if earliest_changed {
            self.reset_timer_fd(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        let mut state = self.state.lock();
        if let Some(when) = state.active.remove(&id.0) {
            let removed = state.timers.remove(&(when, id.0));
            assert!(removed.is_some());
            trace!(sequence = id.0, "timer cancelled");
        } else if state.calling_expired {
            state.cancelling.insert(id.0);
        }
    }

    /// Dispatch for the timer fd's readable event.
    pub fn handle_expired(&self) {
        self.read_timer_fd();
        let now = Instant::now();

        let mut expired: Vec<Timer> = {
            let mut state = self.state.lock();
            let remaining = state.timers.split_off(&(now, u64::MAX));
            let expired_map = std::mem::replace(&mut state.timers, remaining);
            let expired: Vec<Timer> = expired_map.into_values().collect();
            for timer in &expired {
                state.active.remove(&timer.sequence);
            }
            state.cancelling.clear();
            state.calling_expired = true;
            expired
        };
        trace!(expired = expired.len(), "timers expired");

        // Callbacks run outside the lock; they may add or cancel timers.
        for timer in &mut expired {
            (timer.callback)();
        }

        let next = {
            let mut state = self.state.lock();
            state.calling_expired = false;
            for mut timer in expired {
                if timer.interval.is_some() && !state.cancelling.contains(&timer.sequence) {
                    timer.restart(now);
                    state.active.insert(timer.sequence, timer.expiration);
                    state.timers.insert((timer.expiration, timer.sequence), timer);
                }
            }
            state.timers.first_key_value().map(|(key, _)| key.0)
        };

        if let Some(when) = next {
            self.reset_timer_fd(when);
        }
    }

    /// Drop all pending timers. Loop teardown path; pending callbacks may
    /// hold handles back to the loop and would otherwise keep it alive.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.timers.clear();
        state.active.clear();
        state.cancelling.clear();
    }

    fn reset_timer_fd(&self, when: Instant) {
        let delta = when
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(100));
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delta.as_secs() as libc::time_t,
                tv_nsec: delta.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.timer_fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            error!(error = %io::Error::last_os_error(), "timerfd_settime");
        }
    }

    fn read_timer_fd(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            warn!(bytes = n, "timer fd read");
        } else {
            trace!(count, "timer fd fired");
        }
    }
}
