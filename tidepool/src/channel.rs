//! Per-fd dispatch object.
//!
//! A `Channel` binds a file descriptor to handler callbacks and to the loop
//! that owns the fd. It never owns the fd — the acceptor, connector, and
//! connection own their sockets and close them; the wakeup and timer fds are
//! owned by the loop. Interest changes re-register the channel with the
//! owning loop's demultiplexer and must happen on the loop thread.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::event_loop::LoopHandle;

pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_READ: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const EVENT_WRITE: u32 = libc::POLLOUT as u32;

const POLL_IN: u32 = libc::POLLIN as u32;
const POLL_PRI: u32 = libc::POLLPRI as u32;
const POLL_OUT: u32 = libc::POLLOUT as u32;
const POLL_HUP: u32 = libc::POLLHUP as u32;
const POLL_ERR: u32 = libc::POLLERR as u32;
const POLL_NVAL: u32 = libc::POLLNVAL as u32;
const POLL_RDHUP: u32 = libc::POLLRDHUP as u32;

/// Demultiplexer bookkeeping slot. `-1` means never registered; the epoll
/// backend stores added/deleted marks, the poll backend stores the position
/// in its pollfd vector.
pub(crate) const INDEX_NEW: i32 = -1;

pub(crate) type ReadCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub(crate) type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct ChannelState {
    /// Interest mask (EVENT_READ | EVENT_WRITE bits).
    events: u32,
    /// Ready mask set by the demultiplexer before dispatch.
    revents: u32,
    /// Per-demultiplexer slot, see `INDEX_NEW`.
    index: i32,
    added_to_loop: bool,
    handling_event: bool,
    tied: bool,
    log_hup: bool,
}

#[derive(Default)]
struct Handlers {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// A channel binds one fd to handlers and to its owning loop.
pub struct Channel {
    loop_handle: LoopHandle,
    fd: RawFd,
    state: Mutex<ChannelState>,
    handlers: Mutex<Handlers>,
    /// Weak back-reference to the owner; dispatch upgrades it first and skips
    /// entirely if the owner is gone.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub fn new(loop_handle: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            loop_handle,
            fd,
            state: Mutex::new(ChannelState {
                events: EVENT_NONE,
                revents: EVENT_NONE,
                index: INDEX_NEW,
                added_to_loop: false,
                handling_event: false,
                tied: false,
                log_hup: true,
            }),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub(crate) fn set_read_callback(&self, cb: ReadCallback) {
        self.handlers.lock().read = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.handlers.lock().write = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.handlers.lock().close = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.handlers.lock().error = Some(cb);
    }

    /// Install a weak back-reference to the owner. While installed, dispatch
    /// only proceeds if the owner is still alive, and holds a strong
    /// reference to it for the duration — the owner cannot be destroyed by
    /// its own handler.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(owner);
        self.state.lock().tied = true;
    }

    #[inline]
    pub(crate) fn events(&self) -> u32 {
        self.state.lock().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.state.lock().revents = revents;
    }

    pub(crate) fn index(&self) -> i32 {
        self.state.lock().index
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.state.lock().index = index;
    }

    pub fn is_none_event(&self) -> bool {
        self.state.lock().events == EVENT_NONE
    }

    pub fn is_reading(&self) -> bool {
        self.state.lock().events & EVENT_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().events & EVENT_WRITE != 0
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.state.lock().events |= EVENT_READ;
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.state.lock().events &= !EVENT_READ;
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.state.lock().events |= EVENT_WRITE;
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.state.lock().events &= !EVENT_WRITE;
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.state.lock().events = EVENT_NONE;
        self.update();
    }

    fn update(self: &Arc<Self>) {
        self.state.lock().added_to_loop = true;
        self.loop_handle.update_channel(self);
    }

    /// Unregister from the owning loop. Interest must already be disabled.
    pub fn remove(self: &Arc<Self>) {
        assert!(self.is_none_event());
        let registered = {
            let mut state = self.state.lock();
            let was = state.added_to_loop;
            state.added_to_loop = false;
            was
        };
        if registered {
            self.loop_handle.remove_channel(self);
        } else {
            trace!(fd = self.fd, "remove on unregistered channel");
        }
    }

    /// Dispatch the ready events to the installed handlers.
    pub(crate) fn handle_event(self: &Arc<Self>, receive_time: Instant) {
        let tied = self.state.lock().tied;
        if tied {
            // Hold the owner alive across dispatch; skip if it is already gone.
            let guard = self.tie.lock().as_ref().and_then(|w| w.upgrade());
            if guard.is_some() {
                self.handle_event_with_guard(receive_time);
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(self: &Arc<Self>, receive_time: Instant) {
        let (revents, log_hup) = {
            let mut state = self.state.lock();
            state.handling_event = true;
            (state.revents, state.log_hup)
        };
        trace!(fd = self.fd, revents, "dispatch");

        if revents & POLL_HUP != 0 && revents & POLL_IN == 0 {
            if log_hup {
                warn!(fd = self.fd, "POLLHUP");
            }
            self.invoke(|h| h.close.clone());
        }

        if revents & POLL_NVAL != 0 {
            warn!(fd = self.fd, "POLLNVAL");
        }

        if revents & (POLL_ERR | POLL_NVAL) != 0 {
            self.invoke(|h| h.error.clone());
        }

        if revents & (POLL_IN | POLL_PRI | POLL_RDHUP) != 0 {
            let cb = self.handlers.lock().read.clone();
            if let Some(cb) = cb {
                cb(receive_time);
            }
        }

        if revents & POLL_OUT != 0 {
            self.invoke(|h| h.write.clone());
        }

        self.state.lock().handling_event = false;
    }

    fn invoke(&self, pick: impl FnOnce(&Handlers) -> Option<EventCallback>) {
        let cb = pick(&self.handlers.lock());
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let state = self.state.get_mut();
        assert!(!state.handling_event, "channel destroyed mid-dispatch");
        assert!(!state.added_to_loop, "channel destroyed while registered");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &state.events)
            .field("revents", &state.revents)
            .field("index", &state.index)
            .finish()
    }
}
