//! Readiness demultiplexing.
//!
//! Two level-triggered backends share one interface: epoll (default) and
//! poll(2) (fallback). Selection is a tagged choice made once per loop from
//! the environment, not runtime polymorphism.

mod epoll;
mod poll;

use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;
use crate::error::Error;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

/// Set this environment variable to select the poll(2) backend.
pub const USE_POLL_ENV: &str = "TIDEPOOL_USE_POLL";

pub(crate) enum Poller {
    Epoll(EpollPoller),
    Poll(PollPoller),
}

impl Poller {
    /// Build the default backend for a new loop: epoll, unless
    /// `TIDEPOOL_USE_POLL` is set in the environment.
    pub fn new_default() -> Result<Poller, Error> {
        if std::env::var_os(USE_POLL_ENV).is_some() {
            Ok(Poller::Poll(PollPoller::new()))
        } else {
            Ok(Poller::Epoll(EpollPoller::new()?))
        }
    }

    /// Block up to `timeout_ms` for readiness. Ready channels are pushed onto
    /// `active` with their received-event masks set; returns the time the
    /// wait completed. Signal interruption returns with no ready channels.
    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        match self {
            Poller::Epoll(p) => p.poll(timeout_ms, active),
            Poller::Poll(p) => p.poll(timeout_ms, active),
        }
    }

    /// Register a new channel or refresh an existing channel's interest.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Epoll(p) => p.update_channel(channel),
            Poller::Poll(p) => p.update_channel(channel),
        }
    }

    /// Unregister a channel whose interest is already disabled.
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Epoll(p) => p.remove_channel(channel),
            Poller::Poll(p) => p.remove_channel(channel),
        }
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        let slot = match self {
            Poller::Epoll(p) => p.find(channel.fd()),
            Poller::Poll(p) => p.find(channel.fd()),
        };
        slot.map(|ch| Arc::ptr_eq(ch, channel)).unwrap_or(false)
    }
}
