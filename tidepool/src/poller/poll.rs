//! poll(2) fallback backend.
//!
//! The channel index is its position in the pollfd vector, which makes
//! unregistration a swap-remove. A channel with no interest keeps its slot
//! but negates the fd so the kernel ignores it.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use crate::channel::{Channel, INDEX_NEW};

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Instant::now();

        if n > 0 {
            trace!(events = n, "poll");
            let mut left = n;
            for pfd in &self.pollfds {
                if left == 0 {
                    break;
                }
                if pfd.revents == 0 {
                    continue;
                }
                left -= 1;
                let fd = if pfd.fd >= 0 { pfd.fd } else { -pfd.fd - 1 };
                match self.channels.get(&fd) {
                    Some(channel) => {
                        channel.set_revents(pfd.revents as u16 as u32);
                        active.push(channel.clone());
                    }
                    None => trace!(fd, "event for unregistered fd"),
                }
            }
        } else if n == 0 {
            trace!("poll timed out");
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "poll");
            }
        }
        now
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let index = channel.index();
        trace!(fd, events = channel.events(), index, "poll update");

        if index == INDEX_NEW {
            assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd: if channel.is_none_event() { -fd - 1 } else { fd },
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            assert!(self.channels.contains_key(&fd));
            assert!(index >= 0 && (index as usize) < self.pollfds.len());
            let pfd = &mut self.pollfds[index as usize];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.events = channel.events() as libc::c_short;
            pfd.revents = 0;
            // Negative fds are skipped by poll(2); restore on re-enable.
            pfd.fd = if channel.is_none_event() { -fd - 1 } else { fd };
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index >= 0 && (index as usize) < self.pollfds.len());

        self.channels.remove(&fd);
        let index = index as usize;
        if index == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            // Swap the last slot into the vacated position and repoint its
            // channel's index.
            let moved = *self.pollfds.last().unwrap();
            let moved_fd = if moved.fd >= 0 { moved.fd } else { -moved.fd - 1 };
            self.pollfds.swap_remove(index);
            if let Some(moved_channel) = self.channels.get(&moved_fd) {
                moved_channel.set_index(index as i32);
            }
        }
        channel.set_index(INDEX_NEW);
    }

    pub fn find(&self, fd: RawFd) -> Option<&Arc<Channel>> {
        self.channels.get(&fd)
    }
}
