//! Level-triggered epoll backend.
//!
//! Relies on the numeric identity of `EPOLL*` and `POLL*` event bits on
//! Linux, so channels carry one mask format for both backends.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::error::Error;

const INDEX_ADDED: i32 = 1;
const INDEX_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    /// Kernel-filled event buffer; doubled when a wait fills it.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> Result<EpollPoller, Error> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Instant::now();

        if n > 0 {
            let n = n as usize;
            trace!(events = n, "epoll_wait");
            for ev in &self.events[..n] {
                let fd = ev.u64 as RawFd;
                match self.channels.get(&fd) {
                    Some(channel) => {
                        channel.set_revents(ev.events);
                        active.push(channel.clone());
                    }
                    None => trace!(fd, "event for unregistered fd"),
                }
            }
            if n == self.events.len() {
                self.events
                    .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if n == 0 {
            trace!("epoll_wait timed out");
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "epoll_wait");
            }
        }
        now
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let index = channel.index();
        trace!(fd, events = channel.events(), index, "epoll update");

        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&fd));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);

        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    pub fn find(&self, fd: RawFd) -> Option<&Arc<Channel>> {
        self.channels.get(&fd)
    }

    fn ctl(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            error!(
                op,
                fd,
                error = %io::Error::last_os_error(),
                "epoll_ctl"
            );
        }
    }
}
