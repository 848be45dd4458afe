//! Edge-triggered epoll backend for the reactor

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::Result;
use crate::reactor::{Poller, Ready};

const MAX_EVENTS: usize = 256;

pub struct EpollPoller {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    fn flags_for(interest: Ready) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLET;
        if interest.is_readable() {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.is_writable() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

impl Poller for EpollPoller {
    fn add(&mut self, fd: RawFd, interest: Ready) -> Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(Self::flags_for(interest), fd as u64);
        self.epoll.add(borrowed, event)?;
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)?;
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Ready)>> {
        let timeout = match timeout {
            Some(duration) => {
                let millis = duration.as_millis().min(u16::MAX as u128) as u16;
                EpollTimeout::from(millis)
            }
            None => EpollTimeout::NONE,
        };
        let count = match self.epoll.wait(&mut self.events, timeout) {
            Ok(count) => count,
            // A signal interrupting the wait is not a reactor failure; the
            // main loop checks the shutdown flag and polls again.
            Err(Errno::EINTR) => 0,
            Err(err) => return Err(err.into()),
        };

        let mut ready = Vec::with_capacity(count);
        for event in &self.events[..count] {
            let flags = event.events();
            let mut mask = Ready::EMPTY;
            // Hangup and error conditions are folded into both directions
            // so the next drain attempt observes the failure and closes
            // the stream.
            if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                mask |= Ready::READABLE;
            }
            if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                mask |= Ready::WRITABLE;
            }
            if !mask.is_empty() {
                ready.push((event.data() as RawFd, mask));
            }
        }
        Ok(ready)
    }
}
