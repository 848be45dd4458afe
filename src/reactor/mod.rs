//! Single-threaded readiness-driven event loop
//!
//! The [`Reactor`] owns the OS readiness primitive behind the [`Poller`]
//! trait and maps registered file descriptors to observers. Notification
//! is edge-triggered: an event means "the descriptor changed state since
//! the last check", so every observer must drain its descriptor until it
//! would block within a single [`FdObserver::notify`] call.
//!
//! The reactor never owns application objects. Observers are held as
//! `Weak` back-references; a registration exists exactly as long as the
//! owning object is alive, which is enforced by the descriptor owners in
//! [`crate::net`] deregistering on drop.

pub mod epoll;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::error;

use crate::error::{Error, Result};

/// Readiness mask delivered to observers and used as registration interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready {
    bits: u8,
}

impl Ready {
    pub const EMPTY: Ready = Ready { bits: 0 };
    pub const READABLE: Ready = Ready { bits: 0b01 };
    pub const WRITABLE: Ready = Ready { bits: 0b10 };

    pub fn is_readable(self) -> bool {
        self.bits & Self::READABLE.bits != 0
    }

    pub fn is_writable(self) -> bool {
        self.bits & Self::WRITABLE.bits != 0
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready {
            bits: self.bits | rhs.bits,
        }
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.bits |= rhs.bits;
    }
}

/// Receiver of readiness notifications for one registered descriptor
pub trait FdObserver {
    fn notify(&self, ready: Ready);
}

/// Platform abstraction over the OS readiness primitive
///
/// One concrete edge-triggered implementation exists per platform; Linux
/// uses [`epoll::EpollPoller`]. The contract is OS-independent so the
/// reactor itself carries no platform details.
pub trait Poller {
    fn add(&mut self, fd: RawFd, interest: Ready) -> Result<()>;
    fn delete(&mut self, fd: RawFd) -> Result<()>;
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Ready)>>;
}

/// The event loop core
///
/// Shared as `Rc<Reactor>` between the daemon body and every descriptor
/// owner. Any OS-level failure of registration or the wait call marks the
/// reactor permanently broken; from then on [`Reactor::poll`] fails
/// immediately and the daemon is expected to exit.
pub struct Reactor {
    poller: RefCell<Box<dyn Poller>>,
    observers: RefCell<HashMap<RawFd, Weak<dyn FdObserver>>>,
    broken: Cell<bool>,
}

impl Reactor {
    /// Create a reactor backed by the platform poller
    pub fn new() -> Result<Rc<Reactor>> {
        let poller = epoll::EpollPoller::new()?;
        Ok(Self::with_poller(Box::new(poller)))
    }

    /// Create a reactor over an explicit poller implementation
    pub fn with_poller(poller: Box<dyn Poller>) -> Rc<Reactor> {
        Rc::new(Reactor {
            poller: RefCell::new(poller),
            observers: RefCell::new(HashMap::new()),
            broken: Cell::new(false),
        })
    }

    pub fn is_broken(&self) -> bool {
        self.broken.get()
    }

    /// Register a descriptor with its observer
    ///
    /// Called from descriptor-owner constructors. Registering the same
    /// descriptor twice is a caller bug and surfaces as an OS error.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Ready,
        observer: Weak<dyn FdObserver>,
    ) -> Result<()> {
        if self.broken.get() {
            return Err(Error::ReactorBroken);
        }
        if let Err(err) = self.poller.borrow_mut().add(fd, interest) {
            error!(fd, %err, "failed to register descriptor");
            self.broken.set(true);
            return Err(err);
        }
        self.observers.borrow_mut().insert(fd, observer);
        Ok(())
    }

    /// Remove a registration; idempotent
    ///
    /// Called from descriptor-owner destructors, so it must tolerate being
    /// invoked after the registration is already gone.
    pub fn deregister(&self, fd: RawFd) {
        if self.observers.borrow_mut().remove(&fd).is_none() {
            return;
        }
        if self.broken.get() {
            return;
        }
        if let Err(err) = self.poller.borrow_mut().delete(fd) {
            error!(fd, %err, "failed to deregister descriptor");
            self.broken.set(true);
        }
    }

    /// Perform one wait on the readiness primitive and dispatch
    ///
    /// The ready set is snapshotted before any observer runs, so observers
    /// may register and deregister descriptors freely from inside
    /// `notify` (accepting a connection creates new registrations
    /// mid-dispatch). A descriptor whose observer died or deregistered
    /// between snapshot and dispatch is skipped.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        if self.broken.get() {
            return Err(Error::ReactorBroken);
        }
        let events = match self.poller.borrow_mut().wait(timeout) {
            Ok(events) => events,
            Err(err) => {
                error!(%err, "readiness wait failed");
                self.broken.set(true);
                return Err(Error::ReactorBroken);
            }
        };
        for (fd, ready) in events {
            let observer = self.observers.borrow().get(&fd).cloned();
            if let Some(weak) = observer {
                if let Some(observer) = weak.upgrade() {
                    observer.notify(ready);
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn registration_count(&self) -> usize {
        self.observers.borrow().len()
    }
}
