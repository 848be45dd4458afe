//! Shutdown signal handling
//!
//! The daemon reacts to exactly one signal-driven condition: "shutdown
//! requested". SIGINT and SIGTERM set an atomic flag that the main loop
//! checks once per tick before blocking in the reactor again. No other
//! logic runs in signal context.

use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Atomically readable shutdown flag set from signal context
#[derive(Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register SIGINT/SIGTERM to set the flag, and ignore SIGPIPE so a
    /// write to a closed pipe surfaces as EPIPE on the stream instead of
    /// killing the daemon.
    pub fn register(&self) -> Result<()> {
        flag::register(SIGTERM, Arc::clone(&self.flag))?;
        flag::register(SIGINT, Arc::clone(&self.flag))?;
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
        Ok(())
    }

    /// Check whether shutdown was requested
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown from inside the process
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_clear() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_set_is_visible_through_clones() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        flag.set();
        assert!(clone.is_set());
    }
}
