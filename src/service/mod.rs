//! Supervised service lifecycle
//!
//! A [`Service`] wraps one named external program with a coarse state
//! machine: Inactive, Active, Failed. The service observes all three
//! streams of its spawned child; any one of them breaking while Active is
//! treated as "the child exited" and the whole group is torn down.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::net::{Stream, StreamEvent, StreamObserver};
use crate::process::{try_reap_pid, ProcessStream};
use crate::reactor::Reactor;

/// Grace period between SIGTERM and the SIGKILL escalation
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Inactive,
    Active,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Inactive => "inactive",
            ServiceState::Active => "active",
            ServiceState::Failed => "failed",
        }
    }
}

struct ServiceInner {
    name: String,
    config: ServiceConfig,
    reactor: Rc<Reactor>,
    state: Cell<ServiceState>,
    // Present iff state == Active
    process: RefCell<Option<ProcessStream>>,
    // Set between stop() and the observed child exit
    stopping: Cell<bool>,
    stop_deadline: Cell<Option<Instant>>,
    // Pid whose exit status still needs collecting
    unreaped: Cell<Option<Pid>>,
}

/// Handle to one supervised service; clones share state
#[derive(Clone)]
pub struct Service {
    inner: Rc<ServiceInner>,
}

impl Service {
    pub fn new(reactor: Rc<Reactor>, name: impl Into<String>, config: ServiceConfig) -> Service {
        Service {
            inner: Rc::new(ServiceInner {
                name: name.into(),
                config,
                reactor,
                state: Cell::new(ServiceState::Inactive),
                process: RefCell::new(None),
                stopping: Cell::new(false),
                stop_deadline: Cell::new(None),
                unreaped: Cell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.get()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn pid(&self) -> Option<Pid> {
        self.inner.process.borrow().as_ref().map(ProcessStream::pid)
    }

    /// One-line state summary for status reporting
    pub fn status_line(&self) -> String {
        match self.pid() {
            Some(pid) => format!(
                "{}: {} (pid {})",
                self.inner.name,
                self.state().as_str(),
                pid.as_raw()
            ),
            None => format!("{}: {}", self.inner.name, self.state().as_str()),
        }
    }

    /// Spawn the configured command; a no-op while already Active
    ///
    /// Spawn failure transitions to Failed and leaves no process behind.
    /// Returns the resulting state.
    pub fn start(&self) -> ServiceState {
        if self.inner.state.get() == ServiceState::Active {
            debug!(service = %self.inner.name, "start ignored, already active");
            return ServiceState::Active;
        }

        let observer = Rc::downgrade(&self.inner) as Weak<dyn StreamObserver>;
        let config = &self.inner.config;
        match ProcessStream::spawn(
            &self.inner.reactor,
            &config.start_command,
            &config.start_arguments,
            Path::new(&config.working_directory),
            observer,
        ) {
            Ok(process) => {
                info!(
                    service = %self.inner.name,
                    pid = process.pid().as_raw(),
                    "service started"
                );
                self.inner.process.replace(Some(process));
                self.inner.state.set(ServiceState::Active);
                self.inner.stopping.set(false);
                self.inner.stop_deadline.set(None);
            }
            Err(err) => {
                warn!(service = %self.inner.name, %err, "service failed to start");
                self.inner.process.replace(None);
                self.inner.state.set(ServiceState::Failed);
            }
        }
        self.inner.state.get()
    }

    /// Request graceful termination
    ///
    /// Sends SIGTERM and arms the grace deadline; the transition to
    /// Inactive happens when the child's streams report broken. The
    /// deadline escalates to SIGKILL from [`Service::tick`].
    pub fn stop(&self) {
        if self.inner.state.get() != ServiceState::Active {
            return;
        }
        let process = self.inner.process.borrow();
        if let Some(process) = process.as_ref() {
            info!(service = %self.inner.name, pid = process.pid().as_raw(), "stopping service");
            self.inner.stopping.set(true);
            self.inner
                .stop_deadline
                .set(Some(Instant::now() + STOP_GRACE_PERIOD));
            if let Err(err) = process.terminate() {
                warn!(service = %self.inner.name, %err, "failed to signal child");
            }
        }
    }

    /// Periodic maintenance, called once per daemon loop tick
    ///
    /// Retries reaping a collected-but-unwaited child and escalates an
    /// expired stop deadline to SIGKILL.
    pub fn tick(&self, now: Instant) {
        if let Some(pid) = self.inner.unreaped.get() {
            if let Some(status) = try_reap_pid(pid) {
                debug!(service = %self.inner.name, ?status, "reaped child");
                self.inner.unreaped.set(None);
            }
        }
        if let Some(deadline) = self.inner.stop_deadline.get() {
            if now >= deadline {
                self.inner.stop_deadline.set(None);
                let process = self.inner.process.borrow();
                if let Some(process) = process.as_ref() {
                    warn!(
                        service = %self.inner.name,
                        pid = process.pid().as_raw(),
                        "grace period expired, killing child"
                    );
                    let _ = process.kill();
                }
            }
        }
    }
}

impl ServiceInner {
    /// One of the child's streams broke: the child is treated as exited
    /// regardless of which stream broke first. Exactly one state
    /// transition happens here; the closes below re-enter this path and
    /// fall out on the state check.
    fn on_child_gone(&self) {
        if self.state.get() != ServiceState::Active {
            return;
        }
        let stopping = self.stopping.replace(false);
        self.state.set(if stopping {
            ServiceState::Inactive
        } else {
            ServiceState::Failed
        });
        self.stop_deadline.set(None);

        let process = self.process.borrow_mut().take();
        if let Some(process) = process {
            let pid = process.pid();
            process.stdin().close();
            process.stdout().close();
            process.stderr().close();
            match process.try_reap() {
                Some(status) => debug!(service = %self.name, ?status, "child exited"),
                None => self.unreaped.set(Some(pid)),
            }
        }

        if stopping {
            info!(service = %self.name, "service stopped");
        } else {
            warn!(service = %self.name, "service process exited unexpectedly, marking failed");
        }
    }
}

impl StreamObserver for ServiceInner {
    fn on_stream_event(&self, stream: &Stream, event: StreamEvent) {
        match event {
            StreamEvent::ReadReady => {
                // Drain child output so the pipe never stalls; forward it
                // to the log at debug level. Consume exactly the viewed
                // bytes, which may exceed what was buffered before the
                // read drained the descriptor.
                let drained = stream.read(1).map(|view| {
                    let text = String::from_utf8_lossy(&view);
                    debug!(service = %self.name, output = %text.trim_end(), "child output");
                    view.len()
                });
                if let Some(drained) = drained {
                    stream.consume(drained);
                }
            }
            StreamEvent::WriteReady => {}
            StreamEvent::Broken => self.on_child_gone(),
        }
    }
}
