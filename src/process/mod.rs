//! Child process spawning with pipe-redirected standard streams
//!
//! A spawned child runs independently once exec'd; it communicates back
//! only through its pipe descriptors, which the parent wraps as streams
//! observed by the same reactor as every other descriptor. Pipe or fork
//! failure aborts the spawn before any child exists; exec failure inside
//! the child surfaces to the parent only as the pipes going broken.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::rc::{Rc, Weak};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, execvp, fork, pipe2, ForkResult, Pid};
use tracing::debug;

use crate::error::{Error, Result};
use crate::net::{Stream, StreamObserver};
use crate::reactor::{Reactor, Ready};

/// A running child with its three standard streams wrapped for the reactor
///
/// `stdin` is write-only, `stdout`/`stderr` read-only. Each stream
/// independently observes readiness and independently can break; the
/// owning [`crate::service::Service`] treats the group as one lifecycle
/// unit.
pub struct ProcessStream {
    command: String,
    pid: Pid,
    stdin: Stream,
    stdout: Stream,
    stderr: Stream,
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

impl ProcessStream {
    /// Fork and exec `command` with pipes replacing its standard streams
    ///
    /// The child changes into `working_dir` before exec; failure there is
    /// fatal to the child, which exits nonzero immediately. `argv[0]` is
    /// the command itself, followed by `args`. All three parent-side pipe
    /// ends are made non-blocking and registered on the reactor with
    /// `observer` watching every stream.
    pub fn spawn(
        reactor: &Rc<Reactor>,
        command: &str,
        args: &[String],
        working_dir: &Path,
        observer: Weak<dyn StreamObserver>,
    ) -> Result<ProcessStream> {
        // Pipe failures abort here; descriptors created so far close on drop
        let (stdin_read, stdin_write) = pipe2(OFlag::O_CLOEXEC).map_err(spawn_err)?;
        let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC).map_err(spawn_err)?;
        let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC).map_err(spawn_err)?;

        // argv is allocated before fork; after fork the child only makes
        // async-signal-safe calls
        let argv0 = CString::new(command).map_err(|_| Error::Spawn("command contains NUL".into()))?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(argv0.clone());
        for arg in args {
            argv.push(
                CString::new(arg.as_str())
                    .map_err(|_| Error::Spawn("argument contains NUL".into()))?,
            );
        }

        match unsafe { fork() }.map_err(spawn_err)? {
            ForkResult::Child => {
                if chdir(working_dir).is_err() {
                    unsafe { libc::_exit(1) }
                }
                // dup2 clears O_CLOEXEC on the duplicate, so the child
                // keeps exactly its three standard descriptors across exec
                if dup2(stdin_read.as_raw_fd(), 0).is_err()
                    || dup2(stdout_write.as_raw_fd(), 1).is_err()
                    || dup2(stderr_write.as_raw_fd(), 2).is_err()
                {
                    unsafe { libc::_exit(1) }
                }
                let _ = execvp(&argv0, &argv);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop(stdin_read);
                drop(stdout_write);
                drop(stderr_write);

                set_nonblocking(&stdin_write)?;
                set_nonblocking(&stdout_read)?;
                set_nonblocking(&stderr_read)?;

                let stdin = Stream::from_fd(
                    reactor.clone(),
                    stdin_write,
                    Ready::WRITABLE,
                    observer.clone(),
                )?;
                let stdout = Stream::from_fd(
                    reactor.clone(),
                    stdout_read,
                    Ready::READABLE,
                    observer.clone(),
                )?;
                let stderr =
                    Stream::from_fd(reactor.clone(), stderr_read, Ready::READABLE, observer)?;

                debug!(pid = child.as_raw(), command, "spawned child process");
                Ok(ProcessStream {
                    command: command.to_owned(),
                    pid: child,
                    stdin,
                    stdout,
                    stderr,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The child's standard input, write-only
    pub fn stdin(&self) -> &Stream {
        &self.stdin
    }

    pub fn stdout(&self) -> &Stream {
        &self.stdout
    }

    pub fn stderr(&self) -> &Stream {
        &self.stderr
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.pid, signal)?;
        Ok(())
    }

    /// Request graceful termination
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Force-kill the child
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    /// Collect the child's exit status without blocking
    ///
    /// `None` means the child has not exited yet. An ECHILD result means
    /// the child was already collected elsewhere and counts as reaped.
    pub fn try_reap(&self) -> Option<WaitStatus> {
        try_reap_pid(self.pid)
    }
}

/// Non-blocking reap of an arbitrary pid; used for retrying after the
/// owning [`ProcessStream`] is gone
pub fn try_reap_pid(pid: Pid) -> Option<WaitStatus> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => Some(status),
        // Already collected elsewhere
        Err(_) => Some(WaitStatus::Exited(pid, 0)),
    }
}

fn spawn_err(errno: nix::errno::Errno) -> Error {
    Error::Spawn(errno.to_string())
}
