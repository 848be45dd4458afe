//! Buffered non-blocking streams over local domain sockets and pipes
//!
//! Every object here is a descriptor owner: it registers with the reactor
//! on construction and deregisters on close or drop, so the reactor never
//! holds a registration for a dead object. Streams drain their descriptor
//! fully on each edge-triggered notification and buffer in growable byte
//! vectors; the unsent remainder of a partial send is compacted to the
//! front of the write buffer.

use std::cell::{Ref, RefCell};
use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::reactor::{FdObserver, Reactor, Ready};

const READ_CHUNK_SIZE: usize = 4096;

/// Stable connection identifier, unique for the process lifetime
///
/// Used as the dispatcher's lookup key instead of the raw descriptor:
/// the OS reuses descriptor numbers after close, which would let a stale
/// lookup resolve to an unrelated connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Stream state transitions delivered to the owning observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    ReadReady,
    WriteReady,
    /// Fired exactly once, at the transition to broken
    Broken,
}

pub trait StreamObserver {
    fn on_stream_event(&self, stream: &Stream, event: StreamEvent);
}

/// Result of draining a descriptor in one direction
enum Drain {
    /// Drained until it would block; descriptor still healthy
    WouldBlock,
    /// Orderly close or critical error; the stream must break
    Closed,
}

struct StreamState {
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    read_ready: bool,
    write_ready: bool,
    broken: bool,
}

struct StreamInner {
    reactor: Rc<Reactor>,
    fd: OwnedFd,
    id: ConnectionId,
    state: RefCell<StreamState>,
    observer: RefCell<Weak<dyn StreamObserver>>,
    self_weak: Weak<StreamInner>,
}

/// A buffered, non-blocking bidirectional byte channel
///
/// Cheap to clone; all clones refer to the same underlying descriptor
/// and buffers.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<StreamInner>,
}

impl Stream {
    /// Wrap an owned descriptor and register it with the reactor
    ///
    /// `interest` restricts registration for unidirectional descriptors:
    /// pipe read ends register readable-only, write ends writable-only.
    pub fn from_fd(
        reactor: Rc<Reactor>,
        fd: OwnedFd,
        interest: Ready,
        observer: Weak<dyn StreamObserver>,
    ) -> Result<Stream> {
        let inner = Rc::new_cyclic(|self_weak| StreamInner {
            reactor,
            fd,
            id: next_connection_id(),
            state: RefCell::new(StreamState {
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                read_ready: true,
                write_ready: true,
                broken: false,
            }),
            observer: RefCell::new(observer),
            self_weak: self_weak.clone(),
        });
        let weak = Rc::downgrade(&inner) as Weak<dyn FdObserver>;
        inner
            .reactor
            .register(inner.fd.as_raw_fd(), interest, weak)?;
        Ok(Stream { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }

    /// Replace the state observer
    pub fn set_observer(&self, observer: Weak<dyn StreamObserver>) {
        *self.inner.observer.borrow_mut() = observer;
    }

    /// Append bytes to the write buffer and attempt an immediate flush
    ///
    /// A no-op on a broken stream. A critical error during the flush
    /// closes the stream and fires the broken notification.
    pub fn write(&self, bytes: Vec<u8>) {
        let closed = {
            let mut state = self.inner.state.borrow_mut();
            if state.broken {
                return;
            }
            if state.write_buf.is_empty() {
                state.write_buf = bytes;
            } else {
                state.write_buf.extend_from_slice(&bytes);
            }
            if state.write_ready {
                matches!(
                    StreamInner::drain_write(self.inner.fd.as_raw_fd(), &mut state),
                    Drain::Closed
                )
            } else {
                false
            }
        };
        if closed && self.inner.mark_broken() {
            self.inner.emit(StreamEvent::Broken);
        }
    }

    /// View at least `n` buffered bytes, draining the descriptor first if
    /// the buffer is short
    ///
    /// Returns the whole read buffer on success so a caller can parse as
    /// much as it likes; `None` means fewer than `n` bytes are available
    /// and the caller should retry on the next readiness notification.
    /// The returned borrow must be dropped before calling
    /// [`Stream::consume`] or [`Stream::write`].
    pub fn read(&self, n: usize) -> Option<Ref<'_, [u8]>> {
        let needs_drain = {
            let state = self.inner.state.borrow();
            !state.broken && state.read_buf.len() < n && state.read_ready
        };
        if needs_drain {
            let closed = {
                let mut state = self.inner.state.borrow_mut();
                matches!(
                    StreamInner::drain_read(self.inner.fd.as_raw_fd(), &mut state),
                    Drain::Closed
                )
            };
            if closed && self.inner.mark_broken() {
                self.inner.emit(StreamEvent::Broken);
            }
        }
        let state = self.inner.state.borrow();
        if state.read_buf.len() < n {
            return None;
        }
        Some(Ref::map(state, |state| state.read_buf.as_slice()))
    }

    /// Advance the read cursor past `n` parsed bytes
    pub fn consume(&self, n: usize) {
        let mut state = self.inner.state.borrow_mut();
        let n = n.min(state.read_buf.len());
        state.read_buf.drain(..n);
    }

    /// Number of buffered unread bytes
    pub fn buffered(&self) -> usize {
        self.inner.state.borrow().read_buf.len()
    }

    pub fn has_write_queued(&self) -> bool {
        !self.inner.state.borrow().write_buf.is_empty()
    }

    pub fn is_broken(&self) -> bool {
        self.inner.state.borrow().broken
    }

    /// Idempotently mark the stream broken and fire the broken
    /// notification exactly once
    pub fn close(&self) {
        if self.inner.mark_broken() {
            self.inner.emit(StreamEvent::Broken);
        }
    }
}

impl StreamInner {
    /// Transition to broken; returns whether this call made the
    /// transition. The registration is removed here so no further
    /// readiness callback reaches this stream.
    fn mark_broken(&self) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if state.broken {
                return false;
            }
            state.broken = true;
            state.read_ready = false;
            state.write_ready = false;
        }
        self.reactor.deregister(self.fd.as_raw_fd());
        true
    }

    /// Send from the buffer start until it would block, compacting the
    /// unsent remainder to the front
    fn drain_write(fd: RawFd, state: &mut StreamState) -> Drain {
        while state.write_ready && !state.write_buf.is_empty() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match nix::unistd::write(borrowed, &state.write_buf) {
                Ok(0) => {
                    state.write_ready = false;
                    return Drain::Closed;
                }
                Ok(n) => {
                    state.write_buf.drain(..n);
                }
                Err(Errno::EAGAIN) => {
                    state.write_ready = false;
                    return Drain::WouldBlock;
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    trace!(fd, %err, "write failed");
                    state.write_ready = false;
                    return Drain::Closed;
                }
            }
        }
        Drain::WouldBlock
    }

    /// Read until it would block, appending to the read buffer
    fn drain_read(fd: RawFd, state: &mut StreamState) -> Drain {
        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match nix::unistd::read(fd, &mut chunk) {
                Ok(0) => {
                    state.read_ready = false;
                    return Drain::Closed;
                }
                Ok(n) => {
                    state.read_buf.extend_from_slice(&chunk[..n]);
                }
                Err(Errno::EAGAIN) => {
                    state.read_ready = false;
                    return Drain::WouldBlock;
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    trace!(fd, %err, "read failed");
                    state.read_ready = false;
                    return Drain::Closed;
                }
            }
        }
    }

    /// Deliver one event to the observer with no internal borrows held
    ///
    /// Handlers run inside this call and may read, write, or close the
    /// stream. Readiness events for an already-broken stream are
    /// suppressed so no handler observes I/O readiness after the broken
    /// notification.
    fn emit(&self, event: StreamEvent) {
        let Some(inner) = self.self_weak.upgrade() else {
            return;
        };
        let Some(observer) = self.observer.borrow().upgrade() else {
            return;
        };
        let stream = Stream { inner };
        if event != StreamEvent::Broken && stream.is_broken() {
            return;
        }
        observer.on_stream_event(&stream, event);
    }
}

impl FdObserver for StreamInner {
    fn notify(&self, ready: Ready) {
        if self.state.borrow().broken {
            return;
        }
        if ready.is_writable() {
            let closed = {
                let mut state = self.state.borrow_mut();
                state.write_ready = true;
                matches!(
                    Self::drain_write(self.fd.as_raw_fd(), &mut state),
                    Drain::Closed
                )
            };
            if closed {
                if self.mark_broken() {
                    self.emit(StreamEvent::Broken);
                }
                return;
            }
            self.emit(StreamEvent::WriteReady);
        }
        if ready.is_readable() && !self.state.borrow().broken {
            let closed = {
                let mut state = self.state.borrow_mut();
                state.read_ready = true;
                matches!(
                    Self::drain_read(self.fd.as_raw_fd(), &mut state),
                    Drain::Closed
                )
            };
            // Bytes that arrived together with EOF are still in the read
            // buffer; deliver ReadReady before the broken transition so
            // the observer parses them.
            self.emit(StreamEvent::ReadReady);
            if closed && self.mark_broken() {
                self.emit(StreamEvent::Broken);
            }
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if !self.state.borrow().broken {
            self.reactor.deregister(self.fd.as_raw_fd());
        }
    }
}

/// Listener state transitions
pub trait ListenerObserver {
    fn on_acceptable(&self, listener: &Listener);
}

struct ListenerInner {
    reactor: Rc<Reactor>,
    fd: OwnedFd,
    path: PathBuf,
    observer: RefCell<Weak<dyn ListenerObserver>>,
    self_weak: Weak<ListenerInner>,
}

/// A bound, listening local-domain socket
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Listener {
    fn from_fd(
        reactor: Rc<Reactor>,
        fd: OwnedFd,
        path: PathBuf,
        observer: Weak<dyn ListenerObserver>,
    ) -> Result<Listener> {
        let inner = Rc::new_cyclic(|self_weak| ListenerInner {
            reactor,
            fd,
            path,
            observer: RefCell::new(observer),
            self_weak: self_weak.clone(),
        });
        let weak = Rc::downgrade(&inner) as Weak<dyn FdObserver>;
        inner
            .reactor
            .register(inner.fd.as_raw_fd(), Ready::READABLE, weak)?;
        Ok(Listener { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Accept one pending connection, if any
    ///
    /// Would-block and transient accept errors return `Ok(None)` with no
    /// side effects; callers drain in a loop until then.
    pub fn accept(&self, observer: Weak<dyn StreamObserver>) -> Result<Option<Stream>> {
        match accept4(
            self.inner.fd.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(fd) => {
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                let stream = Stream::from_fd(
                    self.inner.reactor.clone(),
                    owned,
                    Ready::READABLE | Ready::WRITABLE,
                    observer,
                )?;
                trace!(id = stream.id(), "accepted connection");
                Ok(Some(stream))
            }
            Err(Errno::EAGAIN) | Err(Errno::ECONNABORTED) | Err(Errno::EINTR) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl FdObserver for ListenerInner {
    fn notify(&self, ready: Ready) {
        if !ready.is_readable() {
            return;
        }
        let Some(inner) = self.self_weak.upgrade() else {
            return;
        };
        let Some(observer) = self.observer.borrow().upgrade() else {
            return;
        };
        observer.on_acceptable(&Listener { inner });
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.reactor.deregister(self.fd.as_raw_fd());
        // Best-effort removal of the bound path
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %err, "could not unlink socket path");
        }
    }
}

/// Translates a filesystem path into bind and connect operations
pub struct UnixAddress {
    reactor: Rc<Reactor>,
    path: PathBuf,
}

impl UnixAddress {
    pub fn new(reactor: Rc<Reactor>, path: impl Into<PathBuf>) -> UnixAddress {
        UnixAddress {
            reactor,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn socket_fd() -> Result<OwnedFd> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        Ok(fd)
    }

    /// Bind and listen at the path, removing a stale socket file first
    pub fn listen(&self, observer: Weak<dyn ListenerObserver>) -> Result<Listener> {
        let fd = Self::socket_fd()?;
        let addr = UnixAddr::new(&self.path)?;
        if self.path.exists() {
            warn!(path = %self.path.display(), "removing stale socket path");
            fs::remove_file(&self.path)?;
        }
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::MAXCONN)?;
        debug!(path = %self.path.display(), "listening");
        Listener::from_fd(self.reactor.clone(), fd, self.path.clone(), observer)
    }

    /// Connect to a listener at the path
    ///
    /// Failure (including "path has no listener") returns an error and no
    /// stream; the caller decides whether that is fatal.
    pub fn connect(&self, observer: Weak<dyn StreamObserver>) -> Result<Stream> {
        let fd = Self::socket_fd()?;
        let addr = UnixAddr::new(&self.path)?;
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => {}
            // A non-blocking connect on a local socket may finish
            // asynchronously; readiness reports the outcome.
            Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => {}
            Err(err) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("connect to {} failed: {err}", self.path.display()),
                )))
            }
        }
        Stream::from_fd(
            self.reactor.clone(),
            fd,
            Ready::READABLE | Ready::WRITABLE,
            observer,
        )
    }
}
