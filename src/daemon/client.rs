//! Control-plane client
//!
//! One request, one response, one deadline. The client runs its own small
//! reactor and treats the absence of a response within the timeout as a
//! failure; there is no server-side cancellation to lean on.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::net::{Stream, StreamEvent, StreamObserver, UnixAddress};
use crate::protocol::{self, Request, Response};
use crate::reactor::Reactor;

/// Collects the single expected response off the connection
#[derive(Default)]
struct PendingReply {
    response: RefCell<Option<Response>>,
    failed: Cell<bool>,
}

impl StreamObserver for PendingReply {
    fn on_stream_event(&self, stream: &Stream, event: StreamEvent) {
        match event {
            StreamEvent::ReadReady => {
                if self.response.borrow().is_some() {
                    return;
                }
                match protocol::read_response(stream) {
                    Ok(Some(response)) => {
                        *self.response.borrow_mut() = Some(response);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(%err, "response framing error");
                        self.failed.set(true);
                        stream.close();
                    }
                }
            }
            StreamEvent::WriteReady => {}
            StreamEvent::Broken => self.failed.set(true),
        }
    }
}

/// Client for issuing management requests to a running daemon
pub struct ControlClient {
    reactor: Rc<Reactor>,
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Result<ControlClient> {
        Ok(ControlClient {
            reactor: Reactor::new()?,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Send one request and wait up to `timeout` for its response
    pub fn request(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let pending = Rc::new(PendingReply::default());
        let address = UnixAddress::new(self.reactor.clone(), &self.socket_path);
        let stream = address.connect(Rc::downgrade(&pending) as Weak<dyn StreamObserver>)?;
        protocol::write_request(&stream, request)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = pending.response.borrow_mut().take() {
                return Ok(response);
            }
            if pending.failed.get() || stream.is_broken() {
                return Err(Error::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            self.reactor.poll(Some(deadline - now))?;
        }
    }
}
