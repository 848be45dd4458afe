//! The daemon's event-driven main body
//!
//! Owns the listener, a table of live connections keyed by
//! [`ConnectionId`], and a table of named services. Decoded requests are
//! routed to handlers by message tag; every handled request produces
//! exactly one response, correlated by `request_id`. Connections that
//! break mid-dispatch are parked on a deferred-destruction list and freed
//! once per loop tick, after the reactor poll returns, so an in-flight
//! handler never runs on a freed stream.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::{Config, Environment, SELF_TARGET};
use crate::error::{Error, Result};
use crate::net::{
    ConnectionId, Listener, ListenerObserver, Stream, StreamEvent, StreamObserver, UnixAddress,
};
use crate::protocol::{self, Request, RequestKind, Response, ReturnCode};
use crate::reactor::Reactor;
use crate::service::{Service, ServiceState, STOP_GRACE_PERIOD};
use crate::signal::ShutdownFlag;

/// Upper bound on one blocking wait; keeps service ticks flowing
const TICK_INTERVAL: Duration = Duration::from_secs(1);

struct DaemonState {
    reactor: Rc<Reactor>,
    environment: Environment,
    listener: RefCell<Option<Listener>>,
    connections: RefCell<HashMap<ConnectionId, Stream>>,
    services: RefCell<HashMap<String, Service>>,
    // Broken connections parked here until the current tick finishes
    defunct: RefCell<Vec<Stream>>,
    self_weak: Weak<DaemonState>,
}

/// The supervisor daemon
pub struct Daemon {
    reactor: Rc<Reactor>,
    state: Rc<DaemonState>,
    socket_path: PathBuf,
    shutdown: ShutdownFlag,
}

impl Daemon {
    /// Bind the control socket and prepare the dispatcher
    ///
    /// Any failure here (socket directory not creatable, bind refused) is
    /// fatal to daemon start; nothing is left running.
    pub fn new(config: Config, environment: Environment, shutdown: ShutdownFlag) -> Result<Daemon> {
        let reactor = Reactor::new()?;
        fs::create_dir_all(&config.control_socket_directory)?;
        let socket_path = environment.socket_path(&config);

        let state = Rc::new_cyclic(|self_weak| DaemonState {
            reactor: reactor.clone(),
            environment,
            listener: RefCell::new(None),
            connections: RefCell::new(HashMap::new()),
            services: RefCell::new(HashMap::new()),
            defunct: RefCell::new(Vec::new()),
            self_weak: self_weak.clone(),
        });

        let address = UnixAddress::new(reactor.clone(), &socket_path);
        let listener = address.listen(Rc::downgrade(&state) as Weak<dyn ListenerObserver>)?;
        state.listener.replace(Some(listener));
        info!(path = %socket_path.display(), "control socket ready");

        Ok(Daemon {
            reactor,
            state,
            socket_path,
            shutdown,
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// Register a pre-built service under its name
    ///
    /// The daemon's own identity name is reserved; a service registered
    /// under it would shadow the liveness reply in the status handler.
    pub fn register_service(&self, service: Service) -> Result<()> {
        if service.name() == SELF_TARGET {
            return Err(Error::Config(format!(
                "service name '{SELF_TARGET}' is reserved"
            )));
        }
        self.state
            .services
            .borrow_mut()
            .insert(service.name().to_string(), service);
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state.services.borrow().get(name).cloned()
    }

    /// Number of live control connections
    pub fn connection_count(&self) -> usize {
        self.state.connections.borrow().len()
    }

    /// One loop tick: wait for readiness, dispatch, then run deferred
    /// cleanup and service maintenance
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        self.reactor.poll(timeout)?;
        self.state.defunct.borrow_mut().clear();
        let now = Instant::now();
        for service in self.state.services.borrow().values() {
            service.tick(now);
        }
        Ok(())
    }

    /// Run until shutdown is requested
    ///
    /// Only a broken reactor ends the loop early; individual connection
    /// and service failures stay local.
    pub fn run(&self) -> Result<()> {
        info!("daemon running");
        while !self.shutdown.is_set() {
            self.poll(Some(TICK_INTERVAL))?;
        }
        info!("shutdown requested");
        self.stop_all_services();
        Ok(())
    }

    /// Gracefully stop every active service, bounded by the grace period
    fn stop_all_services(&self) {
        let services: Vec<Service> = self.state.services.borrow().values().cloned().collect();
        for service in &services {
            service.stop();
        }
        let deadline = Instant::now() + STOP_GRACE_PERIOD + Duration::from_secs(1);
        while services
            .iter()
            .any(|service| service.state() == ServiceState::Active)
            && Instant::now() < deadline
        {
            if self.poll(Some(Duration::from_millis(100))).is_err() {
                break;
            }
        }
    }
}

impl DaemonState {
    fn on_readable(&self, stream: &Stream) {
        loop {
            match protocol::read_request(stream) {
                Ok(Some(request)) => self.dispatch(stream, request),
                Ok(None) => break,
                Err(err) => {
                    // Framing errors make the connection unusable
                    warn!(id = stream.id(), %err, "closing connection");
                    stream.close();
                    break;
                }
            }
            if stream.is_broken() {
                break;
            }
        }
    }

    fn dispatch(&self, stream: &Stream, request: Request) {
        trace!(id = stream.id(), tag = request.kind, target = %request.target, "request");
        match RequestKind::from_u8(request.kind) {
            Some(RequestKind::Status) => self.handle_status(stream, &request),
            Some(RequestKind::Start) => self.handle_start(stream, &request),
            Some(RequestKind::Stop) => self.handle_stop(stream, &request),
            Some(RequestKind::Enable) | Some(RequestKind::Disable) => {
                self.handle_unsupported(stream, &request)
            }
            // Unknown tags get no handler and no response
            Some(RequestKind::Daemon) | None => {
                trace!(tag = request.kind, "ignoring request with no handler");
            }
        }
    }

    fn respond(&self, stream: &Stream, request: &Request, code: ReturnCode, content: String) {
        let response = Response {
            request_id: request.request_id,
            code: code.as_u8(),
            target: request.target.clone(),
            content,
        };
        if let Err(err) = protocol::write_response(stream, &response) {
            // An unencodable response is this connection's problem, not
            // the daemon's
            warn!(id = stream.id(), %err, "failed to encode response");
            stream.close();
        }
    }

    fn handle_status(&self, stream: &Stream, request: &Request) {
        let (code, content) = {
            let services = self.services.borrow();
            if let Some(service) = services.get(&request.target) {
                (ReturnCode::Ok, service.status_line())
            } else if request.target.is_empty() {
                if services.is_empty() {
                    (ReturnCode::Ok, "Currently no service registered".to_string())
                } else {
                    let mut lines: Vec<String> =
                        services.values().map(Service::status_line).collect();
                    lines.sort();
                    (ReturnCode::Ok, lines.join("\n"))
                }
            } else if request.target == SELF_TARGET {
                (
                    ReturnCode::Ok,
                    "Devoured feels ok. Thanks for asking".to_string(),
                )
            } else {
                (
                    ReturnCode::NoService,
                    "No matching service found".to_string(),
                )
            }
        };
        self.respond(stream, request, code, content);
    }

    fn handle_start(&self, stream: &Stream, request: &Request) {
        if request.target.is_empty() || request.target == SELF_TARGET {
            return self.respond(
                stream,
                request,
                ReturnCode::Error,
                format!("cannot start target '{}'", request.target),
            );
        }

        let existing = self.services.borrow().get(&request.target).cloned();
        if let Some(service) = existing {
            let state = self.start_service(&service);
            return self.report_start(stream, request, state);
        }

        match self.environment.load_service(&request.target) {
            Ok(config) => {
                let service = Service::new(self.reactor.clone(), request.target.clone(), config);
                let state = self.start_service(&service);
                self.services
                    .borrow_mut()
                    .insert(request.target.clone(), service);
                self.report_start(stream, request, state);
            }
            Err(err) => {
                debug!(target = %request.target, %err, "no service definition");
                self.respond(
                    stream,
                    request,
                    ReturnCode::Error,
                    format!("no service definition for '{}'", request.target),
                );
            }
        }
    }

    fn start_service(&self, service: &Service) -> ServiceState {
        service.start()
    }

    fn report_start(&self, stream: &Stream, request: &Request, state: ServiceState) {
        match state {
            ServiceState::Active => self.respond(
                stream,
                request,
                ReturnCode::Ok,
                format!("'{}' is active", request.target),
            ),
            _ => self.respond(
                stream,
                request,
                ReturnCode::Error,
                format!("'{}' failed to start", request.target),
            ),
        }
    }

    fn handle_stop(&self, stream: &Stream, request: &Request) {
        if request.target.is_empty() || request.target == SELF_TARGET {
            return self.respond(
                stream,
                request,
                ReturnCode::Error,
                format!("cannot stop target '{}'", request.target),
            );
        }
        let service = self.services.borrow().get(&request.target).cloned();
        match service {
            Some(service) if service.state() == ServiceState::Active => {
                service.stop();
                self.respond(
                    stream,
                    request,
                    ReturnCode::Ok,
                    format!("stopping '{}'", request.target),
                );
            }
            Some(_) => self.respond(
                stream,
                request,
                ReturnCode::Ok,
                format!("'{}' is not active", request.target),
            ),
            None => self.respond(
                stream,
                request,
                ReturnCode::NoService,
                "No matching service found".to_string(),
            ),
        }
    }

    fn handle_unsupported(&self, stream: &Stream, request: &Request) {
        self.respond(
            stream,
            request,
            ReturnCode::Error,
            "request not supported".to_string(),
        );
    }
}

impl ListenerObserver for DaemonState {
    fn on_acceptable(&self, listener: &Listener) {
        // Edge-triggered: accept until it would block
        loop {
            let observer = self.self_weak.clone() as Weak<dyn StreamObserver>;
            match listener.accept(observer) {
                Ok(Some(stream)) => {
                    debug!(id = stream.id(), "connection accepted");
                    self.connections.borrow_mut().insert(stream.id(), stream);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }
}

impl StreamObserver for DaemonState {
    fn on_stream_event(&self, stream: &Stream, event: StreamEvent) {
        match event {
            StreamEvent::ReadReady => self.on_readable(stream),
            StreamEvent::WriteReady => {}
            StreamEvent::Broken => {
                // Erase the table entry but keep the stream alive until the
                // current notification's call stack has unwound
                let removed = self.connections.borrow_mut().remove(&stream.id());
                if let Some(stream) = removed {
                    debug!(id = stream.id(), "connection closed");
                    self.defunct.borrow_mut().push(stream);
                }
            }
        }
    }
}
