//! End-to-end dispatcher scenarios over a real control socket
//!
//! The daemon runs in-process; clients are plain blocking unix sockets
//! driven in lockstep with `Daemon::poll`.

use devoured::config::{Config, Environment, ServiceConfig};
use devoured::daemon::Daemon;
use devoured::protocol::{
    decode_response, encode_request, Request, RequestKind, Response, ReturnCode,
};
use devoured::service::{Service, ServiceState};
use devoured::signal::ShutdownFlag;
use std::fs;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn scratch_daemon() -> (TempDir, Daemon) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("services")).unwrap();
    let environment = Environment::with_paths(
        nix::unistd::getuid().as_raw(),
        dir.path().to_path_buf(),
        dir.path().join("config.toml"),
        dir.path().join("services"),
    );
    let config = Config {
        control_socket_directory: dir.path().join("socket"),
        control_socket_name: "control".to_string(),
    };
    let daemon = Daemon::new(config, environment, ShutdownFlag::new()).unwrap();
    (dir, daemon)
}

/// One client connection with its own receive buffer
///
/// The buffer persists across calls so responses that coalesce into a
/// single socket read are not lost.
struct ClientConnection {
    socket: UnixStream,
    buf: Vec<u8>,
}

impl ClientConnection {
    fn open(daemon: &Daemon) -> ClientConnection {
        let socket = UnixStream::connect(daemon.socket_path()).unwrap();
        socket.set_nonblocking(true).unwrap();
        // Let the listener pick the connection up
        daemon.poll(Some(Duration::from_millis(20))).unwrap();
        ClientConnection {
            socket,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, request: &Request) {
        let frame = encode_request(request).unwrap();
        self.socket.write_all(&frame).unwrap();
    }

    fn receive(&mut self, daemon: &Daemon) -> Response {
        let mut chunk = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((response, used)) = decode_response(&self.buf).unwrap() {
                self.buf.drain(..used);
                return response;
            }
            daemon.poll(Some(Duration::from_millis(20))).unwrap();
            match self.socket.read(&mut chunk) {
                Ok(0) => panic!("daemon closed the connection"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("client read failed: {err}"),
            }
            assert!(Instant::now() < deadline, "no response before deadline");
        }
    }

    fn roundtrip(&mut self, daemon: &Daemon, request: &Request) -> Response {
        self.send(request);
        self.receive(daemon)
    }
}

fn write_service_definition(dir: &TempDir, name: &str, body: &str) {
    fs::write(dir.path().join("services").join(format!("{name}.toml")), body).unwrap();
}

#[test]
fn test_status_with_no_services_registered() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(77, RequestKind::Status, "", ""));
    assert_eq!(response.request_id, 77);
    assert_eq!(response.code, ReturnCode::Ok.as_u8());
    assert_eq!(response.content, "Currently no service registered");
}

#[test]
fn test_status_of_the_daemon_itself() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(1, RequestKind::Status, "devoured", ""));
    assert_eq!(response.code, ReturnCode::Ok.as_u8());
    assert_eq!(response.content, "Devoured feels ok. Thanks for asking");
}

#[test]
fn test_status_of_unknown_service() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(2, RequestKind::Status, "ghost", ""));
    assert_eq!(response.code, ReturnCode::NoService.as_u8());
    assert_eq!(response.content, "No matching service found");
}

#[test]
fn test_start_stop_round_trip_through_the_socket() {
    let (dir, daemon) = scratch_daemon();
    write_service_definition(
        &dir,
        "sleeper",
        "working_directory = \"/\"\nstart_command = \"/bin/sleep\"\nstart_arguments = [\"30\"]\n",
    );
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(10, RequestKind::Start, "sleeper", ""));
    assert_eq!(response.code, ReturnCode::Ok.as_u8());
    let service = daemon.service("sleeper").expect("service registered");
    assert_eq!(service.state(), ServiceState::Active);

    // Status now lists the running service
    let response = client.roundtrip(&daemon, &Request::new(11, RequestKind::Status, "", ""));
    assert!(response.content.starts_with("sleeper: active (pid "));

    let response = client.roundtrip(&daemon, &Request::new(12, RequestKind::Stop, "sleeper", ""));
    assert_eq!(response.code, ReturnCode::Ok.as_u8());
    assert_eq!(response.content, "stopping 'sleeper'");

    let deadline = Instant::now() + Duration::from_secs(5);
    while service.state() == ServiceState::Active {
        assert!(Instant::now() < deadline, "service never stopped");
        daemon.poll(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(service.state(), ServiceState::Inactive);
}

#[test]
fn test_start_without_definition_is_an_error() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(3, RequestKind::Start, "ghost", ""));
    assert_eq!(response.code, ReturnCode::Error.as_u8());
    assert_eq!(response.content, "no service definition for 'ghost'");
}

#[test]
fn test_start_rejects_empty_and_reserved_targets() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(4, RequestKind::Start, "", ""));
    assert_eq!(response.code, ReturnCode::Error.as_u8());

    let response = client.roundtrip(&daemon, &Request::new(5, RequestKind::Start, "devoured", ""));
    assert_eq!(response.code, ReturnCode::Error.as_u8());
}

#[test]
fn test_stop_of_unknown_service_reports_no_service() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(6, RequestKind::Stop, "ghost", ""));
    assert_eq!(response.code, ReturnCode::NoService.as_u8());
}

#[test]
fn test_enable_and_disable_are_reported_unsupported() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    for kind in [RequestKind::Enable, RequestKind::Disable] {
        let response = client.roundtrip(&daemon, &Request::new(7, kind, "any", ""));
        assert_eq!(response.code, ReturnCode::Error.as_u8());
        assert_eq!(response.content, "request not supported");
    }
}

#[test]
fn test_unknown_tag_gets_no_response_but_connection_survives() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    let mut unknown = Request::new(8, RequestKind::Status, "x", "");
    unknown.kind = 99;
    client.send(&unknown);

    // The next well-formed request is answered on the same connection
    let response = client.roundtrip(&daemon, &Request::new(9, RequestKind::Status, "", ""));
    assert_eq!(response.request_id, 9);
    assert_eq!(response.code, ReturnCode::Ok.as_u8());
}

#[test]
fn test_garbage_framing_closes_only_that_connection() {
    let (_dir, daemon) = scratch_daemon();
    let mut bad = ClientConnection::open(&daemon);
    let mut good = ClientConnection::open(&daemon);
    assert_eq!(daemon.connection_count(), 2);

    // Length prefix claims more than the protocol allows
    bad.socket.write_all(&[0xff, 0xff, 0, 0, 0]).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while daemon.connection_count() > 1 {
        assert!(Instant::now() < deadline, "bad connection never closed");
        daemon.poll(Some(Duration::from_millis(20))).unwrap();
    }

    let response = good.roundtrip(&daemon, &Request::new(13, RequestKind::Status, "", ""));
    assert_eq!(response.code, ReturnCode::Ok.as_u8());
}

#[test]
fn test_client_disconnect_is_cleaned_up() {
    let (_dir, daemon) = scratch_daemon();
    let client = ClientConnection::open(&daemon);
    assert_eq!(daemon.connection_count(), 1);

    drop(client);
    let deadline = Instant::now() + Duration::from_secs(2);
    while daemon.connection_count() > 0 {
        assert!(Instant::now() < deadline, "connection never cleaned up");
        daemon.poll(Some(Duration::from_millis(20))).unwrap();
    }
}

#[test]
fn test_request_arriving_with_half_close_is_still_answered() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    // Request bytes and EOF land in the same readiness notification; the
    // request must still be decoded and answered on the write side
    client.send(&Request::new(40, RequestKind::Status, "devoured", ""));
    client.socket.shutdown(Shutdown::Write).unwrap();

    let response = client.receive(&daemon);
    assert_eq!(response.request_id, 40);
    assert_eq!(response.content, "Devoured feels ok. Thanks for asking");
}

#[test]
fn test_pipelined_requests_are_each_answered_in_order() {
    let (_dir, daemon) = scratch_daemon();
    let mut client = ClientConnection::open(&daemon);

    // Two requests in one burst; both must be answered, in order, even
    // when both responses arrive in one socket read
    client.send(&Request::new(20, RequestKind::Status, "", ""));
    client.send(&Request::new(21, RequestKind::Status, "devoured", ""));

    let first = client.receive(&daemon);
    let second = client.receive(&daemon);
    assert_eq!(first.request_id, 20);
    assert_eq!(second.request_id, 21);
    assert_eq!(second.content, "Devoured feels ok. Thanks for asking");
}

#[test]
fn test_register_service_rejects_the_reserved_name() {
    let (_dir, daemon) = scratch_daemon();
    let config = ServiceConfig {
        working_directory: PathBuf::from("/"),
        start_command: "/bin/sleep".to_string(),
        start_arguments: vec!["30".to_string()],
        stop_command: None,
    };

    let impostor = Service::new(daemon.reactor().clone(), "devoured", config.clone());
    assert!(daemon.register_service(impostor).is_err());

    let legitimate = Service::new(daemon.reactor().clone(), "sleeper", config);
    daemon.register_service(legitimate).unwrap();

    // The liveness reply is not shadowed
    let mut client = ClientConnection::open(&daemon);
    let response = client.roundtrip(&daemon, &Request::new(50, RequestKind::Status, "devoured", ""));
    assert_eq!(response.content, "Devoured feels ok. Thanks for asking");
}

#[test]
fn test_crashing_service_is_observed_as_failed() {
    let (dir, daemon) = scratch_daemon();
    write_service_definition(
        &dir,
        "crasher",
        "working_directory = \"/\"\nstart_command = \"/bin/sh\"\nstart_arguments = [\"-c\", \"exit 1\"]\n",
    );
    let mut client = ClientConnection::open(&daemon);

    let response = client.roundtrip(&daemon, &Request::new(30, RequestKind::Start, "crasher", ""));
    assert_eq!(response.code, ReturnCode::Ok.as_u8());

    let service = daemon.service("crasher").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.state() == ServiceState::Active {
        assert!(Instant::now() < deadline, "crash never observed");
        daemon.poll(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(service.state(), ServiceState::Failed);

    let response = client.roundtrip(&daemon, &Request::new(31, RequestKind::Status, "crasher", ""));
    assert_eq!(response.content, "crasher: failed");
}
