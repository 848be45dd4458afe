//! Process spawning and service lifecycle against real children

use devoured::config::ServiceConfig;
use devoured::net::{Stream, StreamEvent, StreamObserver};
use devoured::process::ProcessStream;
use devoured::reactor::Reactor;
use devoured::service::{Service, ServiceState};
use nix::sys::wait::{waitpid, WaitPidFlag};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Capture {
    output: RefCell<Vec<u8>>,
    broken: RefCell<usize>,
}

impl StreamObserver for Capture {
    fn on_stream_event(&self, stream: &Stream, event: StreamEvent) {
        match event {
            StreamEvent::ReadReady => {
                let buffered = stream.buffered();
                if buffered > 0 {
                    if let Some(view) = stream.read(1) {
                        self.output.borrow_mut().extend_from_slice(&view);
                    }
                    stream.consume(buffered);
                }
            }
            StreamEvent::WriteReady => {}
            StreamEvent::Broken => *self.broken.borrow_mut() += 1,
        }
    }
}

fn poll_until(reactor: &Rc<Reactor>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition never became true");
        reactor.poll(Some(Duration::from_millis(20))).unwrap();
    }
}

fn sleep_config(seconds: &str) -> ServiceConfig {
    ServiceConfig {
        working_directory: PathBuf::from("/"),
        start_command: "/bin/sleep".to_string(),
        start_arguments: vec![seconds.to_string()],
        stop_command: None,
    }
}

fn shell_config(script: &str) -> ServiceConfig {
    ServiceConfig {
        working_directory: PathBuf::from("/"),
        start_command: "/bin/sh".to_string(),
        start_arguments: vec!["-c".to_string(), script.to_string()],
        stop_command: None,
    }
}

#[test]
fn test_spawn_captures_stdout_then_breaks() {
    let reactor = Reactor::new().unwrap();
    let capture = Rc::new(Capture::default());

    let process = ProcessStream::spawn(
        &reactor,
        "/bin/echo",
        &["hello".to_string(), "world".to_string()],
        std::path::Path::new("/"),
        Rc::downgrade(&capture) as Weak<dyn StreamObserver>,
    )
    .unwrap();
    assert_eq!(process.command(), "/bin/echo");

    // stdout and stderr both break once the child exits
    poll_until(&reactor, || *capture.broken.borrow() >= 2);
    assert_eq!(capture.output.borrow().as_slice(), b"hello world\n");

    let deadline = Instant::now() + Duration::from_secs(5);
    while process.try_reap().is_none() {
        assert!(Instant::now() < deadline, "child never reaped");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_exec_failure_surfaces_as_broken_streams() {
    let reactor = Reactor::new().unwrap();
    let capture = Rc::new(Capture::default());

    // The fork succeeds; exec fails inside the child, which exits 127
    let process = ProcessStream::spawn(
        &reactor,
        "/nonexistent/definitely-not-a-binary",
        &[],
        std::path::Path::new("/"),
        Rc::downgrade(&capture) as Weak<dyn StreamObserver>,
    )
    .unwrap();

    poll_until(&reactor, || *capture.broken.borrow() >= 2);
    assert!(capture.output.borrow().is_empty());
    let _ = process.try_reap();
}

#[test]
fn test_service_start_is_idempotent_while_active() {
    let reactor = Reactor::new().unwrap();
    let service = Service::new(reactor.clone(), "sleeper", sleep_config("30"));
    assert_eq!(service.state(), ServiceState::Inactive);

    assert_eq!(service.start(), ServiceState::Active);
    let pid = service.pid().expect("active service has a pid");

    // A second start must not spawn a second child
    assert_eq!(service.start(), ServiceState::Active);
    assert_eq!(service.pid(), Some(pid));

    service.stop();
    poll_until(&reactor, || service.state() != ServiceState::Active);
    assert_eq!(service.state(), ServiceState::Inactive);
}

#[test]
fn test_stopped_service_goes_inactive_and_child_is_reaped() {
    let reactor = Reactor::new().unwrap();
    let service = Service::new(reactor.clone(), "sleeper", sleep_config("30"));
    assert_eq!(service.start(), ServiceState::Active);
    let pid = service.pid().unwrap();

    service.stop();
    poll_until(&reactor, || service.state() == ServiceState::Inactive);
    assert_eq!(service.pid(), None);

    // Give the reap retry a chance, then confirm no zombie remains
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        service.tick(Instant::now());
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Err(nix::errno::Errno::ECHILD) => break,
            _ => assert!(Instant::now() < deadline, "child left unreaped"),
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_crashed_service_is_marked_failed_and_restartable() {
    let reactor = Reactor::new().unwrap();
    let service = Service::new(reactor.clone(), "crasher", shell_config("exit 3"));

    assert_eq!(service.start(), ServiceState::Active);
    poll_until(&reactor, || service.state() != ServiceState::Active);
    assert_eq!(service.state(), ServiceState::Failed);
    assert_eq!(service.status_line(), "crasher: failed");

    // Failed is not terminal; a new start spawns a fresh child
    assert_eq!(service.start(), ServiceState::Active);
    assert!(service.pid().is_some());
    poll_until(&reactor, || service.state() != ServiceState::Active);
}

#[test]
fn test_spawn_failure_marks_service_failed_without_process() {
    let reactor = Reactor::new().unwrap();
    let mut config = sleep_config("1");
    config.start_command = "bad\0command".to_string();
    let service = Service::new(reactor, "broken", config);

    assert_eq!(service.start(), ServiceState::Failed);
    assert_eq!(service.pid(), None);
    assert_eq!(service.status_line(), "broken: failed");
}

#[test]
fn test_status_line_reports_pid_while_active() {
    let reactor = Reactor::new().unwrap();
    let service = Service::new(reactor.clone(), "sleeper", sleep_config("30"));
    assert_eq!(service.status_line(), "sleeper: inactive");

    service.start();
    let pid = service.pid().unwrap();
    assert_eq!(
        service.status_line(),
        format!("sleeper: active (pid {})", pid.as_raw())
    );

    service.stop();
    poll_until(&reactor, || service.state() == ServiceState::Inactive);
}
