#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use warden_agent::config::{DEFAULT_READY_MARKER, ServerConfig, SupervisorTimings, TailSettings};
use warden_agent::coordinator::ReadyHook;
use warden_agent::process_probe::ProcessProbe;
use warden_agent::settings::MemorySettings;
use warden_agent::shutdown::wait_until;
use warden_agent::window::NoopWindowPort;
use warden_agent::{
    BacklogPolicy, LaunchSpec, MessageRelay, MonitorSpec, MultiServerCoordinator,
    ProcessSupervisor, RelayConsumer, SupervisorParts, WindowLocator,
};
use warden_process::{ServerId, ServerState, SupervisorEvent};

/// Never reports foreign processes, so nothing on the host gets adopted.
struct NoForeignProcesses;

impl ProcessProbe for NoForeignProcesses {
    fn find_by_name(&self, _exe_name: &str) -> Vec<u32> {
        Vec::new()
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

fn supervisor(id: &str, root: &Path) -> ProcessSupervisor {
    let config = ServerConfig {
        id: id.to_string(),
        executable: PathBuf::from("/bin/sh"),
        args: Vec::new(),
        log_dir: root.join(id).join("Logs"),
        log_pattern: "*.log".to_string(),
        graceful_command: None,
    };
    ProcessSupervisor::new(
        config,
        SupervisorParts {
            probe: Arc::new(NoForeignProcesses),
            windows: WindowLocator::new(Arc::new(NoopWindowPort), &[]),
            settings: Arc::new(MemorySettings::new()),
            sink: Arc::new(|_: &ServerId, _: SupervisorEvent| {}),
            timings: SupervisorTimings {
                graceful_timeout: Duration::from_secs(2),
                term_grace: Duration::from_secs(1),
                forced_timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(20),
                ..SupervisorTimings::default()
            },
            state_dir: root.join("state"),
        },
    )
}

fn fast_tail() -> TailSettings {
    TailSettings {
        active_delay: Duration::from_millis(10),
        idle_delay_max: Duration::from_millis(50),
        ..TailSettings::default()
    }
}

fn drain_until(
    rx: &RelayConsumer,
    got: &mut Vec<(String, String)>,
    done: impl Fn(&[(String, String)]) -> bool,
) -> bool {
    wait_until(Duration::from_secs(10), Duration::from_millis(20), || {
        let mut sink = |id: &ServerId, t: &str| got.push((id.to_string(), t.to_string()));
        rx.drain(&mut sink);
        done(got.as_slice())
    })
}

#[test]
fn log_marker_drives_server_to_active_and_lines_reach_the_relay() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor("island", root.path());
    let log_dir = sup.config().log_dir.clone();

    let (tx, rx) = MessageRelay::bounded(256);
    let on_ready: ReadyHook = {
        let sup = sup.clone();
        Arc::new(move |id: &ServerId| {
            assert_eq!(id, sup.id());
            sup.mark_active();
        })
    };
    let coordinator = MultiServerCoordinator::new(tx, fast_tail(), on_ready);
    coordinator
        .start_monitoring(MonitorSpec::for_server(sup.config(), false, &fast_tail()))
        .unwrap();

    let body = format!(
        "mkdir -p '{dir}'; echo 'loading map' >> '{dir}/ShooterGame.log'; \
         sleep 0.2; echo '{DEFAULT_READY_MARKER}' >> '{dir}/ShooterGame.log'; exec sleep 30",
        dir = log_dir.display()
    );
    sup.start(LaunchSpec {
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), body],
        working_dir: root.path().to_path_buf(),
        show_console: false,
        graceful_command: None,
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), Duration::from_millis(20), || {
        sup.state() == ServerState::Active
    }));

    let mut got = Vec::new();
    assert!(drain_until(&rx, &mut got, |g| g.len() >= 2));
    assert_eq!(got[0], ("island".to_string(), "loading map".to_string()));
    assert_eq!(got[1].1, DEFAULT_READY_MARKER);

    // Hiding every server leaves tailing untouched.
    coordinator.stop_all_ui(&[ServerId::new("island")]);
    assert!(coordinator.is_monitoring(&ServerId::new("island")));

    assert_eq!(sup.stop_blocking(), SupervisorEvent::Stopped { forced: false });
    assert_eq!(sup.state(), ServerState::Stopped);

    let report = coordinator.teardown(Duration::from_secs(2));
    assert_eq!(report.joined, 1);
    assert!(report.leaked.is_empty());
}

#[test]
fn two_servers_keep_their_lines_apart() {
    let root = tempfile::tempdir().unwrap();
    let (tx, rx) = MessageRelay::bounded(256);
    let coordinator = MultiServerCoordinator::new(tx, fast_tail(), Arc::new(|_: &ServerId| {}));

    for id in ["island", "ragnarok"] {
        let dir = root.path().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let lines: String = (0..5).map(|i| format!("{id} {i}\n")).collect();
        std::fs::write(dir.join("ShooterGame.log"), lines).unwrap();
        coordinator
            .start_monitoring(MonitorSpec {
                server_id: ServerId::new(id),
                log_dir: dir,
                log_pattern: "*.log".to_string(),
                policy: BacklogPolicy::LastLines(3),
            })
            .unwrap();
    }

    let mut got = Vec::new();
    assert!(drain_until(&rx, &mut got, |g| g.len() >= 6));
    for id in ["island", "ragnarok"] {
        let ours: Vec<&str> = got
            .iter()
            .filter(|(s, _)| s == id)
            .map(|(_, t)| t.as_str())
            .collect();
        let expected: Vec<String> = (2..5).map(|i| format!("{id} {i}")).collect();
        assert_eq!(ours, expected);
    }

    coordinator.teardown(Duration::from_secs(2));
}

fn booting_server(log_dir: &Path, working_dir: &Path) -> LaunchSpec {
    let body = format!(
        "mkdir -p '{dir}'; echo 'loading map' >> '{dir}/ShooterGame.log'; \
         sleep 0.2; echo '{DEFAULT_READY_MARKER}' >> '{dir}/ShooterGame.log'; exec sleep 30",
        dir = log_dir.display()
    );
    LaunchSpec {
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), body],
        working_dir: working_dir.to_path_buf(),
        show_console: false,
        graceful_command: None,
    }
}

fn watched(sup: &ProcessSupervisor) -> (MultiServerCoordinator, RelayConsumer) {
    let (tx, rx) = MessageRelay::bounded(256);
    let on_ready: ReadyHook = {
        let sup = sup.clone();
        Arc::new(move |_: &ServerId| {
            sup.mark_active();
        })
    };
    let coordinator = MultiServerCoordinator::new(tx, fast_tail(), on_ready);
    coordinator
        .start_monitoring(MonitorSpec::for_server(sup.config(), false, &fast_tail()))
        .unwrap();
    (coordinator, rx)
}

#[test]
fn marker_from_an_earlier_session_does_not_block_the_next_startup() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor("island", root.path());
    let log_dir = sup.config().log_dir.clone();
    std::fs::create_dir_all(&log_dir).unwrap();
    std::fs::write(
        log_dir.join("ShooterGame.log"),
        format!("old boot\n{DEFAULT_READY_MARKER}\n"),
    )
    .unwrap();

    let (coordinator, rx) = watched(&sup);
    let mut got = Vec::new();
    assert!(drain_until(&rx, &mut got, |g| g.len() >= 2));
    assert_eq!(sup.state(), ServerState::Stopped);

    sup.start(booting_server(&log_dir, root.path())).unwrap();
    assert!(drain_until(&rx, &mut got, |g| g.len() >= 4));
    assert!(wait_until(Duration::from_secs(10), Duration::from_millis(20), || {
        sup.state() == ServerState::Active
    }));

    sup.stop_blocking();
    coordinator.teardown(Duration::from_secs(2));
}

#[test]
fn restart_on_the_same_log_reaches_active_again() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor("island", root.path());
    let log_dir = sup.config().log_dir.clone();
    let (coordinator, _rx) = watched(&sup);

    sup.start(booting_server(&log_dir, root.path())).unwrap();
    assert!(wait_until(Duration::from_secs(10), Duration::from_millis(20), || {
        sup.state() == ServerState::Active
    }));

    let (tx, events) = crossbeam_channel::unbounded();
    sup.restart(move |ev| {
        let _ = tx.send(ev);
    });
    let stopped = events.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(stopped, SupervisorEvent::Stopped { forced: false });
    let started = events.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(started, SupervisorEvent::Started { .. }), "{started:?}");

    assert!(wait_until(Duration::from_secs(10), Duration::from_millis(20), || {
        sup.state() == ServerState::Active
    }));

    sup.stop_blocking();
    coordinator.teardown(Duration::from_secs(2));
}
