use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use warden_process::ServerId;

use crate::cadence::AdaptiveCadence;
use crate::config::{ServerConfig, TailSettings};
use crate::relay::RelaySender;
use crate::tail::{BacklogPolicy, LogTailer};
use crate::user_message;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Called from a monitor thread when a server's log reports startup complete.
pub type ReadyHook = Arc<dyn Fn(&ServerId) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MonitorSpec {
    pub server_id: ServerId,
    pub log_dir: PathBuf,
    pub log_pattern: String,
    pub policy: BacklogPolicy,
}

impl MonitorSpec {
    /// Reattaching to a running server replays only the last K lines.
    pub fn for_server(cfg: &ServerConfig, already_running: bool, tail: &TailSettings) -> Self {
        let policy = if already_running {
            BacklogPolicy::LastLines(tail.backlog_lines)
        } else {
            BacklogPolicy::Full
        };
        Self {
            server_id: ServerId::new(cfg.id.clone()),
            log_dir: cfg.log_dir.clone(),
            log_pattern: cfg.log_pattern.clone(),
            policy,
        }
    }
}

struct MonitorEntry {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    displayed: bool,
}

impl MonitorEntry {
    fn is_live(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub joined: usize,
    /// Loops that did not finish in time and were detached.
    pub leaked: Vec<ServerId>,
}

pub struct MultiServerCoordinator {
    relay: RelaySender,
    tail: TailSettings,
    on_ready: ReadyHook,
    entries: Mutex<BTreeMap<ServerId, MonitorEntry>>,
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn run_monitor(
    mut tailer: LogTailer,
    relay: RelaySender,
    running: Arc<AtomicBool>,
    on_ready: ReadyHook,
    mut cadence: AdaptiveCadence,
) {
    let id = tailer.server_id().clone();
    tracing::debug!(server_id = %id, "monitor loop started");
    let mut last_error: Option<String> = None;

    while running.load(Ordering::Acquire) {
        let delay = match tailer.poll() {
            Ok(batch) => {
                if last_error.take().is_some() {
                    tracing::info!(server_id = %id, "log readable again");
                }
                if batch.reset
                    && let Some(path) = tailer.state().path.as_ref()
                {
                    tracing::info!(server_id = %id, path = %path.display(), "tailing log file");
                }
                let had_lines = !batch.lines.is_empty();
                for line in batch.lines {
                    relay.send(&id, line);
                }
                if batch.server_ready {
                    tracing::info!(server_id = %id, "ready marker seen");
                    on_ready(&id);
                }
                cadence.next_delay(had_lines)
            }
            Err(e) => {
                let line = user_message::from_error(&e);
                if last_error.as_deref() != Some(line.as_str()) {
                    tracing::warn!(server_id = %id, error = ?e, "{line}; retrying");
                } else {
                    tracing::debug!(server_id = %id, "{line}; retrying");
                }
                last_error = Some(line);
                cadence.after_error()
            }
        };
        sleep_while_running(&running, delay);
    }
    tracing::debug!(server_id = %id, "monitor loop exited");
}

impl MultiServerCoordinator {
    pub fn new(relay: RelaySender, tail: TailSettings, on_ready: ReadyHook) -> Self {
        Self {
            relay,
            tail,
            on_ready,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts a monitor loop for `spec.server_id` unless a live one exists.
    /// Returns true if a new loop was spawned.
    pub fn start_monitoring(&self, spec: MonitorSpec) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock();
        let mut displayed = false;
        if let Some(existing) = entries.get(&spec.server_id) {
            if existing.is_live() {
                return Ok(false);
            }
            displayed = existing.displayed;
        }

        let tailer = LogTailer::new(
            spec.server_id.clone(),
            spec.log_dir.clone(),
            &spec.log_pattern,
            self.tail.clone(),
            spec.policy,
        )
        .with_context(|| format!("invalid log pattern {:?}", spec.log_pattern))?;

        let running = Arc::new(AtomicBool::new(true));
        let cadence = AdaptiveCadence::new(self.tail.active_delay, self.tail.idle_delay_max);
        let handle = {
            let relay = self.relay.clone();
            let running = running.clone();
            let on_ready = self.on_ready.clone();
            std::thread::Builder::new()
                .name(format!("warden-tail-{}", spec.server_id))
                .spawn(move || run_monitor(tailer, relay, running, on_ready, cadence))
                .context("spawn monitor thread")?
        };

        tracing::info!(
            server_id = %spec.server_id,
            log_dir = %spec.log_dir.display(),
            policy = ?spec.policy,
            "monitoring started"
        );
        // A finished entry being replaced has already exited; joining is instant.
        if let Some(old) = entries.insert(
            spec.server_id,
            MonitorEntry {
                handle,
                running,
                displayed,
            },
        ) {
            old.running.store(false, Ordering::Release);
            if old.handle.join().is_err() {
                tracing::error!("previous monitor loop panicked");
            }
        }
        Ok(true)
    }

    pub fn is_monitoring(&self, server_id: &ServerId) -> bool {
        self.entries
            .lock()
            .get(server_id)
            .is_some_and(MonitorEntry::is_live)
    }

    pub fn monitored(&self) -> Vec<ServerId> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Returns false if `server_id` is not monitored.
    pub fn set_displayed(&self, server_id: &ServerId, displayed: bool) -> bool {
        match self.entries.lock().get_mut(server_id) {
            Some(entry) => {
                entry.displayed = displayed;
                true
            }
            None => false,
        }
    }

    pub fn is_displayed(&self, server_id: &ServerId) -> bool {
        self.entries
            .lock()
            .get(server_id)
            .is_some_and(|e| e.displayed)
    }

    /// Leaves multi-server view. Only display flags change; tailing goes on
    /// so history stays continuous when the view comes back.
    pub fn stop_all_ui(&self, server_ids: &[ServerId]) {
        let mut entries = self.entries.lock();
        for id in server_ids {
            if let Some(entry) = entries.get_mut(id) {
                entry.displayed = false;
            }
        }
    }

    /// Signals every loop to exit and joins each within `timeout`. Loops
    /// still running at the deadline are detached and reported.
    pub fn teardown(&self, timeout: Duration) -> TeardownReport {
        let entries: Vec<(ServerId, MonitorEntry)> =
            std::mem::take(&mut *self.entries.lock()).into_iter().collect();
        for (_, entry) in &entries {
            entry.running.store(false, Ordering::Release);
        }

        let deadline = Instant::now() + timeout;
        let mut pending = entries;
        let mut report = TeardownReport::default();
        loop {
            let (done, rest): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|(_, e)| e.handle.is_finished());
            for (id, entry) in done {
                if entry.handle.join().is_err() {
                    tracing::error!(server_id = %id, "monitor loop panicked");
                }
                report.joined += 1;
            }
            pending = rest;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        for (id, _entry) in pending {
            tracing::warn!(server_id = %id, "monitor loop did not exit in time; detaching");
            report.leaked.push(id);
        }
        tracing::info!(joined = report.joined, leaked = report.leaked.len(), "monitors torn down");
        report
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::relay::{MessageRelay, RelayConsumer};
    use crate::shutdown::wait_until;

    fn fast_tail() -> TailSettings {
        TailSettings {
            active_delay: Duration::from_millis(10),
            idle_delay_max: Duration::from_millis(40),
            ..TailSettings::default()
        }
    }

    fn spec(id: &str, dir: &Path) -> MonitorSpec {
        MonitorSpec {
            server_id: ServerId::new(id),
            log_dir: dir.to_path_buf(),
            log_pattern: "*.log".to_string(),
            policy: BacklogPolicy::Full,
        }
    }

    fn append(path: &Path, line: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        writeln!(f, "{line}").unwrap();
    }

    fn collect_until(rx: &RelayConsumer, want: usize) -> Vec<(String, String)> {
        let mut got = Vec::new();
        wait_until(Duration::from_secs(5), Duration::from_millis(10), || {
            let mut sink = |id: &ServerId, t: &str| got.push((id.to_string(), t.to_string()));
            rx.drain(&mut sink);
            got.len() >= want
        });
        got
    }

    fn coordinator() -> (MultiServerCoordinator, RelayConsumer, Arc<AtomicUsize>) {
        let (tx, rx) = MessageRelay::bounded(1024);
        let readies = Arc::new(AtomicUsize::new(0));
        let counter = readies.clone();
        let hook: ReadyHook = Arc::new(move |_: &ServerId| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (MultiServerCoordinator::new(tx, fast_tail(), hook), rx, readies)
    }

    #[test]
    fn second_start_is_a_noop_and_lines_flow() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("ShooterGame.log");
        append(&log, "boot");
        let (coord, rx, _) = coordinator();

        assert!(coord.start_monitoring(spec("island", dir.path())).unwrap());
        assert!(!coord.start_monitoring(spec("island", dir.path())).unwrap());
        assert_eq!(coord.monitored(), vec![ServerId::new("island")]);

        append(&log, "tick");
        let got = collect_until(&rx, 2);
        assert_eq!(
            got,
            vec![
                ("island".to_string(), "boot".to_string()),
                ("island".to_string(), "tick".to_string())
            ]
        );
        coord.teardown(Duration::from_secs(2));
    }

    #[test]
    fn ready_hook_fires_for_each_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("ShooterGame.log");
        append(&log, "loading");
        let (coord, rx, readies) = coordinator();
        coord.start_monitoring(spec("island", dir.path())).unwrap();
        collect_until(&rx, 1);
        assert_eq!(readies.load(Ordering::SeqCst), 0);

        let marker = crate::config::DEFAULT_READY_MARKER;
        for want in 1..=2 {
            append(&log, marker);
            assert!(wait_until(Duration::from_secs(5), Duration::from_millis(10), || {
                readies.load(Ordering::SeqCst) >= want
            }));
        }
        assert_eq!(readies.load(Ordering::SeqCst), 2);
        coord.teardown(Duration::from_secs(2));
    }

    #[test]
    fn hiding_the_view_keeps_tailing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("ShooterGame.log");
        append(&log, "one");
        let (coord, rx, _) = coordinator();
        let id = ServerId::new("island");
        coord.start_monitoring(spec("island", dir.path())).unwrap();
        assert!(coord.set_displayed(&id, true));
        assert!(!coord.set_displayed(&ServerId::new("nope"), true));

        coord.stop_all_ui(std::slice::from_ref(&id));
        assert!(!coord.is_displayed(&id));
        assert!(coord.is_monitoring(&id));

        append(&log, "two");
        let got = collect_until(&rx, 2);
        assert_eq!(got.last().map(|(_, t)| t.as_str()), Some("two"));
        coord.teardown(Duration::from_secs(2));
    }

    #[test]
    fn loops_survive_missing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("Logs");
        let (coord, rx, _) = coordinator();
        coord.start_monitoring(spec("island", &logs)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(coord.is_monitoring(&ServerId::new("island")));

        std::fs::create_dir_all(&logs).unwrap();
        append(&logs.join("ShooterGame.log"), "late start");
        let got = collect_until(&rx, 1);
        assert_eq!(got, vec![("island".to_string(), "late start".to_string())]);
        coord.teardown(Duration::from_secs(2));
    }

    #[test]
    fn teardown_joins_and_allows_restart() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (coord, _rx, _) = coordinator();
        coord.start_monitoring(spec("a", dir_a.path())).unwrap();
        coord.start_monitoring(spec("b", dir_b.path())).unwrap();

        let report = coord.teardown(Duration::from_secs(2));
        assert_eq!(report.joined, 2);
        assert!(report.leaked.is_empty());
        assert!(coord.monitored().is_empty());
        assert!(!coord.is_monitoring(&ServerId::new("a")));

        assert!(coord.start_monitoring(spec("a", dir_a.path())).unwrap());
        coord.teardown(Duration::from_secs(2));
    }

    #[test]
    fn bad_pattern_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _rx, _) = coordinator();
        let mut bad = spec("island", dir.path());
        bad.log_pattern = "[".to_string();
        assert!(coord.start_monitoring(bad).is_err());
        assert!(coord.monitored().is_empty());
    }

    #[test]
    fn reattach_spec_limits_backlog() {
        let cfg = ServerConfig {
            id: "island".to_string(),
            executable: PathBuf::from("/srv/island/server"),
            args: Vec::new(),
            log_dir: PathBuf::from("/srv/island/logs"),
            log_pattern: "*.log".to_string(),
            graceful_command: None,
        };
        let tail = TailSettings::default();
        assert_eq!(
            MonitorSpec::for_server(&cfg, true, &tail).policy,
            BacklogPolicy::LastLines(50)
        );
        assert_eq!(
            MonitorSpec::for_server(&cfg, false, &tail).policy,
            BacklogPolicy::Full
        );
    }
}
