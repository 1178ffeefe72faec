use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use warden_process::{ProcessStatus, ServerId, ServerState, SupervisorEvent};

use crate::config::{ServerConfig, SupervisorTimings};
use crate::error::{Result, SupervisorError};
use crate::process_probe::{ProcessProbe, exe_name_of};
use crate::run_record::{self, RunRecord};
use crate::settings::{self, SettingsStore};
use crate::shutdown::{self, AdoptedProcess, Escalation, Signal, Terminable};
use crate::user_message;
use crate::window::{ConsoleWindowRef, WindowLocator};

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Receives lifecycle events that are not tied to a specific call.
pub trait StatusSink: Send + Sync {
    fn notify(&self, server_id: &ServerId, event: SupervisorEvent);
}

impl<F> StatusSink for F
where
    F: Fn(&ServerId, SupervisorEvent) + Send + Sync,
{
    fn notify(&self, server_id: &ServerId, event: SupervisorEvent) {
        self(server_id, event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// When false the process is created without a console window.
    pub show_console: bool,
    /// Written to stdin before the termination signal on stop.
    pub graceful_command: Option<String>,
}

impl LaunchSpec {
    pub fn from_config(cfg: &ServerConfig, show_console: bool) -> Self {
        Self {
            executable: cfg.executable.clone(),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir(),
            show_console,
            graceful_command: cfg.graceful_command.clone(),
        }
    }
}

/// A process spawned by this supervisor.
#[derive(Debug, Clone)]
pub struct OwnedProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    started_at: Instant,
    graceful_command: Option<String>,
}

enum Liveness {
    Alive,
    Exited(Option<i32>),
}

impl OwnedProcess {
    fn liveness(&self) -> Liveness {
        match self.child.lock().try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(status)) => Liveness::Exited(status.code()),
            Err(e) => {
                tracing::debug!(pid = self.pid, error = %e, "try_wait failed; treating as exited");
                Liveness::Exited(None)
            }
        }
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut slot = self.stdin.lock();
        let stdin = slot.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "console input already closed")
        })?;
        stdin.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            stdin.write_all(b"\n")?;
        }
        stdin.flush()
    }
}

impl Terminable for OwnedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.liveness(), Liveness::Alive)
    }

    fn send_exit_command(&mut self) -> std::io::Result<bool> {
        let Some(cmd) = self.graceful_command.clone() else {
            return Ok(false);
        };
        self.write_line(&cmd)?;
        // Closing stdin lets servers that wait on EOF exit too.
        self.stdin.lock().take();
        Ok(true)
    }

    fn signal_terminate(&mut self) -> std::io::Result<()> {
        // Spawned as its own group leader, so pid == pgid.
        shutdown::signal_group(self.pid, Signal::Terminate)
    }

    fn force_exit(&mut self) -> std::io::Result<()> {
        let group = shutdown::signal_group(self.pid, Signal::Kill);
        match self.child.lock().kill() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        group
    }
}

/// Authoritative process handle for one server.
#[derive(Debug, Clone)]
pub enum ServerProcessHandle {
    Owned(OwnedProcess),
    /// Found by scanning; no stdio.
    Adopted { pid: u32 },
}

impl ServerProcessHandle {
    pub fn pid(&self) -> u32 {
        match self {
            ServerProcessHandle::Owned(o) => o.pid,
            ServerProcessHandle::Adopted { pid } => *pid,
        }
    }

    pub fn is_adopted(&self) -> bool {
        matches!(self, ServerProcessHandle::Adopted { .. })
    }

    /// Interactive input is only possible for processes launched here.
    pub fn has_command_channel(&self) -> bool {
        !self.is_adopted()
    }
}

#[derive(Debug, Default)]
struct StatusCache {
    checked_at: Option<Instant>,
    last: bool,
}

#[derive(Debug)]
struct Lifecycle {
    state: ServerState,
    message: Option<String>,
}

enum HandleCheck {
    Empty,
    Alive,
    Exited,
}

/// Collaborators and tunables for a supervisor.
pub struct SupervisorParts {
    pub probe: Arc<dyn ProcessProbe>,
    pub windows: WindowLocator,
    pub settings: Arc<dyn SettingsStore>,
    pub sink: Arc<dyn StatusSink>,
    pub timings: SupervisorTimings,
    pub state_dir: PathBuf,
}

struct Inner {
    id: ServerId,
    config: ServerConfig,
    exe_name: String,
    timings: SupervisorTimings,
    state_dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    windows: WindowLocator,
    settings: Arc<dyn SettingsStore>,
    sink: Arc<dyn StatusSink>,

    lifecycle: Mutex<Lifecycle>,
    handle: Mutex<Option<ServerProcessHandle>>,
    cache: Mutex<StatusCache>,
    last_launch: Mutex<Option<LaunchSpec>>,
    console: Mutex<Option<ConsoleWindowRef>>,
    adopt_candidate: Mutex<Option<u32>>,
    launch_lock: Mutex<()>,
    generation: AtomicU64,
}

/// Owns or adopts the process of one server id.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: ServerConfig, parts: SupervisorParts) -> Self {
        let id = ServerId::new(config.id.clone());
        let adopt_candidate = run_record::load(&parts.state_dir, id.as_str()).map(|rec| {
            tracing::debug!(server_id = %id, pid = rec.pid, "run record found; will verify before adopting");
            rec.pid
        });
        let exe_name = exe_name_of(&config.executable);

        Self {
            inner: Arc::new(Inner {
                id,
                config,
                exe_name,
                timings: parts.timings,
                state_dir: parts.state_dir,
                probe: parts.probe,
                windows: parts.windows,
                settings: parts.settings,
                sink: parts.sink,
                lifecycle: Mutex::new(Lifecycle {
                    state: ServerState::Stopped,
                    message: None,
                }),
                handle: Mutex::new(None),
                cache: Mutex::new(StatusCache::default()),
                last_launch: Mutex::new(None),
                console: Mutex::new(None),
                adopt_candidate: Mutex::new(adopt_candidate),
                launch_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.inner.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        self.inner.lifecycle.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.handle.lock().as_ref().map(ServerProcessHandle::pid)
    }

    pub fn status(&self) -> ProcessStatus {
        let handle = self.inner.handle.lock().clone();
        let lc = self.inner.lifecycle.lock();
        ProcessStatus {
            id: self.inner.id.clone(),
            state: lc.state,
            pid: handle.as_ref().map(ServerProcessHandle::pid),
            adopted: handle.as_ref().is_some_and(ServerProcessHandle::is_adopted),
            command_channel: handle
                .as_ref()
                .is_some_and(ServerProcessHandle::has_command_channel),
            message: lc.message.clone(),
        }
    }

    /// Launch parameters from settings, honouring the console preference.
    pub fn default_launch_spec(&self) -> LaunchSpec {
        let show = self.inner.settings.get_bool(settings::CONSOLE_VISIBLE, false);
        LaunchSpec::from_config(&self.inner.config, show)
    }

    fn emit(&self, event: SupervisorEvent) {
        tracing::info!(
            server_id = %self.inner.id,
            kind = event.kind().as_str(),
            "{}",
            event.message()
        );
        self.inner.sink.notify(&self.inner.id, event);
    }

    fn transition(&self, next: ServerState, message: Option<String>) -> bool {
        let mut lc = self.inner.lifecycle.lock();
        if !lc.state.can_transition_to(next) {
            tracing::debug!(
                server_id = %self.inner.id,
                from = ?lc.state,
                to = ?next,
                "ignored state transition"
            );
            return false;
        }
        tracing::debug!(server_id = %self.inner.id, from = ?lc.state, to = ?next, "state transition");
        lc.state = next;
        if message.is_some() {
            lc.message = message;
        }
        true
    }

    fn set_message(&self, message: String) {
        self.inner.lifecycle.lock().message = Some(message);
    }

    fn set_cache(&self, running: bool) {
        let mut cache = self.inner.cache.lock();
        cache.checked_at = Some(Instant::now());
        cache.last = running;
    }

    fn install(&self, handle: ServerProcessHandle) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.handle.lock() = Some(handle);
        self.inner.console.lock().take();
        self.set_cache(true);
        generation
    }

    /// Spawns the server. Rejects a missing executable and refuses to start
    /// a second copy while one is running (owned or adopted).
    pub fn start(&self, spec: LaunchSpec) -> Result<ServerProcessHandle> {
        let _launch = self.inner.launch_lock.lock();

        if !spec.executable.exists() {
            let err = SupervisorError::ExecutableMissing(spec.executable.clone());
            self.set_message(user_message::report("start", &err));
            return Err(err);
        }
        if self.state() == ServerState::Stopping || self.is_running() {
            return Err(SupervisorError::AlreadyRunning(self.inner.id.to_string()));
        }
        if !self.transition(ServerState::Starting, Some("starting".to_string())) {
            return Err(SupervisorError::AlreadyRunning(self.inner.id.to_string()));
        }

        let owned = match self.spawn(&spec) {
            Ok(owned) => owned,
            Err(err) => {
                let line = user_message::report("start", &err);
                self.transition(ServerState::Error, Some(line));
                return Err(err);
            }
        };
        let pid = owned.pid;
        let handle = ServerProcessHandle::Owned(owned);
        let generation = self.install(handle.clone());
        *self.inner.last_launch.lock() = Some(spec.clone());
        self.inner.adopt_candidate.lock().take();

        let record = RunRecord::new(
            self.inner.id.as_str(),
            pid,
            &spec.executable,
            &spec.args,
            &spec.working_dir,
        );
        if let Err(e) = run_record::write(&self.inner.state_dir, &record) {
            tracing::warn!(server_id = %self.inner.id, error = %format!("{e:#}"), "failed to write run record");
        }

        self.emit(SupervisorEvent::Started {
            pid,
            command_channel: true,
        });
        self.spawn_watcher(generation, self.inner.timings.poll_interval);
        Ok(handle)
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<OwnedProcess> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            let flags = if spec.show_console {
                CREATE_NEW_CONSOLE
            } else {
                CREATE_NO_WINDOW
            };
            cmd.creation_flags(flags);
        }

        tracing::info!(
            server_id = %self.inner.id,
            exec = %spec.executable.display(),
            args = %spec.args.join(" "),
            cwd = %spec.working_dir.display(),
            show_console = spec.show_console,
            "spawning server"
        );
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            exec: spec.executable.clone(),
            source,
        })?;
        let stdin = child.stdin.take();
        Ok(OwnedProcess {
            pid: child.id(),
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            started_at: Instant::now(),
            graceful_command: spec.graceful_command.clone(),
        })
    }

    /// Checks the current handle; an exited process is removed and reported.
    fn check_handle(&self) -> HandleCheck {
        let mut guard = self.inner.handle.lock();
        let exit = match guard.as_ref() {
            None => return HandleCheck::Empty,
            Some(ServerProcessHandle::Owned(o)) => match o.liveness() {
                Liveness::Alive => return HandleCheck::Alive,
                Liveness::Exited(code) => code,
            },
            Some(ServerProcessHandle::Adopted { pid }) => {
                if self.inner.probe.is_alive(*pid) {
                    return HandleCheck::Alive;
                }
                None
            }
        };
        let gone = guard.take();
        drop(guard);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(gone) = gone {
            self.on_exit(&gone, exit);
        }
        HandleCheck::Exited
    }

    fn on_exit(&self, gone: &ServerProcessHandle, code: Option<i32>) {
        self.inner.console.lock().take();
        self.set_cache(false);

        let state = self.state();
        if state == ServerState::Stopping {
            return;
        }
        run_record::remove(&self.inner.state_dir, self.inner.id.as_str());
        if !matches!(
            state,
            ServerState::Starting | ServerState::Running | ServerState::Active
        ) {
            return;
        }

        let early = match gone {
            ServerProcessHandle::Owned(o) => o.started_at.elapsed() < self.inner.timings.early_exit,
            ServerProcessHandle::Adopted { .. } => false,
        };
        let err = SupervisorError::ProcessExit { code, early };
        let line = user_message::one_line(&err.to_string());
        tracing::warn!(server_id = %self.inner.id, pid = gone.pid(), ?code, "{line}");
        if self.transition(ServerState::Error, Some(line.clone())) {
            self.emit(SupervisorEvent::error(line));
        }
    }

    /// One lightweight thread per handle: promotes `Starting` to `Running`
    /// and reports unexpected exits.
    fn spawn_watcher(&self, generation: u64, interval: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = format!("warden-exit-{}", self.inner.id);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let sup = ProcessSupervisor { inner };
                match sup.check_handle() {
                    HandleCheck::Alive => {
                        if sup.state() == ServerState::Starting {
                            sup.transition(ServerState::Running, Some("running".to_string()));
                        }
                    }
                    HandleCheck::Exited | HandleCheck::Empty => return,
                }
                drop(sup);
                std::thread::sleep(interval);
            }
        });
        if let Err(e) = spawned {
            tracing::warn!(server_id = %self.inner.id, error = %e, "failed to spawn exit watcher");
        }
    }

    fn adopt(&self, pid: u32, source: &str) {
        let generation = self.install(ServerProcessHandle::Adopted { pid });
        let message = format!("adopted running server (pid {pid}, {source}); console input unavailable");
        self.transition(ServerState::Running, Some(message.clone()));
        self.emit(SupervisorEvent::success(message));
        self.spawn_watcher(generation, self.inner.timings.status_cache_ttl);
    }

    /// Whether the server process is alive.
    ///
    /// Order: owned handle, adopted pid, run-record candidate, then (only
    /// once the cache has expired) a system-wide scan that adopts a match.
    pub fn is_running(&self) -> bool {
        if let HandleCheck::Alive = self.check_handle() {
            self.set_cache(true);
            return true;
        }

        let candidate = self.inner.adopt_candidate.lock().take();
        if let Some(pid) = candidate
            && self.inner.probe.matches(pid, &self.inner.exe_name)
        {
            self.adopt(pid, "from run record");
            return true;
        }

        {
            let cache = self.inner.cache.lock();
            if let Some(at) = cache.checked_at
                && at.elapsed() < self.inner.timings.status_cache_ttl
            {
                return cache.last;
            }
        }

        let pids = self.inner.probe.find_by_name(&self.inner.exe_name);
        let Some(&first) = pids.first() else {
            self.set_cache(false);
            return false;
        };
        if pids.len() > 1 {
            tracing::warn!(
                server_id = %self.inner.id,
                exe = %self.inner.exe_name,
                candidates = ?pids,
                chosen = first,
                "several processes match; adopting the first"
            );
        }
        self.adopt(first, "found by scan");
        true
    }

    /// Marks the server ready. Only `Starting`/`Running` move to `Active`;
    /// returns false if nothing changed.
    pub fn mark_active(&self) -> bool {
        let from = self.state();
        if !matches!(from, ServerState::Starting | ServerState::Running) {
            return false;
        }
        if !self.transition(ServerState::Active, Some("ready".to_string())) {
            return false;
        }
        self.emit(SupervisorEvent::Active);
        true
    }

    /// Stops the server on a background thread. `callback` receives exactly
    /// one event: `Stopped` or `Warning`.
    pub fn stop(&self, callback: impl FnOnce(SupervisorEvent) + Send + 'static) {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let worker_slot = slot.clone();
        let sup = self.clone();
        let name = format!("warden-stop-{}", self.inner.id);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let event = sup.stop_blocking();
            if let Some(cb) = worker_slot.lock().take() {
                cb(event);
            }
        });
        if let Err(e) = spawned
            && let Some(cb) = slot.lock().take()
        {
            cb(SupervisorEvent::warning(format!("could not start stop worker: {e}")));
        }
    }

    fn begin_stop(&self) -> std::result::Result<(), SupervisorEvent> {
        let mut lc = self.inner.lifecycle.lock();
        if lc.state == ServerState::Stopping {
            return Err(SupervisorEvent::warning("stop already in progress"));
        }
        if lc.state.can_transition_to(ServerState::Stopping) {
            lc.state = ServerState::Stopping;
            lc.message = Some("stopping".to_string());
        }
        Ok(())
    }

    /// Blocking stop. Always concludes within the graceful plus forced
    /// timeouts and always declares the server stopped afterwards.
    pub fn stop_blocking(&self) -> SupervisorEvent {
        if self.state() == ServerState::Stopping {
            return SupervisorEvent::warning("stop already in progress");
        }

        let mut handle = self.inner.handle.lock().clone();
        if handle.is_none() && self.is_running() {
            handle = self.inner.handle.lock().clone();
        }
        let Some(handle) = handle else {
            if self.state() == ServerState::Error {
                self.transition(ServerState::Stopped, None);
            }
            return SupervisorEvent::warning("server is not running");
        };
        if let Err(event) = self.begin_stop() {
            return event;
        }

        let esc = Escalation {
            graceful_timeout: self.inner.timings.graceful_timeout,
            term_grace: self.inner.timings.term_grace.min(self.inner.timings.graceful_timeout),
            forced_timeout: self.inner.timings.forced_timeout,
            poll_interval: self.inner.timings.poll_interval,
        };
        let pid = handle.pid();
        tracing::info!(server_id = %self.inner.id, pid, adopted = handle.is_adopted(), "stopping server");
        let outcome = match &handle {
            ServerProcessHandle::Owned(o) => shutdown::terminate(&mut o.clone(), &esc),
            ServerProcessHandle::Adopted { pid } => shutdown::terminate(
                &mut AdoptedProcess {
                    pid: *pid,
                    probe: self.inner.probe.as_ref(),
                },
                &esc,
            ),
        };
        if !outcome.exited {
            let err = SupervisorError::TerminationTimeout {
                pid,
                waited: esc.graceful_timeout + esc.forced_timeout,
            };
            tracing::warn!(server_id = %self.inner.id, "{err}; declaring it stopped anyway");
        }

        self.inner.handle.lock().take();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.console.lock().take();
        self.inner.adopt_candidate.lock().take();
        self.set_cache(false);
        run_record::remove(&self.inner.state_dir, self.inner.id.as_str());

        let event = SupervisorEvent::Stopped {
            forced: outcome.forced,
        };
        self.transition(ServerState::Stopped, Some(event.message()));
        tracing::info!(server_id = %self.inner.id, pid, forced = outcome.forced, "server stopped");
        event
    }

    /// Stops, then starts again with the last launch parameters once the
    /// stop has concluded. `callback` sees the stop event first, then the
    /// start outcome.
    pub fn restart(&self, callback: impl FnMut(SupervisorEvent) + Send + 'static) {
        let spec = self
            .inner
            .last_launch
            .lock()
            .clone()
            .unwrap_or_else(|| self.default_launch_spec());
        let sup = self.clone();
        let mut callback = callback;
        self.stop(move |stopped| {
            callback(stopped);
            let next = match sup.start(spec) {
                Ok(handle) => SupervisorEvent::Started {
                    pid: handle.pid(),
                    command_channel: handle.has_command_channel(),
                },
                Err(e) => SupervisorEvent::error(user_message::from_error(&e)),
            };
            callback(next);
        });
    }

    /// Writes one line to the server console (owned sessions only).
    pub fn send_command(&self, line: &str) -> Result<()> {
        let handle = self.inner.handle.lock().clone();
        match handle {
            None => Err(SupervisorError::NotRunning(self.inner.id.to_string())),
            Some(ServerProcessHandle::Adopted { .. }) => Err(SupervisorError::NoCommandChannel),
            Some(ServerProcessHandle::Owned(o)) => {
                o.write_line(line).map_err(SupervisorError::CommandWrite)
            }
        }
    }

    fn with_console(&self, op: impl FnOnce(&WindowLocator, &mut ConsoleWindowRef) -> bool) -> bool {
        let Some(pid) = self.pid() else {
            tracing::debug!(server_id = %self.inner.id, "no process; console unavailable");
            return false;
        };
        let windows = &self.inner.windows;
        let mut slot = self.inner.console.lock();
        let stale = match slot.as_mut() {
            Some(r) => r.pid != pid || !windows.revalidate(r),
            None => true,
        };
        if stale {
            *slot = match windows.find(pid) {
                Ok(found) => Some(found),
                Err(e) => {
                    tracing::debug!(server_id = %self.inner.id, error = %e, "console window lookup failed");
                    None
                }
            };
        }
        let Some(window) = slot.as_mut() else {
            return false;
        };
        let ok = op(windows, window);
        if !window.is_valid() {
            *slot = None;
        }
        ok
    }

    /// Persists the preference, then applies it to the current window if
    /// one can be found.
    pub fn set_console_visible(&self, visible: bool) -> bool {
        let value = if visible { "true" } else { "false" };
        if let Err(e) = self.inner.settings.set(settings::CONSOLE_VISIBLE, value) {
            user_message::report("save console preference", &e);
        }
        self.with_console(|loc, w| loc.set_visible(w, visible))
    }

    /// Re-applies the stored preference, e.g. once a window has appeared.
    pub fn apply_console_preference(&self) -> bool {
        let visible = self.inner.settings.get_bool(settings::CONSOLE_VISIBLE, false);
        let current = self.inner.console.lock().as_ref().map(|w| w.visible);
        if current == Some(visible) {
            return true;
        }
        self.with_console(|loc, w| w.visible == visible || loc.set_visible(w, visible))
    }

    pub fn minimize_console(&self) -> bool {
        self.with_console(|loc, w| loc.minimize(w))
    }

    pub fn restore_console(&self) -> bool {
        self.with_console(|loc, w| loc.restore(w))
    }
}
