use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::settings::{self, SettingsStore};

pub const DEFAULT_READY_MARKER: &str = "Server has completed startup and is now advertising for join";
pub const DEFAULT_LOG_SUBDIR: &str = "ShooterGame/Saved/Logs";
pub const DEFAULT_LOG_PATTERN: &str = "*.log";
pub const DEFAULT_WINDOW_KEYWORDS: &[&str] = &["console", "server", "shootergame"];

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_ms(name: &str, default_ms: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default_ms))
}

fn env_secs(name: &str, default_s: u64, min: u64, max: u64) -> Duration {
    Duration::from_secs(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default_s))
}

/// Timeouts and thresholds used by `ProcessSupervisor`.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub status_cache_ttl: Duration,
    pub graceful_timeout: Duration,
    /// Share of `graceful_timeout` left for SIGTERM after a console command.
    pub term_grace: Duration,
    pub forced_timeout: Duration,
    pub early_exit: Duration,
    /// Interval at which the exit watcher and stop waits poll the child.
    pub poll_interval: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            status_cache_ttl: Duration::from_secs(3),
            graceful_timeout: Duration::from_secs(10),
            term_grace: Duration::from_secs(5),
            forced_timeout: Duration::from_secs(5),
            early_exit: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl SupervisorTimings {
    pub fn from_env() -> Self {
        Self {
            status_cache_ttl: env_ms("WARDEN_STATUS_CACHE_TTL_MS", 3000, 250, 60_000),
            graceful_timeout: env_secs("WARDEN_GRACEFUL_TIMEOUT_SEC", 10, 1, 300),
            term_grace: env_secs("WARDEN_TERM_GRACE_SEC", 5, 1, 60),
            forced_timeout: env_secs("WARDEN_FORCED_TIMEOUT_SEC", 5, 1, 60),
            early_exit: env_ms("WARDEN_EARLY_EXIT_MS", 3000, 250, 60_000),
            ..Self::default()
        }
    }
}

/// Tail behaviour shared by every monitored server.
#[derive(Debug, Clone)]
pub struct TailSettings {
    /// Lines replayed when reattaching to an already running server.
    pub backlog_lines: usize,
    /// Upper bound of lines returned from a single poll.
    pub max_lines_per_poll: usize,
    pub ready_marker: String,
    pub active_delay: Duration,
    pub idle_delay_max: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            backlog_lines: 50,
            max_lines_per_poll: 200,
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            active_delay: Duration::from_millis(100),
            idle_delay_max: Duration::from_millis(1000),
        }
    }
}

impl TailSettings {
    pub fn from_env() -> Self {
        Self {
            backlog_lines: env_usize("WARDEN_BACKLOG_LINES")
                .map(|v| v.clamp(1, 5000))
                .unwrap_or(50),
            max_lines_per_poll: env_usize("WARDEN_MAX_LINES_PER_POLL")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(200),
            active_delay: env_ms("WARDEN_ACTIVE_POLL_MS", 100, 10, 5000),
            idle_delay_max: env_ms("WARDEN_IDLE_POLL_MAX_MS", 1000, 50, 60_000),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub verbose: bool,
    /// Directory for the rolling diagnostic log; `None` logs to stderr only.
    pub diagnostic_dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            verbose: std::env::var("WARDEN_VERBOSE")
                .ok()
                .and_then(|v| settings::parse_bool(&v))
                .unwrap_or(false),
            diagnostic_dir: std::env::var_os("WARDEN_DIAG_DIR").map(PathBuf::from),
        }
    }
}

/// Everything needed to launch and watch one server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub log_dir: PathBuf,
    pub log_pattern: String,
    pub graceful_command: Option<String>,
}

impl ServerConfig {
    /// Working directory is the executable's own directory.
    pub fn working_dir(&self) -> PathBuf {
        self.executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolves one server from key lookups, falling back to install-root defaults.
    pub fn from_settings(store: &dyn SettingsStore, id: &str) -> Self {
        let install_root = PathBuf::from(store.get_or(settings::INSTALL_ROOT, "."));
        let server_root = install_root.join(id);
        let executable = store
            .get(&settings::server_key(id, "executable"))
            .map(PathBuf::from)
            .unwrap_or_else(|| server_root.join("server"));
        let args = store
            .get(&settings::server_key(id, "args"))
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let log_dir = store
            .get(&settings::server_key(id, "log_dir"))
            .map(PathBuf::from)
            .unwrap_or_else(|| server_root.join(DEFAULT_LOG_SUBDIR));
        let log_pattern = store.get_or(&settings::server_key(id, "log_pattern"), DEFAULT_LOG_PATTERN);
        let graceful_command = store
            .get(&settings::server_key(id, "graceful_command"))
            .filter(|c| !c.trim().is_empty());

        Self {
            id: id.to_string(),
            executable,
            args,
            log_dir,
            log_pattern,
            graceful_command,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub settings_path: PathBuf,
    pub state_dir: PathBuf,
    pub relay_capacity: usize,
    pub join_timeout: Duration,
    pub window_keywords: Vec<String>,
    pub timings: SupervisorTimings,
    pub tail: TailSettings,
    pub logging: LoggingConfig,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let settings_path = std::env::var_os("WARDEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("warden.toml"));
        let state_dir = std::env::var_os("WARDEN_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./state"));

        Self {
            settings_path,
            state_dir,
            relay_capacity: env_usize("WARDEN_RELAY_CAPACITY")
                .map(|v| v.clamp(16, 1_000_000))
                .unwrap_or(4096),
            join_timeout: env_ms("WARDEN_JOIN_TIMEOUT_MS", 2000, 100, 60_000),
            window_keywords: DEFAULT_WINDOW_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            timings: SupervisorTimings::from_env(),
            tail: TailSettings::from_env(),
            logging: LoggingConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;

    #[test]
    fn server_defaults_derive_from_install_root() {
        let store = MemorySettings::new().with(settings::INSTALL_ROOT, "/srv/ark");
        let cfg = ServerConfig::from_settings(&store, "island");
        assert_eq!(cfg.executable, PathBuf::from("/srv/ark/island/server"));
        assert_eq!(
            cfg.log_dir,
            PathBuf::from("/srv/ark/island").join(DEFAULT_LOG_SUBDIR)
        );
        assert_eq!(cfg.log_pattern, "*.log");
        assert!(cfg.args.is_empty());
        assert!(cfg.graceful_command.is_none());
    }

    #[test]
    fn server_explicit_keys_win() {
        let store = MemorySettings::new()
            .with(&settings::server_key("island", "executable"), "/opt/game/bin/srv")
            .with(&settings::server_key("island", "args"), "Map?listen  -log")
            .with(&settings::server_key("island", "graceful_command"), "DoExit");
        let cfg = ServerConfig::from_settings(&store, "island");
        assert_eq!(cfg.working_dir(), PathBuf::from("/opt/game/bin"));
        assert_eq!(cfg.args, vec!["Map?listen", "-log"]);
        assert_eq!(cfg.graceful_command.as_deref(), Some("DoExit"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let t = SupervisorTimings::default();
        assert_eq!(t.graceful_timeout, Duration::from_secs(10));
        assert_eq!(t.forced_timeout, Duration::from_secs(5));
        let tail = TailSettings::default();
        assert_eq!(tail.backlog_lines, 50);
        assert!(tail.active_delay < tail.idle_delay_max);
    }
}
