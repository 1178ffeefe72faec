use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("server executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("failed to launch {}: {source}", .exec.display())]
    Spawn {
        exec: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server {0} is already running")]
    AlreadyRunning(String),

    #[error("server {0} is not running")]
    NotRunning(String),

    #[error("server process {} ({})", exit_phrase(.early), exit_label(.code))]
    ProcessExit { code: Option<i32>, early: bool },

    #[error("process {pid} did not exit within {}s", .waited.as_secs())]
    TerminationTimeout { pid: u32, waited: Duration },

    #[error("no console window found for process {0}")]
    WindowNotFound(u32),

    #[error("log file {} is not readable: {source}", .path.display())]
    LogAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server was adopted from a previous session; console input is unavailable")]
    NoCommandChannel,

    #[error("failed to write to server console: {0}")]
    CommandWrite(#[source] std::io::Error),

    #[error("settings error: {0}")]
    Settings(String),
}

fn exit_phrase(early: &bool) -> &'static str {
    if *early {
        "terminated immediately"
    } else {
        "exited unexpectedly"
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "exit code unknown".to_string(),
    }
}

impl SupervisorError {
    /// Launch failures are fatal to the `start` call that produced them only.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            SupervisorError::ExecutableMissing(_) | SupervisorError::Spawn { .. }
        )
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
