use std::fmt;

/// Logical identity of a supervised server (one install, one log directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of one server as seen by its supervisor.
///
/// `Active` is only reachable through an external "startup complete" signal
/// observed in the server log; the supervisor never infers it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Active,
    Stopping,
    Error,
}

impl ServerState {
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Stopped, Running)
                | (Starting, Running)
                | (Starting, Active)
                | (Starting, Stopping)
                | (Starting, Error)
                | (Running, Active)
                | (Running, Stopping)
                | (Running, Error)
                | (Active, Stopping)
                | (Active, Error)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Running)
                | (Error, Stopping)
                | (Error, Stopped)
        )
    }

    /// True while a process is (believed to be) alive for this server.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::Running | ServerState::Active | ServerState::Stopping
        )
    }
}

/// Closed set of status kinds delivered to the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Started,
    Success,
    Stopped,
    Error,
    Active,
    Warning,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Started => "started",
            StatusKind::Success => "success",
            StatusKind::Stopped => "stopped",
            StatusKind::Error => "error",
            StatusKind::Active => "active",
            StatusKind::Warning => "warning",
        }
    }
}

/// Status notification with a typed payload per kind.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SupervisorEvent {
    /// A process was launched (owned) and is being watched.
    Started { pid: u32, command_channel: bool },
    /// An auxiliary operation succeeded (adoption, console visibility).
    Success { message: String },
    /// A stop attempt concluded. `forced` is set when escalation was needed.
    Stopped { forced: bool },
    /// Launch failure or unexpected exit.
    Error { message: String },
    /// The server log reported startup completion.
    Active,
    /// Non-fatal condition the user should know about.
    Warning { message: String },
}

impl SupervisorEvent {
    pub fn kind(&self) -> StatusKind {
        match self {
            SupervisorEvent::Started { .. } => StatusKind::Started,
            SupervisorEvent::Success { .. } => StatusKind::Success,
            SupervisorEvent::Stopped { .. } => StatusKind::Stopped,
            SupervisorEvent::Error { .. } => StatusKind::Error,
            SupervisorEvent::Active => StatusKind::Active,
            SupervisorEvent::Warning { .. } => StatusKind::Warning,
        }
    }

    /// Short human message for status bars.
    pub fn message(&self) -> String {
        match self {
            SupervisorEvent::Started {
                pid,
                command_channel: true,
            } => format!("server started (pid {pid})"),
            SupervisorEvent::Started {
                pid,
                command_channel: false,
            } => format!("server started (pid {pid}, log tailing only)"),
            SupervisorEvent::Success { message }
            | SupervisorEvent::Error { message }
            | SupervisorEvent::Warning { message } => message.clone(),
            SupervisorEvent::Stopped { forced: false } => "server stopped".to_string(),
            SupervisorEvent::Stopped { forced: true } => {
                "server stopped (forced after timeout)".to_string()
            }
            SupervisorEvent::Active => "server is ready for players".to_string(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub id: ServerId,
    pub state: ServerState,
    pub pid: Option<u32>,
    /// Process was discovered by scanning rather than spawned here.
    pub adopted: bool,
    /// Interactive stdin is available (owned sessions only).
    pub command_channel: bool,
    pub message: Option<String>,
}

/// One trimmed log line in transit from a tailer to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub server_id: ServerId,
    pub text: String,
}
