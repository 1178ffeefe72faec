use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use warden_process::ServerId;

use crate::config::TailSettings;
use crate::error::{Result, SupervisorError};

/// How much existing content to replay when a log file is first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogPolicy {
    /// Every line in the file (fresh start: it is all new output).
    Full,
    /// Only the last K lines (reattaching to a server that was already running).
    LastLines(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailState {
    pub path: Option<PathBuf>,
    pub offset: u64,
    pub backlog_loaded: bool,
}

#[derive(Debug, Default)]
pub struct TailBatch {
    pub lines: Vec<String>,
    /// The lines of this poll contain the ready marker.
    pub server_ready: bool,
    /// The tracked path changed or was truncated during this poll.
    pub reset: bool,
}

pub struct LogTailer {
    server_id: ServerId,
    log_dir: PathBuf,
    pattern: glob::Pattern,
    settings: TailSettings,
    policy: BacklogPolicy,
    state: TailState,
}

fn trimmed_lines(buf: &[u8]) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences are replaced.
    String::from_utf8_lossy(buf)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn apply_policy(mut lines: Vec<String>, policy: BacklogPolicy) -> Vec<String> {
    if let BacklogPolicy::LastLines(k) = policy
        && lines.len() > k
    {
        lines.drain(0..(lines.len() - k));
    }
    lines
}

/// Newest file in `dir` whose name matches `pattern`. Ties on modification
/// time go to the lexically greatest name.
pub fn resolve_latest_log(dir: &Path, pattern: &glob::Pattern) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| pattern.matches(&e.file_name().to_string_lossy()))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((mtime, e.file_name(), e.path()))
        })
        .max_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)))
        .map(|(_, _, path)| path)
}

impl LogTailer {
    pub fn new(
        server_id: ServerId,
        log_dir: PathBuf,
        log_pattern: &str,
        settings: TailSettings,
        policy: BacklogPolicy,
    ) -> std::result::Result<Self, glob::PatternError> {
        Ok(Self {
            server_id,
            log_dir,
            pattern: glob::Pattern::new(log_pattern)?,
            settings,
            policy,
            state: TailState::default(),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn state(&self) -> &TailState {
        &self.state
    }

    pub fn resolve_latest_log(&self) -> Option<PathBuf> {
        resolve_latest_log(&self.log_dir, &self.pattern)
    }

    fn reset(&mut self, path: PathBuf) {
        tracing::debug!(
            server_id = %self.server_id,
            path = %path.display(),
            previous = ?self.state.path,
            "tracking log file"
        );
        // Only the first file of a reattached session is limited; later
        // files are entirely new output.
        if self.state.path.is_some() {
            self.policy = BacklogPolicy::Full;
        }
        self.state = TailState {
            path: Some(path),
            offset: 0,
            backlog_loaded: false,
        };
    }

    /// Returns lines written since the last poll, re-resolving the newest
    /// log file first so rotation is picked up.
    pub fn poll(&mut self) -> Result<TailBatch> {
        let mut batch = TailBatch::default();
        self.poll_lines(&mut batch)?;
        batch.server_ready = batch
            .lines
            .iter()
            .any(|l| l.contains(self.settings.ready_marker.as_str()));
        Ok(batch)
    }

    fn poll_lines(&mut self, batch: &mut TailBatch) -> Result<()> {
        let Some(latest) = self.resolve_latest_log() else {
            return Ok(());
        };
        if self.state.path.as_deref() != Some(latest.as_path()) {
            // The old file may still hold lines the per-poll cap left behind.
            if self.drain_previous(batch)? {
                return Ok(());
            }
            self.reset(latest.clone());
            batch.reset = true;
        }

        let access = |source: std::io::Error| SupervisorError::LogAccess {
            path: latest.clone(),
            source,
        };
        let mut file = File::open(&latest).map_err(access)?;
        let len = file.metadata().map_err(access)?.len();

        if self.state.backlog_loaded && len < self.state.offset {
            tracing::info!(
                server_id = %self.server_id,
                path = %latest.display(),
                offset = self.state.offset,
                len,
                "log truncated; restarting from the top"
            );
            self.reset(latest.clone());
            batch.reset = true;
        }

        if self.state.backlog_loaded {
            self.read_forward(&mut file, batch).map_err(access)
        } else {
            self.load_backlog(&mut file, batch).map_err(access)
        }
    }

    /// Reads what is left of the tracked file before a switch. Returns true
    /// if it produced lines, in which case the switch waits for a later poll.
    fn drain_previous(&mut self, batch: &mut TailBatch) -> Result<bool> {
        let Some(current) = self.state.path.clone() else {
            return Ok(false);
        };
        if !self.state.backlog_loaded {
            return Ok(false);
        }
        let mut file = match File::open(&current) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(SupervisorError::LogAccess {
                    path: current,
                    source,
                });
            }
        };
        self.read_forward(&mut file, batch)
            .map_err(|source| SupervisorError::LogAccess {
                path: current,
                source,
            })?;
        Ok(!batch.lines.is_empty())
    }

    fn load_backlog(&mut self, file: &mut File, batch: &mut TailBatch) -> std::io::Result<()> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        // A trailing partial line is left for the incremental reader.
        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        batch
            .lines
            .extend(apply_policy(trimmed_lines(&buf[..complete]), self.policy));
        self.state.offset = complete as u64;
        self.state.backlog_loaded = true;
        tracing::debug!(
            server_id = %self.server_id,
            lines = batch.lines.len(),
            offset = self.state.offset,
            "backlog loaded"
        );
        Ok(())
    }

    fn read_forward(&mut self, file: &mut File, batch: &mut TailBatch) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(self.state.offset))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        while batch.lines.len() < self.settings.max_lines_per_poll {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.state.offset += n as u64;
            let text = String::from_utf8_lossy(&buf);
            let text = text.trim();
            if !text.is_empty() {
                batch.lines.push(text.to_string());
            }
        }
        Ok(())
    }
}
