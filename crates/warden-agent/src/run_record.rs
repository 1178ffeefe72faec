use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

const FILE_NAME: &str = "run.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub server_id: String,
    pub pid: u32,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
}

impl RunRecord {
    pub fn new(server_id: &str, pid: u32, exec: &Path, args: &[String], cwd: &Path) -> Self {
        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            server_id: server_id.to_string(),
            pid,
            exec: exec.display().to_string(),
            args: args.to_vec(),
            cwd: cwd.display().to_string(),
            started_at_unix_ms,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn path_for(state_dir: &Path, server_id: &str) -> PathBuf {
    state_dir.join(server_id).join(FILE_NAME)
}

pub fn write(state_dir: &Path, record: &RunRecord) -> anyhow::Result<()> {
    let dir = state_dir.join(&record.server_id);
    std::fs::create_dir_all(&dir).context("create server state dir")?;
    let path = dir.join(FILE_NAME);
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(record).context("serialize run.json")?;
    std::fs::write(&tmp, data).context("write run.json.tmp")?;
    std::fs::rename(&tmp, &path).context("persist run.json")?;
    Ok(())
}

/// Loads the last record for `server_id`. Missing or corrupt files yield `None`.
pub fn load(state_dir: &Path, server_id: &str) -> Option<RunRecord> {
    let path = path_for(state_dir, server_id);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read run record");
            return None;
        }
    };
    match serde_json::from_slice::<RunRecord>(&raw) {
        Ok(rec) if rec.server_id == server_id => Some(rec),
        Ok(rec) => {
            tracing::warn!(
                path = %path.display(),
                found = %rec.server_id,
                "run record belongs to another server; ignoring"
            );
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt run record; ignoring");
            None
        }
    }
}

pub fn remove(state_dir: &Path, server_id: &str) {
    let path = path_for(state_dir, server_id);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove run record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RunRecord::new(
            "island",
            1234,
            Path::new("/srv/ark/server"),
            &["-log".to_string()],
            Path::new("/srv/ark"),
        );
        write(dir.path(), &rec).unwrap();
        assert!(!dir.path().join("island").join("run.json.tmp").exists());

        let loaded = load(dir.path(), "island").unwrap();
        assert_eq!(loaded, rec);

        remove(dir.path(), "island");
        assert!(load(dir.path(), "island").is_none());
        remove(dir.path(), "island");
    }

    #[test]
    fn corrupt_or_foreign_records_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("island")).unwrap();
        std::fs::write(path_for(dir.path(), "island"), b"{not json").unwrap();
        assert!(load(dir.path(), "island").is_none());

        let other = RunRecord::new("center", 1, Path::new("/x"), &[], Path::new("/"));
        let data = serde_json::to_vec(&other).unwrap();
        std::fs::write(path_for(dir.path(), "island"), data).unwrap();
        assert!(load(dir.path(), "island").is_none());
    }
}
