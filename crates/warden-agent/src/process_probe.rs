use std::path::Path;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Port for process-table lookups so supervisors can be tested without
/// scanning the real system.
pub trait ProcessProbe: Send + Sync {
    /// Pids of every running process whose executable name matches `exe_name`.
    fn find_by_name(&self, exe_name: &str) -> Vec<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    /// True if `pid` is alive and runs an executable named `exe_name`.
    fn matches(&self, pid: u32, exe_name: &str) -> bool {
        self.is_alive(pid) && self.find_by_name(exe_name).contains(&pid)
    }
}

/// Canonical comparison key for executable names: lowercase, no `.exe`.
pub fn normalize_exe_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map(str::to_string)
        .unwrap_or(lower)
}

pub fn exe_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// Linux truncates `comm` to 15 bytes; accept a prefix match at that length.
const COMM_LEN: usize = 15;

fn name_matches(candidate: &str, wanted: &str) -> bool {
    let c = normalize_exe_name(candidate);
    let w = normalize_exe_name(wanted);
    if c == w {
        return true;
    }
    c.len() == COMM_LEN && w.starts_with(&c)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn find_by_name(&self, exe_name: &str) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut out: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, p)| {
                let name = p.name().to_string_lossy();
                let exe_hit = p
                    .exe()
                    .is_some_and(|exe| name_matches(&exe_name_of(exe), exe_name));
                exe_hit || name_matches(&name, exe_name)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        out.sort_unstable();
        out
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Null signal checks existence without delivering anything.
        let rc = unsafe { libc::kill(raw, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM still means the process exists.
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }

    fn matches(&self, pid: u32, exe_name: &str) -> bool {
        let mut system = System::new();
        let spid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
        system.process(spid).is_some_and(|p| {
            name_matches(&p.name().to_string_lossy(), exe_name)
                || p.exe()
                    .is_some_and(|exe| name_matches(&exe_name_of(exe), exe_name))
        })
    }
}
