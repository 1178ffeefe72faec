use std::time::{Duration, Instant};

use crate::process_probe::ProcessProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Sends `signal` to a single process. A process that is already gone is
/// not an error.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: Signal) -> std::io::Result<()> {
    let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
    send(raw, signal)
}

/// Sends `signal` to every process in the group led by `pgid`.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: Signal) -> std::io::Result<()> {
    let raw = i32::try_from(pgid).map_err(std::io::Error::other)?;
    send(-raw, signal)
}

#[cfg(unix)]
fn send(target: i32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(target, sig) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(windows)]
pub fn signal_pid(pid: u32, signal: Signal) -> std::io::Result<()> {
    use std::process::{Command, Stdio};

    let pid = pid.to_string();
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", pid.as_str(), "/T"]);
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
    Ok(())
}

#[cfg(windows)]
pub fn signal_group(pgid: u32, signal: Signal) -> std::io::Result<()> {
    // `/T` already walks the child tree.
    signal_pid(pgid, signal)
}

/// Something that can be asked to exit and then killed.
pub trait Terminable {
    fn pid(&self) -> u32;

    fn has_exited(&mut self) -> bool;

    /// Writes a console exit command if one is configured. Returns true if
    /// a command was delivered.
    fn send_exit_command(&mut self) -> std::io::Result<bool> {
        Ok(false)
    }

    fn signal_terminate(&mut self) -> std::io::Result<()>;

    fn force_exit(&mut self) -> std::io::Result<()>;
}

/// A process known only by pid.
pub struct AdoptedProcess<'a> {
    pub pid: u32,
    pub probe: &'a dyn ProcessProbe,
}

impl Terminable for AdoptedProcess<'_> {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        !self.probe.is_alive(self.pid)
    }

    fn signal_terminate(&mut self) -> std::io::Result<()> {
        signal_pid(self.pid, Signal::Terminate)
    }

    fn force_exit(&mut self) -> std::io::Result<()> {
        signal_pid(self.pid, Signal::Kill)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    pub graceful_timeout: Duration,
    /// After a console command, SIGTERM is held back until this much of
    /// `graceful_timeout` remains.
    pub term_grace: Duration,
    pub forced_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Forced termination had to be issued.
    pub forced: bool,
    /// The process was observed gone before the last deadline.
    pub exited: bool,
}

/// Polls `exited` until it returns true or `timeout` elapses.
pub fn wait_until(timeout: Duration, poll: Duration, mut exited: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if exited() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Runs the full escalation. Never waits longer than
/// `graceful_timeout + forced_timeout` (plus one poll slice).
pub fn terminate(target: &mut dyn Terminable, esc: &Escalation) -> Outcome {
    let pid = target.pid();
    if target.has_exited() {
        return Outcome {
            forced: false,
            exited: true,
        };
    }

    let command_sent = match target.send_exit_command() {
        Ok(sent) => sent,
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to send console exit command");
            false
        }
    };

    let mut remaining = esc.graceful_timeout;
    if command_sent {
        tracing::debug!(pid, "console exit command sent");
        let quiet = esc.graceful_timeout.saturating_sub(esc.term_grace);
        if wait_until(quiet, esc.poll_interval, || target.has_exited()) {
            return Outcome {
                forced: false,
                exited: true,
            };
        }
        remaining = esc.graceful_timeout - quiet;
    }

    match target.signal_terminate() {
        Ok(()) => tracing::debug!(pid, "termination signal sent"),
        Err(e) => tracing::warn!(pid, error = %e, "termination signal failed"),
    }
    if wait_until(remaining, esc.poll_interval, || target.has_exited()) {
        return Outcome {
            forced: false,
            exited: true,
        };
    }

    tracing::warn!(
        pid,
        waited_ms = esc.graceful_timeout.as_millis() as u64,
        "process did not exit in time; forcing"
    );
    if let Err(e) = target.force_exit() {
        tracing::warn!(pid, error = %e, "forced termination failed");
    }
    let exited = wait_until(esc.forced_timeout, esc.poll_interval, || target.has_exited());
    Outcome {
        forced: true,
        exited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scripted {
        has_command: bool,
        exit_after_command: bool,
        exit_after_term: bool,
        exit_after_force: bool,
        commanded: bool,
        termed: bool,
        forced: bool,
    }

    impl Terminable for Scripted {
        fn pid(&self) -> u32 {
            4242
        }

        fn has_exited(&mut self) -> bool {
            (self.commanded && self.exit_after_command)
                || (self.termed && self.exit_after_term)
                || (self.forced && self.exit_after_force)
        }

        fn send_exit_command(&mut self) -> std::io::Result<bool> {
            self.commanded = self.has_command;
            Ok(self.has_command)
        }

        fn signal_terminate(&mut self) -> std::io::Result<()> {
            self.termed = true;
            Ok(())
        }

        fn force_exit(&mut self) -> std::io::Result<()> {
            self.forced = true;
            Ok(())
        }
    }

    fn quick() -> Escalation {
        Escalation {
            graceful_timeout: Duration::from_millis(60),
            term_grace: Duration::from_millis(30),
            forced_timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn console_command_alone_can_finish_the_job() {
        let mut t = Scripted {
            has_command: true,
            exit_after_command: true,
            ..Scripted::default()
        };
        let out = terminate(&mut t, &quick());
        assert_eq!(
            out,
            Outcome {
                forced: false,
                exited: true
            }
        );
        assert!(!t.termed && !t.forced);
    }

    #[test]
    fn term_signal_follows_ignored_command() {
        let mut t = Scripted {
            has_command: true,
            exit_after_term: true,
            ..Scripted::default()
        };
        let out = terminate(&mut t, &quick());
        assert!(!out.forced && out.exited);
        assert!(t.commanded && t.termed);
    }

    #[test]
    fn without_command_terminate_is_immediate() {
        let mut t = Scripted {
            exit_after_term: true,
            ..Scripted::default()
        };
        let out = terminate(&mut t, &quick());
        assert!(out.exited && !t.forced);
        assert!(!t.commanded && t.termed);
    }

    #[test]
    fn stubborn_process_is_forced() {
        let mut t = Scripted {
            exit_after_force: true,
            ..Scripted::default()
        };
        let out = terminate(&mut t, &quick());
        assert!(out.forced && out.exited);
    }

    #[test]
    fn unkillable_process_returns_after_both_deadlines() {
        let mut t = Scripted::default();
        let started = Instant::now();
        let out = terminate(&mut t, &quick());
        assert!(out.forced && !out.exited);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    #[cfg(unix)]
    fn signals_to_missing_pid_are_ignored() {
        assert!(signal_pid(999_999_999, Signal::Terminate).is_ok());
    }
}
