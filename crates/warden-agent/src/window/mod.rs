use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SupervisorError};

mod noop;
#[cfg(windows)]
mod win32;

pub use noop::NoopWindowPort;
#[cfg(windows)]
pub use win32::Win32WindowPort;

/// Opaque platform window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

pub trait WindowPort: Send + Sync {
    /// All top-level windows, in platform enumeration order.
    fn enumerate(&self) -> Vec<WindowHandle>;

    fn title_of(&self, window: WindowHandle) -> Option<String>;

    fn class_of(&self, window: WindowHandle) -> Option<String>;

    /// `None` once the window no longer exists.
    fn owner_process_of(&self, window: WindowHandle) -> Option<u32>;

    fn is_visible(&self, window: WindowHandle) -> Option<bool>;

    /// Returns false if the platform rejected the call.
    fn set_visible(&self, window: WindowHandle, visible: bool) -> bool;

    fn is_minimized(&self, _window: WindowHandle) -> Option<bool> {
        None
    }

    fn set_minimized(&self, _window: WindowHandle, _minimized: bool) -> bool {
        false
    }
}

/// Weak reference to a process's console window.
///
/// The window can disappear independently of the process, so every use
/// revalidates the handle first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleWindowRef {
    pub handle: WindowHandle,
    pub pid: u32,
    /// Last confirmed visibility.
    pub visible: bool,
    valid: bool,
}

impl ConsoleWindowRef {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

const CONFIRM_ATTEMPTS: usize = 5;
const CONFIRM_DELAY: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct WindowLocator {
    port: Arc<dyn WindowPort>,
    keywords: Vec<String>,
}

impl WindowLocator {
    pub fn new(port: Arc<dyn WindowPort>, keywords: &[String]) -> Self {
        Self {
            port,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Locator for the current platform.
    pub fn platform(keywords: &[String]) -> Self {
        #[cfg(windows)]
        let port: Arc<dyn WindowPort> = Arc::new(Win32WindowPort);
        #[cfg(not(windows))]
        let port: Arc<dyn WindowPort> = Arc::new(NoopWindowPort);
        Self::new(port, keywords)
    }

    fn has_keyword(&self, window: WindowHandle) -> bool {
        let title = self.port.title_of(window).unwrap_or_default().to_lowercase();
        let class = self.port.class_of(window).unwrap_or_default().to_lowercase();
        self.keywords
            .iter()
            .any(|k| title.contains(k.as_str()) || class.contains(k.as_str()))
    }

    /// Finds the console window owned by `pid`.
    ///
    /// A title or class containing a known keyword wins; otherwise the first
    /// visible window of the process is taken.
    pub fn find(&self, pid: u32) -> Result<ConsoleWindowRef> {
        let candidates: Vec<WindowHandle> = self
            .port
            .enumerate()
            .into_iter()
            .filter(|w| self.port.owner_process_of(*w) == Some(pid))
            .collect();

        let chosen = candidates
            .iter()
            .copied()
            .find(|w| self.has_keyword(*w))
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .find(|w| self.port.is_visible(*w) == Some(true))
            })
            .ok_or(SupervisorError::WindowNotFound(pid))?;

        let visible = self.port.is_visible(chosen).unwrap_or(false);
        tracing::debug!(
            pid,
            handle = chosen.0,
            candidates = candidates.len(),
            visible,
            "console window located"
        );
        Ok(ConsoleWindowRef {
            handle: chosen,
            pid,
            visible,
            valid: true,
        })
    }

    /// True while the handle still denotes a window owned by the same process.
    pub fn revalidate(&self, window: &mut ConsoleWindowRef) -> bool {
        if window.valid && self.port.owner_process_of(window.handle) != Some(window.pid) {
            window.valid = false;
        }
        window.valid
    }

    fn confirm(&self, mut check: impl FnMut() -> bool) -> bool {
        for attempt in 0..CONFIRM_ATTEMPTS {
            if check() {
                return true;
            }
            if attempt + 1 < CONFIRM_ATTEMPTS {
                std::thread::sleep(CONFIRM_DELAY);
            }
        }
        false
    }

    /// Shows or hides the window and confirms the resulting state.
    ///
    /// Any failure invalidates `window`; callers rediscover rather than retry.
    pub fn set_visible(&self, window: &mut ConsoleWindowRef, visible: bool) -> bool {
        if !self.revalidate(window) {
            return false;
        }
        if !self.port.set_visible(window.handle, visible) {
            tracing::debug!(handle = window.handle.0, visible, "show/hide call rejected");
            window.invalidate();
            return false;
        }
        let handle = window.handle;
        if self.confirm(|| self.port.is_visible(handle) == Some(visible)) {
            window.visible = visible;
            true
        } else {
            tracing::debug!(handle = handle.0, visible, "visibility not confirmed");
            window.invalidate();
            false
        }
    }

    pub fn minimize(&self, window: &mut ConsoleWindowRef) -> bool {
        self.set_minimized(window, true)
    }

    pub fn restore(&self, window: &mut ConsoleWindowRef) -> bool {
        self.set_minimized(window, false)
    }

    fn set_minimized(&self, window: &mut ConsoleWindowRef, minimized: bool) -> bool {
        if !self.revalidate(window) {
            return false;
        }
        if !self.port.set_minimized(window.handle, minimized) {
            window.invalidate();
            return false;
        }
        let handle = window.handle;
        if self.confirm(|| self.port.is_minimized(handle) == Some(minimized)) {
            if !minimized {
                window.visible = true;
            }
            true
        } else {
            window.invalidate();
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeWindowPort;
    use super::*;

    fn keywords() -> Vec<String> {
        crate::config::DEFAULT_WINDOW_KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .collect()
    }

    fn locator(port: &Arc<FakeWindowPort>) -> WindowLocator {
        WindowLocator::new(port.clone(), &keywords())
    }

    #[test]
    fn keyword_window_beats_generic_window() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(1, 77, "", "GenericHost", true);
        port.add(2, 77, "ArkAscended Server Console", "ConsoleWindowClass", true);
        port.add(3, 88, "Server", "Other", true);
        let loc = locator(&port);

        for _ in 0..2 {
            let found = loc.find(77).unwrap();
            assert_eq!(found.handle, WindowHandle(2));
            assert!(found.is_valid());
        }
    }

    #[test]
    fn falls_back_to_first_visible_window() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(1, 77, "", "Hidden", false);
        port.add(2, 77, "", "Plain", true);
        port.add(3, 77, "", "Plain", true);
        assert_eq!(locator(&port).find(77).unwrap().handle, WindowHandle(2));
    }

    #[test]
    fn no_candidate_is_window_not_found() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(1, 77, "", "Hidden", false);
        let err = locator(&port).find(77).unwrap_err();
        assert!(matches!(err, SupervisorError::WindowNotFound(77)));
        assert!(locator(&port).find(5).is_err());
    }

    #[test]
    fn set_visible_is_confirmed_by_requery() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(9, 77, "ShooterGame", "ConsoleWindowClass", false);
        let loc = locator(&port);
        let mut win = loc.find(77).unwrap();

        assert!(loc.set_visible(&mut win, true));
        assert_eq!(port.is_visible(win.handle), Some(true));
        assert!(win.visible);

        assert!(loc.set_visible(&mut win, false));
        assert_eq!(port.is_visible(win.handle), Some(false));
    }

    #[test]
    fn silently_ignored_call_invalidates_ref() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(9, 77, "ShooterGame", "ConsoleWindowClass", true);
        let loc = locator(&port);
        let mut win = loc.find(77).unwrap();

        *port.ignore_calls.lock() = true;
        assert!(!loc.set_visible(&mut win, false));
        assert!(!win.is_valid());
        assert!(!loc.set_visible(&mut win, false));
    }

    #[test]
    fn rejected_call_invalidates_ref() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(9, 77, "ShooterGame", "ConsoleWindowClass", true);
        let loc = locator(&port);
        let mut win = loc.find(77).unwrap();

        *port.reject_calls.lock() = true;
        assert!(!loc.set_visible(&mut win, true));
        assert!(!win.is_valid());
    }

    #[test]
    fn closed_window_fails_revalidation() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(9, 77, "ShooterGame", "ConsoleWindowClass", true);
        let loc = locator(&port);
        let mut win = loc.find(77).unwrap();
        port.close(9);

        assert!(!loc.revalidate(&mut win));
        assert!(!loc.set_visible(&mut win, true));
    }

    #[test]
    fn reused_handle_with_other_owner_is_stale() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(9, 77, "ShooterGame", "ConsoleWindowClass", true);
        let loc = locator(&port);
        let mut win = loc.find(77).unwrap();
        port.close(9);
        port.add(9, 12, "Notepad", "Edit", true);
        assert!(!loc.revalidate(&mut win));
    }

    #[test]
    fn minimize_then_restore() {
        let port = Arc::new(FakeWindowPort::default());
        port.add(9, 77, "ShooterGame", "ConsoleWindowClass", true);
        let loc = locator(&port);
        let mut win = loc.find(77).unwrap();
        assert!(loc.minimize(&mut win));
        assert_eq!(port.is_minimized(win.handle), Some(true));
        assert!(loc.restore(&mut win));
        assert_eq!(port.is_minimized(win.handle), Some(false));
        assert!(win.is_valid());
    }

    #[test]
    fn noop_port_never_finds_windows() {
        let loc = WindowLocator::new(Arc::new(NoopWindowPort), &keywords());
        assert!(loc.find(std::process::id()).is_err());
    }
}
