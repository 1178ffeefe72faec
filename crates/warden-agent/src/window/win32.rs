use std::ffi::c_void;

use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClassNameW, GetWindowTextW, GetWindowThreadProcessId, IsIconic, IsWindow,
    IsWindowVisible, SW_HIDE, SW_MINIMIZE, SW_RESTORE, SW_SHOW, ShowWindow,
};

use super::{WindowHandle, WindowPort};

#[derive(Debug, Default, Clone, Copy)]
pub struct Win32WindowPort;

fn hwnd(window: WindowHandle) -> HWND {
    HWND(window.0 as *mut c_void)
}

fn alive(h: HWND) -> bool {
    unsafe { IsWindow(h) }.as_bool()
}

unsafe extern "system" fn collect(h: HWND, lparam: LPARAM) -> BOOL {
    let out = unsafe { &mut *(lparam.0 as *mut Vec<WindowHandle>) };
    out.push(WindowHandle(h.0 as isize));
    BOOL(1)
}

fn utf16_text(len: i32, buf: &[u16]) -> Option<String> {
    let len = usize::try_from(len).ok()?;
    Some(String::from_utf16_lossy(&buf[..len.min(buf.len())]))
}

impl WindowPort for Win32WindowPort {
    fn enumerate(&self) -> Vec<WindowHandle> {
        let mut out: Vec<WindowHandle> = Vec::new();
        let lparam = LPARAM(&mut out as *mut Vec<WindowHandle> as isize);
        if let Err(e) = unsafe { EnumWindows(Some(collect), lparam) } {
            tracing::debug!(error = %e, "EnumWindows failed");
        }
        out
    }

    fn title_of(&self, window: WindowHandle) -> Option<String> {
        let h = hwnd(window);
        if !alive(h) {
            return None;
        }
        let mut buf = [0u16; 512];
        let len = unsafe { GetWindowTextW(h, &mut buf) };
        utf16_text(len, &buf)
    }

    fn class_of(&self, window: WindowHandle) -> Option<String> {
        let h = hwnd(window);
        if !alive(h) {
            return None;
        }
        let mut buf = [0u16; 256];
        let len = unsafe { GetClassNameW(h, &mut buf) };
        utf16_text(len, &buf)
    }

    fn owner_process_of(&self, window: WindowHandle) -> Option<u32> {
        let h = hwnd(window);
        if !alive(h) {
            return None;
        }
        let mut pid = 0u32;
        let thread = unsafe { GetWindowThreadProcessId(h, Some(&mut pid)) };
        (thread != 0 && pid != 0).then_some(pid)
    }

    fn is_visible(&self, window: WindowHandle) -> Option<bool> {
        let h = hwnd(window);
        alive(h).then(|| unsafe { IsWindowVisible(h) }.as_bool())
    }

    fn set_visible(&self, window: WindowHandle, visible: bool) -> bool {
        let h = hwnd(window);
        if !alive(h) {
            return false;
        }
        let cmd = if visible { SW_SHOW } else { SW_HIDE };
        // The return value is the previous visibility, not success.
        let _ = unsafe { ShowWindow(h, cmd) };
        true
    }

    fn is_minimized(&self, window: WindowHandle) -> Option<bool> {
        let h = hwnd(window);
        alive(h).then(|| unsafe { IsIconic(h) }.as_bool())
    }

    fn set_minimized(&self, window: WindowHandle, minimized: bool) -> bool {
        let h = hwnd(window);
        if !alive(h) {
            return false;
        }
        let cmd = if minimized { SW_MINIMIZE } else { SW_RESTORE };
        let _ = unsafe { ShowWindow(h, cmd) };
        true
    }
}
