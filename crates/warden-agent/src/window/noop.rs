use super::{WindowHandle, WindowPort};

/// Port for platforms without a console-window concept. Discovery always
/// comes back empty, so visibility requests report failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWindowPort;

impl WindowPort for NoopWindowPort {
    fn enumerate(&self) -> Vec<WindowHandle> {
        Vec::new()
    }

    fn title_of(&self, _window: WindowHandle) -> Option<String> {
        None
    }

    fn class_of(&self, _window: WindowHandle) -> Option<String> {
        None
    }

    fn owner_process_of(&self, _window: WindowHandle) -> Option<u32> {
        None
    }

    fn is_visible(&self, _window: WindowHandle) -> Option<bool> {
        None
    }

    fn set_visible(&self, _window: WindowHandle, _visible: bool) -> bool {
        false
    }
}
