//! Windows process launcher
//!
//! Windows has no portable stop/continue primitive for a child, so pause and
//! resume report [`penpal_session_core::ProcessError::UnsupportedOperation`].

mod windows_process_launcher;

#[cfg(windows)]
pub use windows_process_launcher::{WindowsProcessHandle, WindowsProcessLauncher};

/// Windows-specific launcher factory
#[cfg(windows)]
pub struct WindowsProcessLauncherFactory;

#[cfg(windows)]
impl penpal_session_core::ProcessLauncherFactory for WindowsProcessLauncherFactory {
    type Launcher = WindowsProcessLauncher;

    fn create_launcher() -> WindowsProcessLauncher {
        WindowsProcessLauncher::new()
    }

    fn platform_name() -> &'static str {
        "Windows"
    }
}
