//! Unix process launcher: each conversation child runs in its own process
//! group so pause, resume and kill reach every helper it starts.

mod unix_process_launcher;

#[cfg(unix)]
pub use unix_process_launcher::{UnixProcessHandle, UnixProcessLauncher};

#[cfg(unix)]
pub struct UnixProcessLauncherFactory;

#[cfg(unix)]
impl penpal_session_core::ProcessLauncherFactory for UnixProcessLauncherFactory {
    type Launcher = UnixProcessLauncher;

    fn create_launcher() -> UnixProcessLauncher {
        UnixProcessLauncher::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
