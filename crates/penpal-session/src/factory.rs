use penpal_session_core::ProcessLauncherFactory;

/// Selects the launcher for the platform being compiled for
pub struct PlatformProcessLauncherFactory;

impl ProcessLauncherFactory for PlatformProcessLauncherFactory {
    #[cfg(unix)]
    type Launcher = penpal_session_unix::UnixProcessLauncher;

    #[cfg(windows)]
    type Launcher = penpal_session_windows::WindowsProcessLauncher;

    fn create_launcher() -> Self::Launcher {
        #[cfg(unix)]
        return penpal_session_unix::UnixProcessLauncherFactory::create_launcher();

        #[cfg(windows)]
        return penpal_session_windows::WindowsProcessLauncherFactory::create_launcher();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return penpal_session_unix::UnixProcessLauncherFactory::platform_name();

        #[cfg(windows)]
        return penpal_session_windows::WindowsProcessLauncherFactory::platform_name();
    }
}
