//! Penpal Session - run a language-practice conversation child and relay its
//! output, with pause/resume and a shutdown that always completes.
//!
//! ```no_run
//! use penpal_session::{ChannelSink, SessionConfig, LaunchProfile, new_session};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = SessionConfig::builder()
//!     .profile(LaunchProfile::new("French", "Amélie"))
//!     .build()?;
//! let (sink, _events) = ChannelSink::new();
//! let mut session = new_session(config, Arc::new(sink));
//!
//! session.start().await?;
//! session.send_line("Bonjour !").await?;
//! let report = session.stop().await;
//! # Ok(())
//! # }
//! ```

mod factory;
mod logging;

pub use factory::PlatformProcessLauncherFactory;
pub use logging::init_tracing;
pub use penpal_session_core::*;

use std::sync::Arc;

/// Session driven by the launcher of the current platform
pub type PenpalSession =
    Session<<PlatformProcessLauncherFactory as ProcessLauncherFactory>::Launcher>;

/// Create a session using the platform launcher
pub fn new_session(config: SessionConfig, sink: Arc<dyn OutputSink>) -> PenpalSession {
    tracing::debug!(
        platform = PlatformProcessLauncherFactory::platform_name(),
        "creating session"
    );
    Session::new(
        config,
        Arc::new(PlatformProcessLauncherFactory::create_launcher()),
        sink,
    )
}
