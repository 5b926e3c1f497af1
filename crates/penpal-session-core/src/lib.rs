//! Penpal Session Core - platform-independent session management
//!
//! This crate provides the session controller, the line pumps that carry
//! child output to an [`OutputSink`], and the process traits that the
//! platform crates implement.

mod config;
mod error;
mod process;
mod pump;
mod session;
mod sink;

pub use config::*;
pub use error::*;
pub use process::*;
pub use pump::*;
pub use session::*;
pub use sink::*;
