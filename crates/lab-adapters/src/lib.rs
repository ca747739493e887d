//! Concrete collaborators for the lab control plane.
//!
//! - [`ComposeBackend`]: drives a Docker Compose project through the
//!   container runtime's `compose` subcommand
//! - [`ClaudeEngine`]: runs diagnosis turns through the Claude CLI, translating
//!   its `stream-json` output into normalized provider events

pub mod claude;
pub mod claude_stream;
pub mod compose;
mod process;

pub use claude::{ClaudeEngine, ClaudeSession, ClaudeSettings};
pub use claude_stream::{ClaudeStreamEvent, ClaudeStreamParser};
pub use compose::{ComposeBackend, ComposeError};
