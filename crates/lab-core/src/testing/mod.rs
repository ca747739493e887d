//! Test doubles for the control plane's collaborators.
//!
//! Public so the web crate's integration tests can drive a full stack
//! without Docker or a provider CLI.

mod mock_backend;
mod mock_engine;

pub use mock_backend::MockBackend;
pub use mock_engine::{MockAiEngine, MockSession, ScriptedTurn};
