// epdtrial - Repeatable image trials for e-paper and other display panels
//
// This is the library crate containing the controller, state machine, transforms and
// display adapters. The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod controller;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use controller::{ItemError, RunError, TestController};
pub use metrics::Metrics;
pub use models::{ItemResult, RunConfig, RunContext, RunResult, RunState, Settings};
pub use state::{ContextUpdate, StateError, StateEvent, StateMachine, StateObserver};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
