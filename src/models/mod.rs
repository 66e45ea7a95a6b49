//! Data models for epdtrial.
//!
//! - [`RunConfig`]: what to show, how often, and with which transforms (`Trial Run.yaml`)
//! - [`Settings`]: display, controller and logging settings (`Trial Settings.yaml`)
//! - [`RunState`] / [`RunContext`]: controller lifecycle state and the progress snapshot
//!   handed to observers
//! - [`ItemResult`] / [`RunResult`]: per-image and aggregate outcomes
//!
//! Config structs derive `Serialize`/`Deserialize` for YAML persistence. `RunContext` is
//! only mutated through [`StateMachine`](crate::state::StateMachine).

pub mod config;
pub mod results;
pub mod run_state;

pub use config::{
    ConfigError, ControllerSettings, DisplaySettings, LoggingSettings, ParamError, RefreshMode,
    RunConfig, Settings, TransformParams, TransformSpec,
};
pub use results::{ItemResult, RunResult};
pub use run_state::{RunContext, RunState};
