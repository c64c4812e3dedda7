//! appctl core: lifecycle control for long-running external computations.
//!
//! An [`Application`] is one external computation (a local process, a
//! remote job). A [`Controller`] launches it, polls it on a background
//! task, lets callers wait for it with an optional timeout and cancels it
//! with guaranteed clean-up.

#![warn(missing_docs)]

// Identities
mod id;

// Lifecycle
pub mod state;
mod error;

// Contract and driver
mod app;
mod config;
mod controller;
pub mod interval;

// Re-exports
pub use id::AppId;
pub use state::{legal, require_state, validate_transition, AppState, StateSet};
pub use error::{ControllerError, Result};
pub use app::Application;
pub use config::ControllerConfig;
pub use controller::Controller;
pub use interval::Backoff;
