//! Application adapters
//!
//! Ready-made [`Application`](appctl_core::Application) implementations for
//! local subprocesses and remote web jobs.

#![warn(missing_docs)]

pub mod local;
pub mod rules;
pub mod web;

pub use local::{LocalApp, ProcessOutput, SubprocessError};
pub use rules::{RuleGuard, RulePolicy};
pub use web::{WebApp, WebAppError, WebAppSpec};
