//! Command line interface module
//!
//! Argument parsing (with environment fallbacks) and the runner that turns the
//! parsed arguments into a [`crate::config::PushConfig`] and a push run.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
