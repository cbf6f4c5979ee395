//! Supervisor for long-running security testing workers: spawns and watches
//! worker processes, routes tasks to specialist profiles and triages reported
//! findings.

pub mod anthropic;
pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod prompt_generator;
pub mod router;
pub mod submission;
pub mod triage;
pub mod ui;

#[cfg(test)]
mod testing;

pub use error::{OverwatchError, TriageError};
