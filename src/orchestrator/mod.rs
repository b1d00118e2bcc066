//! Application-level orchestration utilities.
//!
//! This module owns the run lifecycle (import, range selection, start, pause,
//! resume, skip, stop) and publishes a snapshot that CLI layers subscribe to.

mod controller;

pub use controller::{RunController, StartOutcome, UiCommand};
