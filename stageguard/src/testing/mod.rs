//! Test doubles and fixtures.
//!
//! - [`ScriptedProvider`]: a provider that fails a scripted number of times
//! - [`RecordingAlertTransport`]: captures alerts instead of sending them
//! - [`TestHarness`]: in-memory store, review queue, events and alerts wired
//!   together for pipeline tests

mod fixtures;
mod mocks;

pub use fixtures::{context_with_signals, fixed_date, TestHarness};
pub use mocks::{RecordingAlertTransport, ScriptedProvider};
