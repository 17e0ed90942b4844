//! Faultline: a fault-injection test harness for distributed stores
//!
//! A run drives concurrent client workers and a fault injector against a
//! system under test, records every invocation and outcome into a shared
//! history, and checks that history against a consistency model.
//!
//! Start with [`TestConfig`] and [`Test`]; see [`checker`] for the models.

pub mod api;
pub mod checker;
pub mod client;
pub mod config;
pub mod error;
pub mod generator;
pub mod history;
pub mod nemesis;
pub mod phase;
pub mod runner;
pub mod store;
pub mod worker;

/// In-process system under test for integration tests.
pub mod testing;

pub use checker::{Checker, CheckerConfig, Model, Validity, Verdict};
pub use config::TestConfig;
pub use error::{HarnessError, HarnessFault, HarnessWarning};
pub use history::{Action, History, HistoryLog, Operation, Process, Value};
pub use runner::{RunReport, Test};
pub use store::RunStore;
