//! Host tuning pipeline for relay gateways.
//!
//! `probe` classifies the host, `catalog` produces the ordered set of
//! tuning steps for it, and `runner` drives each step through the
//! `executor` against a [`tuner::SystemTuner`]. `gateway` is the
//! orthogonal NAT switch used on hub hosts.

pub mod catalog;
pub mod cli;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod latency;
pub mod persist;
pub mod probe;
pub mod report;
pub mod runner;
pub mod tuner;

pub use error::{Result, TuneError};
pub use probe::{HostProfile, Platform};
pub use report::{RunOutcome, RunReport, StepOutcome, StepResult};
