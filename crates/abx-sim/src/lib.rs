//! ABX Simulator
//!
//! Offline, seeded runs of the experiment engine against synthetic
//! configurations with known success rates.

#![warn(unreachable_pub)]

pub mod harness;
pub mod simulator;

pub use harness::{BernoulliHarness, LoggingPublisher};
pub use simulator::{
    run_simulator, ArmSummary, ExperimentSummary, SimulatorConfig, SimulatorReport,
};
