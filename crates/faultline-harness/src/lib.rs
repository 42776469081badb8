//! Faultline retry-validation harness.
//!
//! Runs declarative fault scenarios against a storage target: arm synthetic
//! device-protocol faults, drive I/O, wait for the target to settle, and
//! judge the error-accounting counters against the outcomes each scenario
//! accepts. The target is reached only through the traits in [`services`];
//! [`sim::SimulatedArray`] implements them in-process.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod injector;
pub mod log;
pub mod matcher;
pub mod poll;
pub mod runner;
pub mod services;
pub mod sim;
pub mod suite;
