//! Shared workloads used by the benches and the command line runner.
//!
//! Keeping the scenarios in one place means the criterion benches and the
//! `actorvm run` reports always exercise the same service graphs.

pub mod scenarios;
