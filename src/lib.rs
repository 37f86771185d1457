//! Autoloop - an autonomous coding-agent runtime
//!
//! The library surface re-exports the engine crates and hosts the
//! autonomous supervisor; the `autoloop` binary wires them together.

pub mod supervisor;
