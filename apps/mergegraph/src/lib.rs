//! # mergegraph
//!
//! Operator CLI for the mergegraph engine: configuration loading and the
//! command implementations behind the `mergegraph` binary.

pub mod cli;
pub mod config;
