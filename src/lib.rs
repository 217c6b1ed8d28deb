//! `ralph` - supervised iteration loop for autonomous coding agents
//!
//! Drives an agent CLI against a task list until the work is done, progress
//! stalls, or the iteration budget runs out.

pub mod cli;
pub mod core;
pub mod error;
pub mod fs;
pub mod logging;
pub mod report;
