//! Process-level plumbing shared by the server and CLI binaries: command line
//! / environment configuration and logger setup.

pub mod config;
pub mod logging;
