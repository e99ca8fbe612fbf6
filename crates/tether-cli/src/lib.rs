//! tether - command line access to an editor daemon
//!
//! Thin wrapper over `tether-client`: configuration and logging are set up
//! here, everything else is delegated to the client library.

pub mod cli;
pub mod commands;
pub mod logging;
