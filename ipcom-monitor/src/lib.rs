//! # ipcom-monitor
//!
//! Console front end for `ipcom-core`. Keeps one session to an IPCom
//! controller open, logs every output change and optionally sends a few
//! commands given on the command line.

pub mod command;
pub mod config;
pub mod service;
