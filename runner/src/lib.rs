//! hostrunner library
//!
//! Deployment execution engine for shared-hosting control planes: applies a
//! declarative deployment configuration to a hosted domain through privileged
//! host operations and an interactive shell, streaming the log to a callback.

pub mod app;
pub mod collab;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod gateway;
pub mod jobs;
pub mod lock;
pub mod logs;
pub mod output;
pub mod server;
pub mod shell;
pub mod storage;
pub mod utils;
