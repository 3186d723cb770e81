#![forbid(unsafe_code)]

//! Control socket, filesystem mailbox, and streaming session manager for
//! a long-running background agent.

pub mod audit;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod heartbeat;
pub mod ipc;
pub mod mailbox;
pub mod models;
pub mod state;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
