//! Run a publish command under a PTY, relay its 2FA prompt through a chat
//! channel, inject the reply and report the outcome.

pub mod auth;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod log;
pub mod orchestrator;
pub mod prompt;
pub mod relay;
pub mod revert;
pub mod supervisor;
