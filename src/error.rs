//! Error taxonomy for a relay session.
//!
//! Every error type maps onto a closed [`ErrorKind`] so callers branch on
//! the kind of failure instead of inspecting message strings. Only
//! channel, timeout and process-exit failures decide a session outcome;
//! notification and revert failures are logged where they happen.

use std::time::Duration;

use thiserror::Error;

/// Closed classification of everything that can go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required option is missing or malformed.
    Configuration,
    /// A channel condition that is expected and tolerated.
    ChannelExpected,
    /// Any other channel failure; fails the session.
    ChannelFatal,
    /// Global session timeout or 2FA sub-timeout.
    Timeout,
    /// The publish command exited non-zero or could not be driven.
    ProcessExit,
    /// The revert command failed; never escalates.
    Revert,
    /// The operator interrupted the session.
    Interrupted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variables {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid {name} '{pattern}': {detail}")]
    InvalidPattern {
        name: &'static str,
        pattern: String,
        detail: String,
    },

    #[error("{name} has no program on its first line")]
    EmptyCommand { name: &'static str },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Failures talking to the messaging channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Joining is not supported for this kind of channel (e.g. private
    /// channels, where the bot is already a member).
    #[error("{method} is not supported for this channel type")]
    UnsupportedChannelType { method: &'static str },

    #[error("{method} failed: {code}")]
    Api { method: &'static str, code: String },

    #[error("{method} failed: {detail}")]
    Transport { method: &'static str, detail: String },

    #[error("{method} failed: unreadable response ({detail})")]
    Decode { method: &'static str, detail: String },
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedChannelType { .. } => ErrorKind::ChannelExpected,
            Self::Api { .. } | Self::Transport { .. } | Self::Decode { .. } => {
                ErrorKind::ChannelFatal
            }
        }
    }
}

/// Errors that resolve a session as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("publish command timed out after {} milliseconds", .budget.as_millis())]
    Timeout { budget: Duration },

    #[error("2FA message timed out after {} milliseconds", .budget.as_millis())]
    RelayTimeout { budget: Duration },

    #[error("Publish command process exited with exit code '{code}'")]
    ProcessExit { code: u32 },

    #[error("failed to start publish command: {0}")]
    Spawn(String),

    #[error("failed to send 2FA code to publish command: {0}")]
    Inject(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("interrupted before the publish command finished")]
    Interrupted,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } | Self::RelayTimeout { .. } => ErrorKind::Timeout,
            Self::ProcessExit { .. } | Self::Spawn(_) | Self::Inject(_) => ErrorKind::ProcessExit,
            Self::Channel(e) => e.kind(),
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }
}

#[derive(Debug, Error)]
pub enum RevertError {
    #[error("failed to start revert command: {0:#}")]
    Spawn(anyhow::Error),

    #[error("revert command timed out after {} milliseconds", .budget.as_millis())]
    Timeout { budget: Duration },

    #[error("revert command exited with exit code '{code}'")]
    Exit { code: u32 },
}

impl RevertError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Revert
    }
}
