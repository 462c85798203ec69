//! Messaging channel contract used to reach a human for the 2FA code.
//!
//! The core only needs four things from a channel: join it, post a message,
//! remember who posted the request, and read back replies newer than a
//! timestamp. [`slack`] implements this against the Slack Web API; tests
//! use a scripted in-memory channel.

pub mod slack;

use tracing::{debug, info, warn};

use crate::error::{ChannelError, ErrorKind};

pub const REQUEST_TEXT: &str = "Please respond with 2FA code";

/// A message read back from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Author id, when the channel reports one.
    pub author: Option<String>,
    pub text: String,
    /// Channel timestamp; ordered, usable as a polling lower bound.
    pub ts: String,
}

/// What the channel reports back after posting a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub ts: String,
    pub author: Option<String>,
}

/// One outstanding request for a human-supplied code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    /// The user whose reply is authoritative. `None` when neither the
    /// request author nor a configured default is known; no reply can match.
    pub expected_user: Option<String>,
    /// Only messages after this timestamp are considered.
    pub since: String,
}

/// The messaging collaborator. Implementations are bound to one channel.
pub trait ChallengeChannel: Send + Sync {
    fn join(&self) -> Result<(), ChannelError>;

    fn post(&self, text: &str) -> Result<PostedMessage, ChannelError>;

    /// Plain messages strictly after `since`, oldest first.
    fn messages_since(&self, since: &str) -> Result<Vec<ChannelMessage>, ChannelError>;
}

/// Join the channel, treating "not supported for this channel type" as
/// already joined.
pub fn join_or_subscribe(channel: &dyn ChallengeChannel) -> Result<(), ChannelError> {
    match channel.join() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::ChannelExpected => {
            debug!(error = %e, "channel join not supported, assuming membership");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Post the code request and work out whose reply to trust.
pub fn post_request(
    channel: &dyn ChallengeChannel,
    default_user: Option<&str>,
) -> Result<ChallengeRequest, ChannelError> {
    let posted = channel.post(REQUEST_TEXT)?;
    let expected_user = posted.author.or_else(|| default_user.map(str::to_string));
    info!(user = ?expected_user, ts = %posted.ts, "requested 2FA code");
    Ok(ChallengeRequest {
        expected_user,
        since: posted.ts,
    })
}

/// Best-effort confirmation that the code arrived.
pub fn post_acknowledgment(channel: &dyn ChallengeChannel, code: &str) {
    debug!("sending acknowledge message");
    if let Err(e) = channel.post(&format!("Received 2FA code {code}")) {
        warn!(error = %e, "failed sending acknowledge message");
    }
}

/// Best-effort final status report.
pub fn post_final_status(channel: &dyn ChallengeChannel, text: &str) {
    debug!("sending exit message");
    match channel.post(text) {
        Ok(_) => debug!("done sending exit message"),
        Err(e) => warn!(error = %e, "failed sending exit message"),
    }
}
