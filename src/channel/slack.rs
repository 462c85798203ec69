//! Slack Web API channel.
//!
//! Uses the blocking `ureq` client; every call is a single request with a
//! bounded timeout. Slack reports API failures as HTTP 200 with
//! `"ok": false` and an error code, which is mapped onto [`ChannelError`].

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{ChallengeChannel, ChannelMessage, PostedMessage};
use crate::error::ChannelError;

const API_BASE: &str = "https://slack.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UNSUPPORTED_CHANNEL_TYPE: &str = "method_not_supported_for_channel_type";

/// Slack response envelope. Only the fields the relay reads.
#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
}

pub struct SlackChannel {
    agent: ureq::Agent,
    token: String,
    channel: String,
}

impl SlackChannel {
    pub fn new(token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            token: token.into(),
            channel: channel.into(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn post_json(
        &self,
        method: &'static str,
        body: serde_json::Value,
    ) -> Result<Envelope, ChannelError> {
        debug!(method, channel = %self.channel, "slack request");
        let response = self
            .agent
            .post(&format!("{API_BASE}/{method}"))
            .set("Authorization", &self.auth_header())
            .send_json(body);
        decode(method, response)
    }
}

impl ChallengeChannel for SlackChannel {
    fn join(&self) -> Result<(), ChannelError> {
        self.post_json(
            "conversations.join",
            serde_json::json!({ "channel": &self.channel }),
        )?;
        Ok(())
    }

    fn post(&self, text: &str) -> Result<PostedMessage, ChannelError> {
        let envelope = self.post_json(
            "chat.postMessage",
            serde_json::json!({ "channel": &self.channel, "text": text }),
        )?;
        posted_message("chat.postMessage", envelope)
    }

    fn messages_since(&self, since: &str) -> Result<Vec<ChannelMessage>, ChannelError> {
        let method = "conversations.history";
        debug!(method, channel = %self.channel, since, "slack request");
        let response = self
            .agent
            .get(&format!("{API_BASE}/{method}"))
            .set("Authorization", &self.auth_header())
            .query("channel", &self.channel)
            .query("oldest", since)
            .query("inclusive", "false")
            .call();
        let envelope = decode(method, response)?;
        Ok(chronological(envelope.messages))
    }
}

fn decode(
    method: &'static str,
    response: Result<ureq::Response, ureq::Error>,
) -> Result<Envelope, ChannelError> {
    let response = match response {
        Ok(response) => response,
        Err(ureq::Error::Status(status, _)) => {
            return Err(ChannelError::Transport {
                method,
                detail: format!("HTTP {status}"),
            });
        }
        Err(ureq::Error::Transport(transport)) => {
            return Err(ChannelError::Transport {
                method,
                detail: transport.to_string(),
            });
        }
    };
    let envelope: Envelope = response.into_json().map_err(|e| ChannelError::Decode {
        method,
        detail: e.to_string(),
    })?;
    check(method, envelope)
}

fn check(method: &'static str, envelope: Envelope) -> Result<Envelope, ChannelError> {
    if envelope.ok {
        return Ok(envelope);
    }
    match envelope.error.as_deref() {
        Some(UNSUPPORTED_CHANNEL_TYPE) => Err(ChannelError::UnsupportedChannelType { method }),
        Some(code) => Err(ChannelError::Api {
            method,
            code: code.to_string(),
        }),
        None => Err(ChannelError::Api {
            method,
            code: "unknown_error".to_string(),
        }),
    }
}

fn posted_message(method: &'static str, envelope: Envelope) -> Result<PostedMessage, ChannelError> {
    let ts = envelope.ts.ok_or_else(|| ChannelError::Decode {
        method,
        detail: "missing ts".to_string(),
    })?;
    Ok(PostedMessage {
        ts,
        author: envelope.message.and_then(|m| m.user),
    })
}

/// Keep plain messages and order them oldest first. Slack returns history
/// newest first.
fn chronological(raw: Vec<RawMessage>) -> Vec<ChannelMessage> {
    let mut messages: Vec<ChannelMessage> = raw
        .into_iter()
        .filter(|m| m.kind.as_deref() == Some("message"))
        .map(|m| ChannelMessage {
            author: m.user,
            text: m.text,
            ts: m.ts,
        })
        .collect();
    messages.sort_by_key(|m| ts_key(&m.ts));
    messages
}

/// Slack timestamps are `<seconds>.<micros>`; compare them numerically.
fn ts_key(ts: &str) -> (u64, u64) {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    (secs.parse().unwrap_or(0), frac.parse().unwrap_or(0))
}
