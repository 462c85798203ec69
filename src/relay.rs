//! Code relay: ask a human for the 2FA code and wait for the reply.
//!
//! ```text
//! join channel → post request → poll (1s) ─┬─ reply from expected user → ack → code
//!                                          ├─ sub-deadline reached      → RelayTimeout
//!                                          └─ cancelled by session      → nothing
//! ```
//!
//! The relay runs on its own thread while the session keeps streaming
//! output, so it is handed a cancellation receiver. Any message on it (or
//! the sender being dropped) stops polling before the next request.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{self, ChallengeChannel};
use crate::error::SessionError;
use crate::prompt::ReplyPattern;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct CodeRelay {
    channel: Arc<dyn ChallengeChannel>,
    default_user: Option<String>,
    poll_interval: Duration,
}

impl CodeRelay {
    pub fn new(channel: Arc<dyn ChallengeChannel>, default_user: Option<String>) -> Self {
        Self {
            channel,
            default_user,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn channel(&self) -> &dyn ChallengeChannel {
        self.channel.as_ref()
    }

    /// Request a code and wait at most `budget` for it.
    ///
    /// Returns `Ok(None)` if cancelled. On success the acknowledgment has
    /// already been posted.
    pub fn request_code(
        &self,
        budget: Duration,
        cancel: &Receiver<()>,
    ) -> Result<Option<String>, SessionError> {
        let deadline = Instant::now() + budget;
        let channel = self.channel.as_ref();

        info!("requesting 2FA code");
        channel::join_or_subscribe(channel)?;
        let request = channel::post_request(channel, self.default_user.as_deref())?;

        let reply = match request.expected_user.as_deref() {
            Some(user) => Some(ReplyPattern::for_user(user)),
            None => {
                warn!("no responder could be resolved; no reply will be accepted");
                None
            }
        };

        let mut since = request.since;
        loop {
            if Instant::now() >= deadline {
                return Err(SessionError::RelayTimeout { budget });
            }

            let messages = channel.messages_since(&since)?;
            if let Some(last) = messages.last() {
                since = last.ts.clone();
            }
            let code = reply
                .as_ref()
                .and_then(|reply| messages.iter().find_map(|m| reply.extract(&m.text)));
            if let Some(code) = code {
                info!(length = code.len(), "extracted 2FA code");
                channel::post_acknowledgment(channel, &code);
                return Ok(Some(code));
            }

            debug!("waiting for 2FA code");
            let wait = self
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            match cancel.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("2FA relay cancelled");
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::channel::REQUEST_TEXT;
    use crate::channel::testing::ScriptedChannel;
    use crate::error::{ChannelError, ErrorKind};

    fn relay(channel: &Arc<ScriptedChannel>, default_user: Option<&str>) -> CodeRelay {
        let channel: Arc<dyn ChallengeChannel> = channel.clone();
        CodeRelay::new(channel, default_user.map(str::to_string))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn first_addressed_reply_wins() {
        let channel = Arc::new(
            ScriptedChannel::new(Some("U1")).reply(vec![
                ("U1", "please wait", "1700000000.000010"),
                ("U1", "<@U1>123456", "1700000000.000011"),
                ("U1", "<@U1>999999", "1700000000.000012"),
            ]),
        );
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let code = relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap();

        assert_eq!(code.as_deref(), Some("123456"));
        assert_eq!(
            channel.posted(),
            vec![
                REQUEST_TEXT.to_string(),
                "Received 2FA code 123456".to_string()
            ]
        );
    }

    #[test]
    fn reply_arriving_on_a_later_poll_is_found() {
        let channel = Arc::new(
            ScriptedChannel::new(Some("U1"))
                .reply(vec![])
                .reply(vec![("U1", "on it", "1700000000.000010")])
                .reply(vec![("U1", "<@U1> 424242 ", "1700000000.000020")]),
        );
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let code = relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap();

        assert_eq!(code.as_deref(), Some("424242"));
    }

    #[test]
    fn polling_lower_bound_only_moves_forward() {
        let channel = Arc::new(
            ScriptedChannel::new(Some("U1"))
                .reply(vec![])
                .reply(vec![
                    ("U2", "hello", "1700000000.000010"),
                    ("U1", "thinking", "1700000000.000011"),
                ])
                .reply(vec![])
                .reply(vec![("U1", "<@U1>123456", "1700000000.000020")]),
        );
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap();

        assert_eq!(
            channel.polled_since(),
            vec![
                "1700000000.000001",
                "1700000000.000001",
                "1700000000.000011",
                "1700000000.000011",
            ]
        );
    }

    #[test]
    fn times_out_without_a_matching_reply() {
        let channel =
            Arc::new(ScriptedChannel::new(Some("U1")).reply(vec![("U2", "<@U2>123456", "1700000000.000010")]));
        let (_cancel_tx, cancel_rx) = mpsc::channel();
        let budget = Duration::from_millis(80);

        let started = Instant::now();
        let err = relay(&channel, None)
            .request_code(budget, &cancel_rx)
            .unwrap_err();

        assert_eq!(err, SessionError::RelayTimeout { budget });
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
        // request only, no acknowledgment
        assert_eq!(channel.posted().len(), 1);
    }

    #[test]
    fn unresolved_responder_never_matches() {
        let channel =
            Arc::new(ScriptedChannel::new(None).reply(vec![("U1", "<@U1>123456", "1700000000.000010")]));
        let (_cancel_tx, cancel_rx) = mpsc::channel();
        let budget = Duration::from_millis(50);

        let err = relay(&channel, None)
            .request_code(budget, &cancel_rx)
            .unwrap_err();
        assert_eq!(err, SessionError::RelayTimeout { budget });
    }

    #[test]
    fn configured_default_user_is_used_without_an_author() {
        let channel =
            Arc::new(ScriptedChannel::new(None).reply(vec![("U9", "<@U9>777777", "1700000000.000010")]));
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let code = relay(&channel, Some("U9"))
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap();
        assert_eq!(code.as_deref(), Some("777777"));
    }

    #[test]
    fn cancellation_stops_polling() {
        let channel = Arc::new(ScriptedChannel::new(Some("U1")));
        let (cancel_tx, cancel_rx) = mpsc::channel();
        cancel_tx.send(()).unwrap();

        let started = Instant::now();
        let code = relay(&channel, None)
            .with_poll_interval(Duration::from_secs(30))
            .request_code(Duration::from_secs(60), &cancel_rx)
            .unwrap();

        assert_eq!(code, None);
        assert_eq!(channel.polled_since().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn dropped_session_cancels_relay() {
        let channel = Arc::new(ScriptedChannel::new(Some("U1")));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        drop(cancel_tx);

        let code = relay(&channel, None)
            .request_code(Duration::from_secs(60), &cancel_rx)
            .unwrap();
        assert_eq!(code, None);
    }

    #[test]
    fn unsupported_join_is_tolerated() {
        let channel = Arc::new(
            ScriptedChannel::new(Some("U1"))
                .join_fails_with(ChannelError::UnsupportedChannelType {
                    method: "conversations.join",
                })
                .reply(vec![("U1", "<@U1>123456", "1700000000.000010")]),
        );
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let code = relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap();
        assert_eq!(code.as_deref(), Some("123456"));
    }

    #[test]
    fn fatal_join_failure_fails_the_relay() {
        let channel = Arc::new(ScriptedChannel::new(Some("U1")).join_fails_with(
            ChannelError::Api {
                method: "conversations.join",
                code: "not_in_channel".to_string(),
            },
        ));
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let err = relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelFatal);
        assert!(channel.posted().is_empty());
    }

    #[test]
    fn failed_request_post_fails_the_relay() {
        let channel = Arc::new(ScriptedChannel::new(Some("U1")).fail_posts_after(0));
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let err = relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap_err();
        assert!(matches!(err, SessionError::Channel(_)));
    }

    #[test]
    fn failed_acknowledgment_still_returns_the_code() {
        let channel = Arc::new(
            ScriptedChannel::new(Some("U1"))
                .fail_posts_after(1)
                .reply(vec![("U1", "<@U1>123456", "1700000000.000010")]),
        );
        let (_cancel_tx, cancel_rx) = mpsc::channel();

        let code = relay(&channel, None)
            .request_code(Duration::from_secs(5), &cancel_rx)
            .unwrap();
        assert_eq!(code.as_deref(), Some("123456"));
    }
}
