//! Pattern matching on both sides of the relay.
//!
//! [`CodePrompt`] recognises the 2FA prompt in raw publish command output.
//! [`ReplyPattern`] recognises a channel reply addressed to the trusted
//! responder and pulls the code out of it.
//!
//! Both are stateless; firing the relay at most once per session is the
//! orchestrator's job, not the matcher's.

use regex::Regex;

/// Compiled 2FA prompt pattern for one session.
#[derive(Debug, Clone)]
pub struct CodePrompt {
    regex: Regex,
}

impl CodePrompt {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    /// Test one chunk of raw (ungated, unstripped) output.
    pub fn test(&self, chunk: &str) -> bool {
        self.regex.is_match(chunk)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

/// Extraction pattern for replies: `<@USER>` followed by the code.
#[derive(Debug, Clone)]
pub struct ReplyPattern {
    regex: Regex,
}

impl ReplyPattern {
    pub fn for_user(user: &str) -> Self {
        let pattern = format!(r"^<@{}>(.+)$", regex::escape(user));
        Self {
            regex: Regex::new(&pattern).expect("escaped user id always forms a valid pattern"),
        }
    }

    /// Return the trimmed code if `text` is a non-empty reply addressed to
    /// the user.
    pub fn extract(&self, text: &str) -> Option<String> {
        let captures = self.regex.captures(text)?;
        let code = captures.get(1)?.as_str().trim();
        if code.is_empty() {
            None
        } else {
            Some(code.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_prompt_matches_exact_chunk() {
        let prompt = CodePrompt::new(r"^Enter code: $").unwrap();
        assert!(prompt.test("Enter code: "));
        assert!(!prompt.test("npm notice Enter code: \r\n"));
        assert!(!prompt.test("Publishing..."));
    }

    #[test]
    fn unanchored_prompt_matches_inside_chunk() {
        let prompt = CodePrompt::new(r"one-time password").unwrap();
        assert!(prompt.test("npm notice\r\nThis operation requires a one-time password.\r\nEnter OTP: "));
        assert_eq!(prompt.as_str(), "one-time password");
    }

    #[test]
    fn invalid_prompt_is_rejected() {
        assert!(CodePrompt::new(r"(unclosed").is_err());
    }

    #[test]
    fn reply_extracts_trimmed_code() {
        let reply = ReplyPattern::for_user("U1");
        assert_eq!(reply.extract("<@U1>123456").as_deref(), Some("123456"));
        assert_eq!(reply.extract("<@U1>  654321 ").as_deref(), Some("654321"));
    }

    #[test]
    fn reply_ignores_other_users_and_plain_text() {
        let reply = ReplyPattern::for_user("U1");
        assert_eq!(reply.extract("please wait"), None);
        assert_eq!(reply.extract("<@U2>123456"), None);
        assert_eq!(reply.extract("code <@U1>123456"), None);
    }

    #[test]
    fn reply_requires_non_blank_code() {
        let reply = ReplyPattern::for_user("U1");
        assert_eq!(reply.extract("<@U1>"), None);
        assert_eq!(reply.extract("<@U1>   "), None);
    }

    #[test]
    fn reply_user_is_matched_literally() {
        let reply = ReplyPattern::for_user("U.1");
        assert_eq!(reply.extract("<@UX1>123"), None);
        assert_eq!(reply.extract("<@U.1>123").as_deref(), Some("123"));
    }

    #[test]
    fn reply_is_single_line() {
        let reply = ReplyPattern::for_user("U1");
        assert_eq!(reply.extract("<@U1>123\nsecond line"), None);
    }
}
