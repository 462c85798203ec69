use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::log::ExecutionLog;
use crate::prompt::CodePrompt;
use crate::supervisor::SpawnConfig;

pub const DEFAULT_TIMEOUT_MILLIS: u64 = 20 * 60 * 1000;

/// A command given as newline-separated text: program on the first line,
/// one argument per following line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn parse(name: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let mut lines: Vec<&str> = raw
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect();
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }

        let mut lines = lines.into_iter();
        let program = lines.next().unwrap_or_default().trim();
        if program.is_empty() {
            return Err(ConfigError::EmptyCommand { name });
        }
        Ok(Self {
            program: program.to_string(),
            args: lines.map(str::to_string).collect(),
        })
    }

    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig::new(self.program.clone(), self.args.clone())
    }
}

/// Validated configuration for one relay run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub slack_token: String,
    pub channel_id: String,
    pub publish: CommandSpec,
    pub revert: Option<CommandSpec>,
    pub code_pattern: CodePrompt,
    pub timeout: Duration,
    pub default_responder: Option<String>,
    pub npm_token: Option<String>,
    pub session_log: Option<PathBuf>,
}

impl RelayConfig {
    /// Validate parsed options. All missing required options are reported
    /// in a single error.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let required = [
            ("SLACK_TOKEN", &cli.slack_token),
            ("CHANNEL_ID", &cli.channel_id),
            ("PUBLISH_COMMAND", &cli.publish_command),
            ("CODE_PATTERN", &cli.code_pattern),
        ];
        let missing: Vec<&'static str> = required
            .iter()
            .filter(|(_, value)| present(value).is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let slack_token = present(&cli.slack_token).unwrap_or_default().to_string();
        let channel_id = present(&cli.channel_id).unwrap_or_default().to_string();
        let publish = CommandSpec::parse(
            "PUBLISH_COMMAND",
            present(&cli.publish_command).unwrap_or_default(),
        )?;
        let revert = present(&cli.revert_command)
            .map(|raw| CommandSpec::parse("REVERT_COMMAND", raw))
            .transpose()?;

        let pattern = present(&cli.code_pattern).unwrap_or_default();
        let code_pattern = CodePrompt::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            name: "CODE_PATTERN",
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?;

        Ok(Self {
            slack_token,
            channel_id,
            publish,
            revert,
            code_pattern,
            timeout: Duration::from_millis(cli.timeout.unwrap_or(DEFAULT_TIMEOUT_MILLIS)),
            default_responder: present(&cli.slack_user).map(str::to_string),
            npm_token: present(&cli.npm_token).map(str::to_string),
            session_log: cli.session_log.clone(),
        })
    }

    /// Open the session log when one is configured.
    pub fn open_session_log(&self) -> anyhow::Result<Option<ExecutionLog>> {
        self.session_log
            .as_deref()
            .map(ExecutionLog::new)
            .transpose()
            .context("failed to open session log")
    }

    /// The revert gets half of the session budget.
    pub fn revert_timeout(&self) -> Duration {
        self.timeout / 2
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
