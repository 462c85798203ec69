use std::path::PathBuf;

use clap::Parser;

/// Every option can come from the environment, which is how CI jobs drive
/// the tool. Required options are validated in `config` so that all missing
/// ones are reported together.
#[derive(Parser, Debug, Default)]
#[command(
    name = "twofa-relay",
    about = "Run a publish command and relay its 2FA prompt through Slack",
    version
)]
pub struct Cli {
    /// Slack bot token
    #[arg(long, env = "SLACK_TOKEN", hide_env_values = true)]
    pub slack_token: Option<String>,

    /// Slack channel used for the 2FA request and status messages
    #[arg(long, env = "CHANNEL_ID")]
    pub channel_id: Option<String>,

    /// Publish command: program on the first line, one argument per line
    #[arg(long, env = "PUBLISH_COMMAND")]
    pub publish_command: Option<String>,

    /// Command run when publishing fails, same format as the publish command
    #[arg(long, env = "REVERT_COMMAND")]
    pub revert_command: Option<String>,

    /// Regex matching the 2FA prompt in the publish command output
    #[arg(long, env = "CODE_PATTERN")]
    pub code_pattern: Option<String>,

    /// Overall session budget in milliseconds
    #[arg(long, env = "TIMEOUT")]
    pub timeout: Option<u64>,

    /// Slack user whose reply is trusted when the request has no author
    #[arg(long, env = "SLACK_USER")]
    pub slack_user: Option<String>,

    /// npm registry token written to ~/.npmrc before publishing
    #[arg(long, env = "NPM_TOKEN", hide_env_values = true)]
    pub npm_token: Option<String>,

    /// Append a JSON-lines session log to this file
    #[arg(long, env = "SESSION_LOG")]
    pub session_log: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
