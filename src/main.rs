use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use twofa_relay::auth;
use twofa_relay::channel::ChallengeChannel;
use twofa_relay::channel::slack::SlackChannel;
use twofa_relay::cli::Cli;
use twofa_relay::config::RelayConfig;
use twofa_relay::log::ExecutionLog;
use twofa_relay::orchestrator::{self, OrchestratorConfig, Outcome};
use twofa_relay::relay::CodeRelay;

fn main() -> Result<()> {
    // A local .env is optional; real environment variables win.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "twofa_relay=info",
        1 => "twofa_relay=debug",
        _ => "twofa_relay=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match RelayConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => fail(&e.to_string()),
    };

    let log = match prepare(&config) {
        Ok(log) => log,
        Err(e) => fail(&format!("{e:#}")),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .ok();

    let channel: Arc<dyn ChallengeChannel> =
        Arc::new(SlackChannel::new(&config.slack_token, &config.channel_id));
    let relay = CodeRelay::new(channel, config.default_responder.clone());
    let orchestrator_config = OrchestratorConfig::from_relay_config(&config);

    let mut stdout = std::io::stdout();
    match orchestrator::run(&orchestrator_config, &relay, log.as_ref(), stop, &mut stdout) {
        Outcome::Success(message) => {
            info!("{message}");
            Ok(())
        }
        Outcome::Failure(error) => {
            warn!(kind = ?error.kind(), "session failed");
            fail(&error.to_string())
        }
    }
}

/// Outer setup before the session: registry credentials and the session log.
fn prepare(config: &RelayConfig) -> Result<Option<ExecutionLog>> {
    if let Some(token) = &config.npm_token {
        auth::provision_npm_token(token)?;
    }
    let log = config.open_session_log()?;
    if let Some(log) = &log {
        info!(path = %log.path().display(), "writing session log");
    }
    Ok(log)
}

/// Report a fatal error and exit non-zero. Under GitHub Actions the message
/// is also emitted as an error annotation.
fn fail(message: &str) -> ! {
    if std::env::var("GITHUB_ACTIONS").is_ok_and(|v| v == "true") {
        println!("::error::{message}");
    }
    eprintln!("Error: {message}");
    std::process::exit(1);
}
