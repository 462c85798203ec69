//! Registry credential provisioning for the publish command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

const NPM_REGISTRY: &str = "//registry.npmjs.org/";

/// Write an `.npmrc` carrying `token` into `home`.
pub fn write_npmrc(home: &Path, token: &str) -> Result<PathBuf> {
    let path = home.join(".npmrc");
    std::fs::write(&path, format!("{NPM_REGISTRY}:_authToken={token}"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote npm registry credentials");
    Ok(path)
}

/// Provision `~/.npmrc` for the current user.
pub fn provision_npm_token(token: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to resolve home directory")?;
    write_npmrc(&home, token)
}
