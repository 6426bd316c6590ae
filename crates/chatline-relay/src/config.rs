use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::auth::TokenSigner;
use crate::store::DEFAULT_HISTORY_LIMIT;

/// Relay settings, read from TOML. Every field has a default.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    /// Absent means in-memory stores and directory.
    pub data_dir: Option<PathBuf>,
    pub token_secret: String,
    pub token_ttl_secs: u64,
    /// Secret the account service presents on `/internal/*`. Internal routes
    /// are refused when unset.
    pub internal_secret: Option<String>,
    pub history_limit: usize,
    /// Frames buffered per connection before senders wait.
    pub outbound_buffer: usize,
    pub allow_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: chatline::DEFAULT_LISTEN_ADDR.to_string(),
            data_dir: None,
            token_secret: String::new(),
            token_ttl_secs: 7 * 24 * 3600,
            internal_secret: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            outbound_buffer: 256,
            allow_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token_secret.len() < 16 {
            bail!("token_secret must be at least 16 bytes");
        }
        if self.history_limit == 0 {
            bail!("history_limit must be positive");
        }
        if self.outbound_buffer == 0 {
            bail!("outbound_buffer must be positive");
        }
        if matches!(&self.internal_secret, Some(s) if s.is_empty()) {
            bail!("internal_secret must not be empty when set");
        }
        Ok(())
    }

    pub fn token_signer(&self) -> TokenSigner {
        TokenSigner::new(&self.token_secret, self.token_ttl_secs)
    }
}
