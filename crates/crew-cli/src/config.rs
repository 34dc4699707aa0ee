//! Configuration file management for crew.
//!
//! Provides a TOML-based config file at `~/.config/crew/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default. Everything
//! in the file is optional; a missing file just means env vars and defaults
//! apply.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crew_core::notify::{BOT_TOKEN_ENV, CHAT_ID_ENV, TelegramNotifier};
use crew_core::queue::{DEFAULT_TRACKER_URL, TRACKER_API_KEY_ENV, TRACKER_URL_ENV};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub telegram: TelegramSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueSection {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the crew config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/crew` or `~/.config/crew`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("crew");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("crew")
}

/// Return the path to the crew config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CrewConfig {
    pub tracker_url: String,
    pub tracker_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl CrewConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli_tracker_url: Option<&str>) -> Self {
        let file_config = load_config().ok();

        let tracker_url = if let Some(url) = cli_tracker_url {
            url.to_string()
        } else if let Ok(url) = std::env::var(TRACKER_URL_ENV) {
            url
        } else if let Some(url) = file_config.as_ref().and_then(|c| c.queue.url.clone()) {
            url
        } else {
            DEFAULT_TRACKER_URL.to_string()
        };

        let tracker_api_key = std::env::var(TRACKER_API_KEY_ENV)
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.queue.api_key.clone()));

        let telegram_bot_token = std::env::var(BOT_TOKEN_ENV)
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.telegram.bot_token.clone()));
        let telegram_chat_id = std::env::var(CHAT_ID_ENV)
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.telegram.chat_id.clone()));

        Self {
            tracker_url,
            tracker_api_key,
            telegram_bot_token,
            telegram_chat_id,
        }
    }

    /// Build the best-effort notifier, when both credentials resolved.
    pub fn notifier(&self) -> Option<TelegramNotifier> {
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat_id)) => TelegramNotifier::new(token, chat_id),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
