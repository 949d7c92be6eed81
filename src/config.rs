use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Chat identifier as the bot API accepts it: a numeric id or an `@username`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    Id(i64),
    Username(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Channel {
    pub id: ChatId,
    pub name: String,
}

pub type ChannelTable = HashMap<String, Channel>;

#[derive(Debug, Clone)]
pub struct InviteConfig {
    pub channels: ChannelTable,
    /// Raw service-account JSON, parsed on every token request.
    pub service_account: Option<String>,
    pub database_url: String,
    pub bot_token: String,
    pub telegram_api_url: String,
    /// Talk to the record store without a bearer credential when none can be obtained.
    pub allow_unauthenticated: bool,
    /// Fail the request instead of treating an unreadable user record as zero minutes.
    pub strict_user_lookup: bool,
    pub bind_addr: String,
}

impl InviteConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let channels = parse_channels(&var("CHANNELS").unwrap_or_default());
        let service_account = var("FIREBASE_SERVICE_ACCOUNT").filter(|s| !s.trim().is_empty());

        Ok(InviteConfig {
            channels,
            service_account,
            database_url: var("FIREBASE_DB_URL").context("FIREBASE_DB_URL must be set")?,
            bot_token: var("BOT_TOKEN").context("BOT_TOKEN must be set")?,
            telegram_api_url: var("TELEGRAM_API_URL")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
            allow_unauthenticated: is_enabled(var("ALLOW_UNAUTHENTICATED_DB").as_deref()),
            strict_user_lookup: is_enabled(var("STRICT_USER_LOOKUP").as_deref()),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        })
    }
}

/// Parses the channel table. Anything malformed yields an empty table so the
/// handler answers `InvalidChannel` rather than refusing to start.
pub fn parse_channels(raw: &str) -> ChannelTable {
    if raw.trim().is_empty() {
        return ChannelTable::new();
    }
    match serde_json::from_str(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!("CHANNELS is not a valid channel table, using none: {}", err);
            ChannelTable::new()
        }
    }
}

/// Boolean switches are off unless explicitly set to `1`, `true`, `yes` or `on`.
fn is_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}
