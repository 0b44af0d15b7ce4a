//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use mpchat_core::Settings;

/// Runtime configuration. File: ~/.config/mpchat/config.toml or /etc/mpchat/config.toml.
/// Env overrides: MPCHAT_SERVICE_ID, MPCHAT_INVITE_TIMEOUT_SECS, MPCHAT_SETTLE_DELAY_MS,
/// MPCHAT_PAGE_SIZE, MPCHAT_DATA_DIR, MPCHAT_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery service type (default "mp-chat").
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Outstanding invite bound in seconds (default 10).
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    /// Delay before discovery restarts after a session change (default 1000 ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Messages per history page (default 20).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Directory of the durable store. Defaults to $HOME/.local/share/mpchat.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_service_id() -> String {
    mpchat_core::DEFAULT_SERVICE_ID.to_string()
}
fn default_invite_timeout_secs() -> u64 {
    10
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_page_size() -> usize {
    mpchat_core::DEFAULT_PAGE_SIZE
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            invite_timeout_secs: default_invite_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            page_size: default_page_size(),
            data_dir: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Coordinator settings derived from this config.
    pub fn settings(&self) -> Settings {
        Settings {
            service_id: self.service_id.clone(),
            invite_timeout: Duration::from_secs(self.invite_timeout_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            page_size: self.page_size.max(1),
        }
    }

    /// Store directory: configured, else under $HOME, else relative to the working directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(h) => PathBuf::from(h).join(".local/share/mpchat"),
            None => PathBuf::from("mpchat-data"),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Parse a config file body.
pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Apply overrides from `var`. Values that fail to parse are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MPCHAT_SERVICE_ID") {
        if !s.is_empty() {
            c.service_id = s;
        }
    }
    if let Some(s) = var("MPCHAT_INVITE_TIMEOUT_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.invite_timeout_secs = v;
        }
    }
    if let Some(s) = var("MPCHAT_SETTLE_DELAY_MS") {
        if let Ok(v) = s.parse::<u64>() {
            c.settle_delay_ms = v;
        }
    }
    if let Some(s) = var("MPCHAT_PAGE_SIZE") {
        if let Ok(v) = s.parse::<usize>() {
            c.page_size = v;
        }
    }
    if let Some(s) = var("MPCHAT_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = Some(PathBuf::from(s));
        }
    }
    if let Some(s) = var("MPCHAT_LOG") {
        if !s.is_empty() {
            c.log_filter = s;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mpchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/mpchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "ignoring invalid config: {}", e),
                },
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config: {}", e),
            }
            break;
        }
    }
    None
}
