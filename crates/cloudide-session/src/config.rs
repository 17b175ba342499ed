use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudide_protocol::paths;
use serde::Deserialize;

use crate::dispatch::{ReplyMatching, TimeoutPolicy};
use crate::error::ConfigError;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_workspace_url")]
    pub workspace_url: String,
    #[serde(default = "default_terminal_url")]
    pub terminal_url: String,
    #[serde(default = "default_terminal_pod_prefix")]
    pub terminal_pod_prefix: String,
    /// Quiet period before a document edit is written back.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// `0` waits for replies forever.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub reply_matching: ReplyMatching,
    /// Bound on frames queued for one connection's writer.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl ClientConfig {
    /// Load from [`paths::config_path`], then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&paths::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::parse(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_overrides(
            std::env::var("CLOUDIDE_WORKSPACE_URL").ok(),
            std::env::var("CLOUDIDE_TERMINAL_URL").ok(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Replace the endpoints that are given. Used for env vars and CLI flags.
    pub fn apply_overrides(&mut self, workspace_url: Option<String>, terminal_url: Option<String>) {
        if let Some(url) = workspace_url {
            self.workspace_url = url;
        }
        if let Some(url) = terminal_url {
            self.terminal_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ws_url("workspace_url", &self.workspace_url)?;
        validate_ws_url("terminal_url", &self.terminal_url)?;
        if self.debounce_ms == 0 {
            return Err(ConfigError::Zero {
                field: "debounce_ms",
            });
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Zero {
                field: "outbound_queue",
            });
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::from_millis(self.request_timeout_ms)
    }

    /// Endpoint for one terminal attached to `workspace_id`.
    ///
    /// `terminal_id` distinguishes several terminals on the same workspace
    /// and is omitted from the query when empty.
    pub fn terminal_endpoint(&self, workspace_id: &str, terminal_id: &str) -> String {
        let sep = if self.terminal_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{sep}type=terminal&pod={}{workspace_id}",
            self.terminal_url, self.terminal_pod_prefix
        );
        if !terminal_id.is_empty() {
            url.push_str("&terminal=");
            url.push_str(terminal_id);
        }
        url
    }

    pub fn default_path() -> PathBuf {
        paths::config_path()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            workspace_url: default_workspace_url(),
            terminal_url: default_terminal_url(),
            terminal_pod_prefix: default_terminal_pod_prefix(),
            debounce_ms: default_debounce_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reply_matching: ReplyMatching::default(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

fn validate_ws_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let rest = value
        .strip_prefix("ws://")
        .or_else(|| value.strip_prefix("wss://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

fn default_workspace_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_terminal_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_terminal_pod_prefix() -> String {
    "shell-".to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_outbound_queue() -> usize {
    256
}
