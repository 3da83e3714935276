use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk_store::TransferMode;
use crate::constants::{
    DEFAULT_DIRECT_UPLOAD_TTL_SECS, DEFAULT_LEAD_TIME_MS, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS,
};
use crate::error::{Result, SyncError};
use crate::upload_queue::UploadOptions;

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Capture client with a local store and an upload queue
    Client,
    /// Remote store, registry and room server
    Server,
}

fn default_port() -> u16 {
    3000
}

fn default_lead_time_ms() -> i64 {
    DEFAULT_LEAD_TIME_MS
}

fn default_direct_upload_ttl_secs() -> i64 {
    DEFAULT_DIRECT_UPLOAD_TTL_SECS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

/// Upload tuning (maps to the [upload] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Transfers in flight per recording, clamped to 1..=10 (default: 3)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retries after the first attempt before a chunk is marked failed (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff (default: 500)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl UploadConfig {
    pub fn options(&self) -> UploadOptions {
        UploadOptions {
            max_concurrency: self.max_concurrency,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
        .clamped()
    }
}

/// Client configuration file structure
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Configuration type (must be "client")
    pub config_type: ConfigType,
    /// Directory holding client.sqlite and the process lock
    pub data_dir: PathBuf,
    /// URL of the remote server (e.g., http://remote:3000)
    pub remote_url: String,
    /// proxy or direct (default: proxy)
    #[serde(default)]
    pub transfer_mode: TransferMode,
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Server configuration file structure
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Configuration type (must be "server")
    pub config_type: ConfigType,
    /// Directory holding server.sqlite
    pub data_dir: PathBuf,
    /// API server port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Delay between a room entering recording and the shared start instant (default: 3000)
    #[serde(default = "default_lead_time_ms")]
    pub lead_time_ms: i64,
    /// Lifetime of direct upload grants (default: 300)
    #[serde(default = "default_direct_upload_ttl_secs")]
    pub direct_upload_ttl_secs: i64,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        expect_type(self.config_type, ConfigType::Client)?;
        let url = url::Url::parse(&self.remote_url)
            .map_err(|e| SyncError::Config(format!("invalid remote_url '{}': {}", self.remote_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "remote_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        expect_type(self.config_type, ConfigType::Server)?;
        if self.lead_time_ms < 0 {
            return Err(SyncError::Config("lead_time_ms must not be negative".to_string()));
        }
        if self.direct_upload_ttl_secs <= 0 {
            return Err(SyncError::Config(
                "direct_upload_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn expect_type(actual: ConfigType, expected: ConfigType) -> Result<()> {
    if actual != expected {
        return Err(SyncError::Config(format!(
            "config_type must be '{}', got '{}'",
            type_name(expected),
            type_name(actual)
        )));
    }
    Ok(())
}

fn type_name(config_type: ConfigType) -> &'static str {
    match config_type {
        ConfigType::Client => "client",
        ConfigType::Server => "server",
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        SyncError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
    })
}

pub fn parse_client_config(content: &str) -> Result<ClientConfig> {
    let config: ClientConfig = toml::from_str(content)
        .map_err(|e| SyncError::Config(format!("Failed to parse client config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

pub fn parse_server_config(content: &str) -> Result<ServerConfig> {
    let config: ServerConfig = toml::from_str(content)
        .map_err(|e| SyncError::Config(format!("Failed to parse server config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    parse_client_config(&read_config(path)?)
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    parse_server_config(&read_config(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = parse_client_config(
            r#"
            config_type = "client"
            data_dir = "/tmp/capture"
            remote_url = "http://localhost:3000"
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer_mode, TransferMode::Proxy);
        assert_eq!(config.upload.options(), UploadOptions::default());
    }

    #[test]
    fn test_client_upload_section_is_clamped() {
        let config = parse_client_config(
            r#"
            config_type = "client"
            data_dir = "/tmp/capture"
            remote_url = "https://media.example.com/api"
            transfer_mode = "direct"

            [upload]
            max_concurrency = 64
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer_mode, TransferMode::Direct);
        let options = config.upload.options();
        assert_eq!(options.max_concurrency, 10);
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retry_backoff_ms, DEFAULT_RETRY_BACKOFF_MS);
    }

    #[test]
    fn test_mismatched_config_type_is_rejected() {
        let err = parse_client_config(
            r#"
            config_type = "server"
            data_dir = "/tmp/capture"
            remote_url = "http://localhost:3000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("config_type must be 'client'"));
    }

    #[test]
    fn test_bad_remote_url_is_rejected() {
        assert!(parse_client_config(
            r#"
            config_type = "client"
            data_dir = "/tmp/capture"
            remote_url = "ftp://localhost"
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_server_defaults() {
        let config = parse_server_config(
            r#"
            config_type = "server"
            data_dir = "/srv/media"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.lead_time_ms, 3000);
        assert_eq!(config.direct_upload_ttl_secs, 300);
    }
}
