use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub destination: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            kind: "terminal".to_string(),
            level: "debug".to_string(),
            destination: "stderr".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_update_interval_ms() -> u64 {
    200
}

fn default_max_entries() -> usize {
    256
}

fn default_max_listeners() -> usize {
    16
}

fn default_connect_retry_ms() -> u64 {
    1000
}

fn default_sync_interval_ms() -> u64 {
    1000
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<ServerConfig, crate::error::Error> {
        serdeconv::from_toml_file(path)
            .map_err(|err| crate::error::Error::Config(err.to_string()))
    }
}

impl ClientConfig {
    pub fn load(path: &str) -> Result<ClientConfig, crate::error::Error> {
        serdeconv::from_toml_file(path)
            .map_err(|err| crate::error::Error::Config(err.to_string()))
    }
}
