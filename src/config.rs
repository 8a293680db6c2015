//! JSON configuration schema for the `apx-server` binary (§10.1). Unknown
//! keys are ignored so older and newer config files stay forward- and
//! backward-compatible; a missing `extensions` block is valid and simply
//! starts a server with no listening transport.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub extensions: Option<Extensions>,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSection {
    #[serde(default = "default_shutdown_timer")]
    pub shutdown_timer: u64,
    #[serde(default = "default_connection_backlog")]
    pub connection_backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            shutdown_timer: default_shutdown_timer(),
            connection_backlog: default_connection_backlog(),
        }
    }
}

fn default_shutdown_timer() -> u64 {
    5
}

fn default_connection_backlog() -> u32 {
    64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Extensions {
    #[serde(default)]
    pub tcp_server: Option<TcpServerConfig>,
    #[serde(default)]
    pub unix_server: Option<UnixServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnixServerConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_extensions_block_is_valid() {
        let cfg: Config = serde_json::from_str(r#"{"server":{},"logging":{}}"#).unwrap();
        assert!(cfg.extensions.is_none());
        assert_eq!(cfg.server.shutdown_timer, 5);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let cfg: Config = serde_json::from_str(r#"{"server":{},"logging":{},"future-feature":{"x":1}}"#).unwrap();
        assert_eq!(cfg.server.connection_backlog, 64);
    }

    #[test]
    fn extensions_parse_bind_and_path() {
        let cfg: Config = serde_json::from_str(
            r#"{"extensions":{"tcp-server":{"bind":"0.0.0.0:5000"},"unix-server":{"path":"/tmp/apx.sock"}}}"#,
        )
        .unwrap();
        let ext = cfg.extensions.unwrap();
        assert_eq!(ext.tcp_server.unwrap().bind, "0.0.0.0:5000");
        assert_eq!(ext.unix_server.unwrap().path, "/tmp/apx.sock");
    }
}
