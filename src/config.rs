//! Configuration file loading.
//!
//! The file is TOML with one `[tunnel.<name>]` table per tunnel and an
//! optional `[color]` table of terminal color numbers that is passed
//! through to the display untouched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::registry::TunnelSpec;

/// Default config location, `~/.tunneltop.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tunneltop.toml")
}

/// Default debug log location, `~/.tunneltop.log`.
pub fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tunneltop.log")
}

fn default_true() -> bool {
    true
}

fn default_test_interval() -> u64 {
    60
}

fn default_test_timeout() -> u64 {
    10
}

/// One `[tunnel.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelTable {
    pub address: String,
    pub port: u16,
    pub command: String,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub test_command_result: String,
    #[serde(default = "default_test_interval")]
    pub test_interval: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout: u64,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

/// Raw file layout as serde sees it.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tunnel: BTreeMap<String, TunnelTable>,
    #[serde(default)]
    color: BTreeMap<String, i32>,
}

/// Parsed configuration: tunnel specs keyed by name plus the color table.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub tunnels: BTreeMap<String, TunnelSpec>,
    pub colors: BTreeMap<String, i32>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: ConfigFile = toml::from_str(content)?;
        let tunnels = raw
            .tunnel
            .into_iter()
            .map(|(name, table)| {
                let spec = TunnelSpec {
                    name: name.clone(),
                    address: table.address,
                    port: table.port,
                    command: table.command,
                    test_command: table.test_command,
                    test_command_result: table.test_command_result,
                    test_interval: table.test_interval,
                    test_timeout: table.test_timeout,
                    auto_start: table.auto_start,
                };
                (name, spec)
            })
            .collect();
        Ok(Self {
            tunnels,
            colors: raw.color,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SAMPLE: &str = r#"
[tunnel.socks5]
address = "127.0.0.1"
port = 9998
command = "ssh -N -D 9998 example"
test_command = "curl -s example.com"
test_command_result = "ok"
test_interval = 300
test_timeout = 10

[tunnel.plain]
address = "10.0.0.2"
port = 8080
command = "ssh -N -L 8080:web:80 example"
auto_start = false

[color]
header_fg = 4
header_bg = -1
active_fg = 2
"#;

    #[test]
    fn parses_tunnels_and_colors() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.tunnels.len(), 2);

        let socks = &config.tunnels["socks5"];
        assert_eq!(socks.name, "socks5");
        assert_eq!(socks.port, 9998);
        assert_eq!(socks.test_command_result, "ok");
        assert_eq!(socks.test_interval, 300);
        assert!(socks.auto_start);
        assert!(socks.has_probe());

        assert_eq!(config.colors["header_fg"], 4);
        assert_eq!(config.colors["header_bg"], -1);
    }

    #[test]
    fn probe_fields_are_optional() {
        let config = Config::parse(SAMPLE).unwrap();
        let plain = &config.tunnels["plain"];
        assert!(plain.test_command.is_empty());
        assert!(!plain.has_probe());
        assert_eq!(plain.test_interval, 60);
        assert_eq!(plain.test_timeout, 10);
        assert!(!plain.auto_start);
    }

    #[test]
    fn missing_command_is_a_config_error() {
        let err = Config::parse(
            r#"
[tunnel.broken]
address = "127.0.0.1"
port = 1
"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = Config::parse("not [ valid").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn empty_file_yields_empty_config() {
        let config = Config::parse("").unwrap();
        assert!(config.tunnels.is_empty());
        assert!(config.colors.is_empty());
    }
}
