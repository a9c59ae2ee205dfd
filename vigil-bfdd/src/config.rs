//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::PathBuf;

use serde::Deserialize;
use vigil_bfd::config::{BfdConfig, InstanceCfg};

pub const DFLT_CONFIG_PATH: &str = "/etc/vigil/bfdd.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: Logging,
    pub pipes: Pipes,
    pub instance: Vec<InstanceCfg>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub stdout: LoggingStdout,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingStdout {
    pub enabled: bool,
    pub style: LoggingFmtStyle,
    pub colors: bool,
    pub show_thread_id: bool,
    pub show_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFmtStyle {
    Compact,
    #[default]
    Full,
    Json,
    Pretty,
}

// Event pipe endpoints of the sibling daemons.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pipes {
    pub vrrp: Option<PathBuf>,
    pub checker: Option<PathBuf>,
}

#[derive(Debug)]
pub enum ConfigError {
    Read(String, std::io::Error),
    Parse(toml::de::Error),
    Validation(vigil_bfd::config::ConfigError),
}

// ===== impl Config =====

impl Config {
    // Reads, parses and validates the configuration file.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|error| ConfigError::Read(path.to_owned(), error))?;
        let config =
            toml::from_str::<Config>(&data).map_err(ConfigError::Parse)?;
        config.bfd().validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    // Returns the BFD session set carried by this configuration.
    pub fn bfd(&self) -> BfdConfig {
        BfdConfig {
            instances: self.instance.clone(),
        }
    }
}

// ===== impl LoggingStdout =====

impl Default for LoggingStdout {
    fn default() -> LoggingStdout {
        LoggingStdout {
            enabled: true,
            style: Default::default(),
            colors: true,
            show_thread_id: false,
            show_source: false,
        }
    }
}

// ===== impl ConfigError =====

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(path, error) => {
                write!(f, "cannot read {path}: {error}")
            }
            ConfigError::Parse(error) => {
                write!(f, "parse error: {error}")
            }
            ConfigError::Validation(error) => {
                write!(f, "invalid configuration: {error}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let config = toml::from_str::<Config>(
            r#"
            [logging.stdout]
            enabled = true
            style = "json"

            [pipes]
            vrrp = "/run/vigil/bfd-vrrp.pipe"

            [[instance]]
            name = "peer-a"
            local_addr = "10.0.0.1"
            peer_addr = "10.0.0.2"
            min_tx = 50000
            min_rx = 50000
            multiplier = 4

            [[instance]]
            name = "peer-b"
            local_addr = "2001:db8::1"
            peer_addr = "2001:db8::2"
            auth = { type = "keyed-sha1", key_id = 1, key = "sw0rdf1sh" }
            "#,
        )
        .unwrap();

        assert_eq!(config.instance.len(), 2);
        assert!(config.bfd().validate().is_ok());

        let peer_a = &config.instance[0];
        assert_eq!(peer_a.min_tx, 50000);
        assert_eq!(peer_a.multiplier, 4);
        // Defaulted tuneables.
        assert_eq!(peer_a.idle_tx, 1_000_000);
        assert_eq!(peer_a.ttl, 255);
        assert!(!peer_a.passive);

        let peer_b = &config.instance[1];
        let auth = peer_b.auth.as_ref().unwrap();
        assert_eq!(auth.key_id, 1);
        assert_eq!(auth.key, b"sw0rdf1sh".to_vec());
    }

    #[test]
    fn reject_duplicate_peers() {
        let config = toml::from_str::<Config>(
            r#"
            [[instance]]
            name = "one"
            local_addr = "10.0.0.1"
            peer_addr = "10.0.0.2"

            [[instance]]
            name = "two"
            local_addr = "10.0.0.1"
            peer_addr = "10.0.0.2"
            "#,
        )
        .unwrap();

        assert!(config.bfd().validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        assert!(
            toml::from_str::<Config>(
                r#"
                [[instance]]
                name = "one"
                local_addr = "10.0.0.1"
                peer_addr = "10.0.0.2"
                echo_rx = 1000
                "#,
            )
            .is_err()
        );
    }
}
