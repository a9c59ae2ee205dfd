//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use vigil_utils::ip::IpAddrExt;

use crate::packet::AuthenticationType;
use crate::session::SessionKey;

// Default timing parameters, in microseconds.
pub const DFLT_MIN_TX_INTERVAL: u32 = 100_000;
pub const DFLT_MIN_RX_INTERVAL: u32 = 100_000;
pub const DFLT_IDLE_TX_INTERVAL: u32 = 1_000_000;
pub const DFLT_DETECT_MULT: u8 = 3;

// BFD session set, as produced by the configuration parser.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BfdConfig {
    #[serde(rename = "instance")]
    pub instances: Vec<InstanceCfg>,
}

// A single `bfd_instance` record.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceCfg {
    pub name: String,
    pub local_addr: IpAddr,
    pub peer_addr: IpAddr,
    // Desired Min TX Interval once the session is Up (microseconds).
    #[serde(default = "dflt_min_tx")]
    pub min_tx: u32,
    // Required Min RX Interval (microseconds).
    #[serde(default = "dflt_min_rx")]
    pub min_rx: u32,
    // TX interval while the session is not Up (microseconds, >= 1s).
    #[serde(default = "dflt_idle_tx")]
    pub idle_tx: u32,
    #[serde(default = "dflt_detect_mult")]
    pub multiplier: u8,
    // Required incoming TTL/Hop Limit, also used for outgoing packets.
    #[serde(default = "dflt_ttl")]
    pub ttl: u8,
    // A passive session does not originate periodic transmission until it
    // has heard from the peer.
    #[serde(default)]
    pub passive: bool,
    // Whether to advertise the C (Control Plane Independent) bit.
    #[serde(default = "dflt_true")]
    pub control_independent: bool,
    #[serde(default)]
    pub auth: Option<AuthCfg>,
}

// Authentication material for one session.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthCfg {
    #[serde(rename = "type")]
    pub auth_type: AuthenticationType,
    pub key_id: u8,
    #[serde(with = "serde_key")]
    pub key: Vec<u8>,
}

// Configuration rejection reasons.
#[derive(Debug, Eq, PartialEq)]
pub enum ConfigError {
    DuplicateSession(String),
    AddressFamilyMismatch(String),
    UnusableAddress(String, IpAddr),
    InvalidDetectMult(String),
    InvalidTtl(String),
    IdleTxTooLow(String, u32),
    InvalidAuthKey(String),
}

// ===== impl BfdConfig =====

impl BfdConfig {
    // Checks the whole session set for consistency.
    //
    // A failed check rejects the new configuration wholesale; the caller
    // keeps running with the previous one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut keys = BTreeSet::new();

        for instance in &self.instances {
            instance.validate()?;
            if !keys.insert(instance.key()) {
                return Err(ConfigError::DuplicateSession(
                    instance.name.clone(),
                ));
            }
        }

        Ok(())
    }
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.local_addr, self.peer_addr)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.local_addr.address_family() != self.peer_addr.address_family()
        {
            return Err(ConfigError::AddressFamilyMismatch(self.name.clone()));
        }
        for addr in [self.local_addr, self.peer_addr] {
            if !addr.is_usable() {
                return Err(ConfigError::UnusableAddress(
                    self.name.clone(),
                    addr,
                ));
            }
        }
        if self.multiplier == 0 {
            return Err(ConfigError::InvalidDetectMult(self.name.clone()));
        }
        if self.ttl == 0 {
            return Err(ConfigError::InvalidTtl(self.name.clone()));
        }
        // RFC 5880, section 6.8.3: the TX interval must not be smaller than
        // one second while the session is not Up.
        if self.idle_tx < DFLT_IDLE_TX_INTERVAL {
            return Err(ConfigError::IdleTxTooLow(
                self.name.clone(),
                self.idle_tx,
            ));
        }
        if let Some(auth) = &self.auth {
            let max_key_len = match auth.auth_type {
                AuthenticationType::SimplePassword => 16,
                AuthenticationType::KeyedMd5
                | AuthenticationType::MeticulousKeyedMd5 => 16,
                AuthenticationType::KeyedSha1
                | AuthenticationType::MeticulousKeyedSha1 => 20,
            };
            if auth.key.is_empty() || auth.key.len() > max_key_len {
                return Err(ConfigError::InvalidAuthKey(self.name.clone()));
            }
        }

        Ok(())
    }

    // Returns true if any timing or role tuneable differs, requiring a Poll
    // Sequence on a live session.
    pub fn tuneables_changed(&self, other: &InstanceCfg) -> bool {
        self.min_tx != other.min_tx
            || self.min_rx != other.min_rx
            || self.idle_tx != other.idle_tx
            || self.multiplier != other.multiplier
            || self.ttl != other.ttl
            || self.passive != other.passive
            || self.control_independent != other.control_independent
    }

    // Returns true if the authentication material differs, requiring the
    // session to be torn down and recreated.
    pub fn auth_changed(&self, other: &InstanceCfg) -> bool {
        self.auth != other.auth
    }
}

// ===== impl ConfigError =====

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::DuplicateSession(name) => {
                write!(f, "instance {name}: duplicate local/peer address pair")
            }
            ConfigError::AddressFamilyMismatch(name) => {
                write!(
                    f,
                    "instance {name}: local and peer address families differ"
                )
            }
            ConfigError::UnusableAddress(name, addr) => {
                write!(f, "instance {name}: unusable address {addr}")
            }
            ConfigError::InvalidDetectMult(name) => {
                write!(f, "instance {name}: detection multiplier must be 1-255")
            }
            ConfigError::InvalidTtl(name) => {
                write!(f, "instance {name}: ttl must be 1-255")
            }
            ConfigError::IdleTxTooLow(name, idle_tx) => {
                write!(
                    f,
                    "instance {name}: idle-tx of {idle_tx}us is below the \
                     one second minimum"
                )
            }
            ConfigError::InvalidAuthKey(name) => {
                write!(f, "instance {name}: invalid authentication key length")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ===== helper functions =====

fn dflt_min_tx() -> u32 {
    DFLT_MIN_TX_INTERVAL
}

fn dflt_min_rx() -> u32 {
    DFLT_MIN_RX_INTERVAL
}

fn dflt_idle_tx() -> u32 {
    DFLT_IDLE_TX_INTERVAL
}

fn dflt_detect_mult() -> u8 {
    DFLT_DETECT_MULT
}

fn dflt_ttl() -> u8 {
    vigil_utils::socket::TTL_MAX
}

fn dflt_true() -> bool {
    true
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, local: &str, peer: &str) -> InstanceCfg {
        InstanceCfg {
            name: name.to_owned(),
            local_addr: local.parse().unwrap(),
            peer_addr: peer.parse().unwrap(),
            min_tx: DFLT_MIN_TX_INTERVAL,
            min_rx: DFLT_MIN_RX_INTERVAL,
            idle_tx: DFLT_IDLE_TX_INTERVAL,
            multiplier: DFLT_DETECT_MULT,
            ttl: 255,
            passive: false,
            control_independent: true,
            auth: None,
        }
    }

    #[test]
    fn accept_valid_config() {
        let config = BfdConfig {
            instances: vec![
                instance("a", "10.0.0.1", "10.0.0.2"),
                instance("b", "10.0.0.1", "10.0.0.3"),
                instance("c", "2001:db8::1", "2001:db8::2"),
            ],
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn reject_address_family_mismatch() {
        let config = BfdConfig {
            instances: vec![instance("a", "10.0.0.1", "2001:db8::2")],
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::AddressFamilyMismatch("a".to_owned()))
        );
    }

    #[test]
    fn reject_zero_multiplier() {
        let mut bad = instance("a", "10.0.0.1", "10.0.0.2");
        bad.multiplier = 0;
        let config = BfdConfig {
            instances: vec![bad],
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDetectMult("a".to_owned()))
        );
    }

    #[test]
    fn reject_subsecond_idle_tx() {
        let mut bad = instance("a", "10.0.0.1", "10.0.0.2");
        bad.idle_tx = 100_000;
        let config = BfdConfig {
            instances: vec![bad],
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::IdleTxTooLow("a".to_owned(), 100_000))
        );
    }

    #[test]
    fn reject_oversized_auth_key() {
        let mut bad = instance("a", "10.0.0.1", "10.0.0.2");
        bad.auth = Some(AuthCfg {
            auth_type: AuthenticationType::SimplePassword,
            key_id: 1,
            key: vec![b'x'; 17],
        });
        let config = BfdConfig {
            instances: vec![bad],
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidAuthKey("a".to_owned()))
        );
    }

    #[test]
    fn tuneables_vs_auth_changes() {
        let base = instance("a", "10.0.0.1", "10.0.0.2");

        let mut faster = base.clone();
        faster.min_rx = 50_000;
        assert!(base.tuneables_changed(&faster));
        assert!(!base.auth_changed(&faster));

        let mut keyed = base.clone();
        keyed.auth = Some(AuthCfg {
            auth_type: AuthenticationType::KeyedMd5,
            key_id: 1,
            key: b"secret".to_vec(),
        });
        assert!(!base.tuneables_changed(&keyed));
        assert!(base.auth_changed(&keyed));
    }
}

// Keys are written as strings in the configuration file but handled as raw
// bytes everywhere else.
mod serde_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&String::from_utf8_lossy(key))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let key = String::deserialize(deserializer)?;
        Ok(key.into_bytes())
    }
}
