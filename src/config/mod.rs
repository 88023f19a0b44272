//! Configuration management
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables such as `SIPFLOW__SIP__PORT=5070`. Every field has a default.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::routing::RoutingTable;
use crate::domain::shared::SipUri;
use crate::infrastructure::protocols::sip::dialog::DialogConfig;
use crate::infrastructure::protocols::sip::registrar::RegistrarSettings;
use crate::infrastructure::protocols::sip::routing::ServerProfile;
use crate::infrastructure::protocols::sip::transaction::SipTimers;
use crate::infrastructure::protocols::sip::transport::TransportProtocol;

const ENV_PREFIX: &str = "SIPFLOW";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub timers: TimerConfig,
    pub proxy: ProxyConfig,
    pub registrar: RegistrarConfig,
    pub dialog: DialogSettings,
    pub routing: RoutingTable,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub port: u16,
    /// Host this node puts in Via and Record-Route
    pub via_address: String,
    /// Domains served by the registrar and proxy
    pub domains: Vec<String>,
    pub transport: String,
    /// Digest authentication realm
    pub realm: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5060,
            via_address: "127.0.0.1".to_string(),
            domains: Vec::new(),
            transport: "udp".to_string(),
            realm: "sipflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub timer_c_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
            timer_c_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub record_route: bool,
    pub loose_route: bool,
    pub loop_detection: bool,
    pub max_forwards: u32,
    /// Forward requests for foreign domains with no matching rule
    pub open_proxy: bool,
    pub proxy_authentication: bool,
    pub outbound_proxy: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            record_route: true,
            loose_route: true,
            loop_detection: true,
            max_forwards: 70,
            open_proxy: false,
            proxy_authentication: false,
            outbound_proxy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub registrar_authentication: bool,
    pub register_new_users: bool,
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        let settings = RegistrarSettings::default();
        Self {
            registrar_authentication: false,
            register_new_users: settings.register_new_users,
            default_expires: settings.default_expires,
            min_expires: settings.min_expires,
            max_expires: settings.max_expires,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogSettings {
    pub session_timer: bool,
    /// Seconds
    pub session_interval: u32,
    /// Seconds
    pub min_se: u32,
    pub support_100rel: bool,
    pub require_100rel: bool,
}

impl Default for DialogSettings {
    fn default() -> Self {
        Self {
            session_timer: true,
            session_interval: 1800,
            min_se: 90,
            support_100rel: true,
            require_100rel: false,
        }
    }
}

/// A provisioned user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    /// Digest password; users without one cannot authenticate
    pub password: Option<String>,
    /// Contacts that never expire
    pub contacts: Vec<String>,
}

impl Config {
    /// Load from an optional TOML file plus `SIPFLOW__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timers.t1_ms == 0 || self.timers.t2_ms < self.timers.t1_ms {
            return Err(ConfigError::Invalid("timers: need 0 < t1 <= t2".to_string()));
        }
        if self.registrar.min_expires > self.registrar.max_expires {
            return Err(ConfigError::Invalid(
                "registrar: min_expires is above max_expires".to_string(),
            ));
        }
        if self.dialog.min_se > self.dialog.session_interval {
            return Err(ConfigError::Invalid(
                "dialog: min_se is above session_interval".to_string(),
            ));
        }
        if self.users.iter().any(|u| u.name.is_empty()) {
            return Err(ConfigError::Invalid("users: empty user name".to_string()));
        }
        self.transport()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.sip.bind_address, self.sip.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("sip.bind_address: {}", e)))
    }

    fn transport(&self) -> Result<TransportProtocol, ConfigError> {
        TransportProtocol::parse(&self.sip.transport)
            .ok_or_else(|| ConfigError::Invalid(format!("sip.transport: unknown '{}'", self.sip.transport)))
    }

    pub fn sip_timers(&self) -> SipTimers {
        SipTimers {
            t1: Duration::from_millis(self.timers.t1_ms),
            t2: Duration::from_millis(self.timers.t2_ms),
            t4: Duration::from_millis(self.timers.t4_ms),
        }
    }

    pub fn timer_c(&self) -> Duration {
        Duration::from_secs(self.timers.timer_c_secs)
    }

    pub fn server_profile(&self) -> Result<ServerProfile, ConfigError> {
        let outbound_proxy = self
            .proxy
            .outbound_proxy
            .as_deref()
            .map(SipUri::parse)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("proxy.outbound_proxy: {}", e)))?;

        Ok(ServerProfile {
            host: self.sip.via_address.clone(),
            port: self.sip.port,
            domains: self.sip.domains.clone(),
            transport: self.transport()?,
            record_route: self.proxy.record_route,
            loose_route: self.proxy.loose_route,
            loop_detection: self.proxy.loop_detection,
            max_forwards: self.proxy.max_forwards,
            outbound_proxy,
        })
    }

    pub fn dialog_config(&self) -> Result<DialogConfig, ConfigError> {
        Ok(DialogConfig {
            via_host: self.sip.via_address.clone(),
            via_port: self.sip.port,
            transport: self.transport()?,
            session_timer: self.dialog.session_timer,
            session_interval: self.dialog.session_interval,
            min_se: self.dialog.min_se,
            support_100rel: self.dialog.support_100rel,
            require_100rel: self.dialog.require_100rel,
        })
    }

    pub fn registrar_settings(&self) -> RegistrarSettings {
        RegistrarSettings {
            default_expires: self.registrar.default_expires,
            min_expires: self.registrar.min_expires,
            max_expires: self.registrar.max_expires,
            register_new_users: self.registrar.register_new_users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sip_timers(), SipTimers::default());
        assert_eq!(config.timer_c(), Duration::from_secs(180));
        assert_eq!(config.server_profile().unwrap().max_forwards, 70);
        assert_eq!(config.bind_addr().unwrap().port(), 5060);
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml_str(
            r#"
            [sip]
            via_address = "10.0.0.10"
            port = 5070
            domains = ["example.com"]

            [proxy]
            open_proxy = true
            outbound_proxy = "sip:edge.example.net;lr"

            [dialog]
            session_interval = 600
            min_se = 120

            [[routing.phone_prefix]]
            pattern = "+39"
            next_hop = "sip:it-gw.example.com"

            [[users]]
            name = "alice"
            password = "secret"
            contacts = ["sip:alice@desk.example.com"]
            "#,
        )
        .unwrap();

        let profile = config.server_profile().unwrap();
        assert_eq!(profile.host, "10.0.0.10");
        assert_eq!(profile.port, 5070);
        assert!(profile.outbound_proxy.is_some());
        assert_eq!(config.dialog_config().unwrap().min_se, 120);
        assert_eq!(config.routing.phone_prefix.0.len(), 1);
        assert_eq!(config.users[0].contacts.len(), 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml_str("[registrar]\nmin_expires = 100\nmax_expires = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml_str("[sip]\ntransport = \"carrier-pigeon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        assert!(matches!(
            Config::from_toml_str("[sip\n").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_load_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.proxy.max_forwards, 70);
    }
}
