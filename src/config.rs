//! Service configuration: an optional TOML file overlaid with `ANALYZER_` environment variables.
//!
//! Nested keys use a double underscore in the environment, e.g. `ANALYZER_LISTENER__PORT=2576` or
//! `ANALYZER_SQL__CONNECTION_STRING=postgres://...`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::mllp::TerminatorPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "analyzer-logger.toml";
pub const ENV_PREFIX: &str = "ANALYZER";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listener: ListenerSettings,
    pub sql: SqlSettings,
    pub raw_store: RawStoreSettings,
    pub ack: AckSettings,
    pub framing: FramingSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub ip: String,
    pub port: u16,
    pub backlog: u32,
    pub receive_timeout_seconds: u64,
    /// How long shutdown waits for open sessions before cancelling their storage calls. Unset
    /// means wait indefinitely.
    pub drain_timeout_seconds: Option<u64>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_owned(),
            port: 2575,
            backlog: 100,
            receive_timeout_seconds: 120,
            drain_timeout_seconds: None,
        }
    }
}

impl ListenerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listener.ip `{}` is not an IP address", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SqlSettings {
    pub connection_string: String,
    pub schema: String,
    pub table: String,
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            schema: "public".to_owned(),
            table: "observations".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RawStoreSettings {
    pub directory: PathBuf,
}

impl Default for RawStoreSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("raw"),
        }
    }
}

/// Identity written into the MSH segment of every acknowledgment.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AckSettings {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    /// Echo the inbound MSH-10 instead of the fixed control id `1`.
    pub echo_control_id: bool,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self {
            sending_application: "LOGGER".to_owned(),
            sending_facility: "HOST".to_owned(),
            receiving_application: "DEVICE".to_owned(),
            receiving_facility: "FACILITY".to_owned(),
            echo_control_id: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    pub terminator_policy: TerminatorPolicy,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Any `EnvFilter` directive, e.g. `info` or `analyzer_logger=debug`.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Settings {
    /// Loads from `path` (which must exist when `required`) and the process environment, then
    /// validates.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        Self::from_sources(path, required, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
    }

    fn from_sources(path: &Path, required: bool, env: Environment) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path).required(required))
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let listener = &self.listener;
        listener.socket_addr()?;
        if listener.port == 0 {
            return invalid("listener.port must be between 1 and 65535");
        }
        if listener.backlog == 0 {
            return invalid("listener.backlog must be at least 1");
        }
        if listener.receive_timeout_seconds == 0 {
            return invalid("listener.receive_timeout_seconds must be at least 1");
        }

        if self.sql.connection_string.trim().is_empty() {
            return invalid("sql.connection_string is required");
        }
        check_identifier("sql.schema", &self.sql.schema)?;
        check_identifier("sql.table", &self.sql.table)?;

        if self.raw_store.directory.as_os_str().is_empty() {
            return invalid("raw_store.directory is required");
        }

        let ack = &self.ack;
        for (key, value) in [
            ("ack.sending_application", &ack.sending_application),
            ("ack.sending_facility", &ack.sending_facility),
            ("ack.receiving_application", &ack.receiving_application),
            ("ack.receiving_facility", &ack.receiving_facility),
        ] {
            if value.trim().is_empty() {
                return invalid(&format!("{key} must not be empty"));
            }
        }

        if self.logging.level.trim().is_empty() {
            return invalid("logging.level must not be empty");
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_owned()))
}

/// SQL identifiers are restricted to `[A-Za-z_][A-Za-z0-9_]*` so they can be quoted safely.
pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn check_identifier(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return invalid(&format!("{key} is required"));
    }
    if !is_identifier(value) {
        return invalid(&format!(
            "{key} `{value}` must match [A-Za-z_][A-Za-z0-9_]*"
        ));
    }
    Ok(())
}
