// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with warden agent configuration

use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a warden agent
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the agent debug log
    pub log: ConfigLogging,

    /// Directory backing the identity store client.
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: Utf8PathBuf,

    /// Scratch/data directory (certificate staging, temporary web material).
    #[serde(default = "default_data_dir")]
    pub data_dir: Utf8PathBuf,

    /// Webroot served during installer domain validation.
    #[serde(default = "default_webroot")]
    pub webroot: Utf8PathBuf,

    /// Path of the local command pipe.
    #[serde(default = "default_command_pipe")]
    pub command_pipe: Utf8PathBuf,

    /// Bind address of the agent web API.
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Base URL of the container-orchestration platform API.
    #[serde(default = "default_orchestration_url")]
    pub orchestration_url: String,

    /// Base URL of the messaging middleware for this node. Dependent nodes
    /// default to the principal URL recorded in the cluster configuration.
    #[serde(default)]
    pub middleware_url: Option<String>,

    /// Base URL of the external certificate authority driven by
    /// `initialize_domain`.
    #[serde(default)]
    pub certificate_authority_url: Option<String>,

    /// Hostname override; taken from the environment when absent.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Dev mode: skip certificate expiration validation.
    #[serde(default)]
    pub insecure: bool,

    /// Overrides the security level recorded in the cluster configuration
    /// during node-type detection. A development aid; leave unset in
    /// production.
    #[serde(default)]
    pub security_level: Option<warden_common::cluster::SecurityLevel>,

    /// Maintenance loop cadence, in seconds.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Bound on each blocking wait (own-certificate poll, CSR-batch reply).
    #[serde(default = "default_bounded_wait_secs")]
    pub bounded_wait_secs: u64,

    /// One-minute load average above which workload-management substeps are
    /// skipped for the cycle.
    #[serde(default = "default_max_load")]
    pub max_load: f64,

    /// Renewal horizon: certificates expiring within this many days are
    /// renewed.
    #[serde(default = "default_renewal_horizon_days")]
    pub renewal_horizon_days: u32,

    /// UDP port of the service-discovery broadcaster.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

fn default_secrets_dir() -> Utf8PathBuf {
    "/var/lib/warden/secrets".into()
}

fn default_data_dir() -> Utf8PathBuf {
    "/var/lib/warden/data".into()
}

fn default_webroot() -> Utf8PathBuf {
    "/var/lib/warden/webroot".into()
}

fn default_command_pipe() -> Utf8PathBuf {
    "/run/warden/commands.pipe".into()
}

fn default_bind_address() -> SocketAddr {
    "127.0.0.1:8441".parse().unwrap()
}

fn default_orchestration_url() -> String {
    "http://127.0.0.1:2375".to_string()
}

fn default_maintenance_interval_secs() -> u64 {
    30
}

fn default_bounded_wait_secs() -> u64 {
    120
}

fn default_max_load() -> f64 {
    4.0
}

fn default_renewal_horizon_days() -> u32 {
    21
}

fn default_discovery_port() -> u16 {
    8446
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file(path: &Utf8PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.clone(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.clone(), err })?;
        Ok(config)
    }

    /// The effective hostname of this node.
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn bounded_wait(&self) -> Duration {
        Duration::from_secs(self.bounded_wait_secs)
    }

    pub fn renewal_horizon(&self) -> Duration {
        Duration::from_secs(u64::from(self.renewal_horizon_days) * 86400)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        assert_eq!(config.maintenance_interval(), Duration::from_secs(30));
        assert_eq!(config.bounded_wait(), Duration::from_secs(120));
        assert_eq!(config.command_pipe, "/run/warden/commands.pipe");
        assert!(!config.insecure);
    }

    #[test]
    fn overrides_parse() {
        let config: Config = toml::from_str(
            r#"
            secrets_dir = "/tmp/secrets"
            insecure = true
            maintenance_interval_secs = 5
            middleware_url = "http://principal.cluster.internal:8441"

            [log]
            mode = "stderr-terminal"
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.secrets_dir, "/tmp/secrets");
        assert!(config.insecure);
        assert_eq!(config.maintenance_interval(), Duration::from_secs(5));
        assert_eq!(
            config.middleware_url.as_deref(),
            Some("http://principal.cluster.internal:8441")
        );
    }
}
