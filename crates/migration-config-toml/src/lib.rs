// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use migration_api_types::MigrationOptions;

use virt_migration::monitor::MIN_POLL_INTERVAL;
use virt_migration::tunnel::{
    BLOCK_MIGRATION_PORT, CONTROL_PORT, DIRECT_MIGRATION_PORT,
};
use virt_migration::{ManagerConfig, RetryPolicy, TunnelConfig};

/// Configuration for the migration orchestrator.
///
/// Every section may be omitted, in which case its defaults apply.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Options applied to migrations started without explicit options.
    #[serde(default)]
    pub migration: MigrationOptions,

    #[serde(default)]
    pub tunnel: Tunnel,

    #[serde(default)]
    pub store: Store,

    #[serde(default)]
    pub monitor: Monitor,

    #[serde(default)]
    pub host: Host,
}

/// Where migration tunnels listen.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Tunnel {
    /// Directory shared with the hypervisor, holding the tunnel sockets.
    pub share_dir: PathBuf,
    pub bind_addr: IpAddr,
    pub control_port: u16,
    pub direct_migration_port: u16,
    pub block_migration_port: u16,
}

impl Default for Tunnel {
    fn default() -> Self {
        Self {
            share_dir: PathBuf::from("/var/run/kubevirt"),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: CONTROL_PORT,
            direct_migration_port: DIRECT_MIGRATION_PORT,
            block_migration_port: BLOCK_MIGRATION_PORT,
        }
    }
}

/// Retries of migration record updates, in seconds.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Store {
    pub retry_interval: u64,
    pub retry_budget: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self { retry_interval: 10, retry_budget: 60 }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Monitor {
    /// Milliseconds between polls of a running migration job. Values below
    /// the library minimum are raised to it.
    pub poll_interval_ms: u64,
}

impl Default for Monitor {
    fn default() -> Self {
        Self { poll_interval_ms: 400 }
    }
}

/// Host files touched during migration.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Host {
    pub hosts_file: PathBuf,
    pub ephemeral_disk_dir: PathBuf,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            hosts_file: PathBuf::from("/etc/hosts"),
            ephemeral_disk_dir: PathBuf::from(
                "/var/run/kubevirt-ephemeral-disks",
            ),
        }
    }
}

impl Config {
    /// The orchestrator settings described by this file.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            tunnel: TunnelConfig {
                share_dir: self.tunnel.share_dir.clone(),
                bind_addr: self.tunnel.bind_addr,
                control_port: self.tunnel.control_port,
                direct_migration_port: self.tunnel.direct_migration_port,
                block_migration_port: self.tunnel.block_migration_port,
            },
            store_retry: RetryPolicy {
                interval: Duration::from_secs(self.store.retry_interval),
                budget: Duration::from_secs(self.store.retry_budget),
            },
            poll_interval: Duration::from_millis(self.monitor.poll_interval_ms)
                .max(MIN_POLL_INTERVAL),
            hosts_file: self.host.hosts_file.clone(),
            ephemeral_disk_dir: self.host.ephemeral_disk_dir.clone(),
        }
    }
}

/// Errors which may be returned when parsing the orchestrator configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config { ..Default::default() };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_config_matches_library_defaults() {
        let cfg: Config = toml::de::from_str("").unwrap();
        let manager = cfg.manager_config();
        let defaults = ManagerConfig::default();

        assert_eq!(manager.tunnel, defaults.tunnel);
        assert_eq!(manager.store_retry, defaults.store_retry);
        assert_eq!(manager.poll_interval, defaults.poll_interval);
        assert_eq!(manager.hosts_file, defaults.hosts_file);
        assert_eq!(manager.ephemeral_disk_dir, defaults.ephemeral_disk_dir);
        assert_eq!(cfg.migration, MigrationOptions::default());
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
[migration]
bandwidth = "128Mi"
allow_auto_converge = true
progress_timeout = 30

[tunnel]
share_dir = "/run/share"
control_port = 2222

[store]
retry_budget = 5

[monitor]
poll_interval_ms = 100

[host]
hosts_file = "/tmp/hosts"
"#;
        let cfg: Config = toml::de::from_str(raw).unwrap();

        assert_eq!(cfg.migration.bandwidth.as_mebibytes(), 128);
        assert!(cfg.migration.allow_auto_converge);
        assert!(!cfg.migration.unsafe_migration);
        assert_eq!(cfg.migration.progress_timeout, Duration::from_secs(30));
        assert_eq!(
            cfg.migration.completion_timeout_per_gib,
            Duration::from_secs(800)
        );

        let manager = cfg.manager_config();
        assert_eq!(manager.tunnel.share_dir, PathBuf::from("/run/share"));
        assert_eq!(manager.tunnel.control_port, 2222);
        assert_eq!(manager.tunnel.direct_migration_port, 49152);
        assert_eq!(manager.store_retry.interval, Duration::from_secs(10));
        assert_eq!(manager.store_retry.budget, Duration::from_secs(5));
        assert_eq!(manager.poll_interval, Duration::from_millis(100));
        assert_eq!(manager.hosts_file, PathBuf::from("/tmp/hosts"));
    }

    #[test]
    fn zero_poll_interval_is_raised() {
        let cfg: Config =
            toml::de::from_str("[monitor]\npoll_interval_ms = 0\n").unwrap();
        assert_eq!(cfg.manager_config().poll_interval, MIN_POLL_INTERVAL);
    }

    #[test]
    fn invalid_bandwidth_is_rejected() {
        let raw = r#"
[migration]
bandwidth = "fast"
"#;
        assert!(toml::de::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn parse_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\npoll_interval_ms = 250\n").unwrap();

        let cfg = parse(&path).unwrap();
        assert_eq!(cfg.monitor.poll_interval_ms, 250);

        assert!(matches!(
            parse(dir.path().join("missing.toml")),
            Err(ParseError::Io(_))
        ));
    }
}
