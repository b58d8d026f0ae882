// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use zshare_reconcile::{BusConfig, RetryPolicy, SupervisorConfig};

use crate::auth::TrustedCallers;
use crate::error::{Result, ServiceError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zshare/zshared.toml";
pub const DEFAULT_DECLARED_PATH: &str = "/etc/zshare/shares.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Zfs,
    DryRun,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Daemon settings, read from a TOML file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub backend: BackendKind,
    /// TOML file holding the declared pools, datasets and shares.
    pub declared_config: PathBuf,
    pub queue_capacity: usize,
    pub max_workers: usize,
    /// Idle time after which a key's event lane is closed.
    pub lane_idle_ms: u64,
    pub retry: RetryPolicy,
    pub exports_dir: PathBuf,
    pub spool_path: Option<PathBuf>,
    pub log_level: LoggingLevel,
    /// Enables the daily rolling file log.
    pub log_dir: Option<PathBuf>,
    pub dbus: bool,
    /// Users allowed to call the D-Bus methods without polkit. Root always is.
    pub trusted_uids: Vec<u32>,
    pub prune_orphans: bool,
    pub command_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let bus = BusConfig::default();
        Self {
            backend: BackendKind::default(),
            declared_config: PathBuf::from(DEFAULT_DECLARED_PATH),
            queue_capacity: bus.queue_capacity,
            max_workers: bus.max_workers,
            lane_idle_ms: bus.lane_idle_ms,
            retry: RetryPolicy::default(),
            exports_dir: PathBuf::from(zshare_sys::DEFAULT_EXPORTS_DIR),
            spool_path: None,
            log_level: LoggingLevel::default(),
            log_dir: None,
            dbus: true,
            trusted_uids: Vec::new(),
            prune_orphans: false,
            command_timeout_secs: 60,
        }
    }
}

impl ServiceConfig {
    /// Read the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ServiceError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        Self::parse(&text).map_err(|e| match e {
            ServiceError::Config(msg) => ServiceError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ServiceError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(ServiceError::Config("max_workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ServiceError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.cap_ms < self.retry.base_ms {
            return Err(ServiceError::Config(
                "retry.cap_ms must not be below retry.base_ms".into(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ServiceError::Config(
                "command_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn trusted_callers(&self) -> TrustedCallers {
        TrustedCallers::new(self.trusted_uids.iter().copied())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            bus: BusConfig {
                queue_capacity: self.queue_capacity,
                max_workers: self.max_workers,
                lane_idle_ms: self.lane_idle_ms,
            },
            retry: self.retry.clone(),
            spool_path: self.spool_path.clone(),
            prune_orphans: self.prune_orphans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ServiceConfig::parse("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.backend, BackendKind::Zfs);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.dbus);
        assert!(!config.prune_orphans);
    }

    #[test]
    fn partial_retry_table_keeps_other_defaults() {
        let config = ServiceConfig::parse(
            r#"
            backend = "dry-run"
            spool_path = "/var/lib/zshare/spool.jsonl"
            log_level = "debug"

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::DryRun);
        assert_eq!(config.log_level, LoggingLevel::Debug);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_ms, 500);
        assert_eq!(config.retry.cap_ms, 30_000);

        let supervisor = config.supervisor_config();
        assert_eq!(
            supervisor.spool_path.as_deref(),
            Some(Path::new("/var/lib/zshare/spool.jsonl"))
        );
        assert_eq!(supervisor.retry.max_attempts, 2);
    }

    #[test]
    fn only_root_is_trusted_by_default() {
        let config = ServiceConfig::parse("").unwrap();
        assert!(config.trusted_callers().contains(0));
        assert!(!config.trusted_callers().contains(1000));

        let config = ServiceConfig::parse("trusted_uids = [1000]\nlane_idle_ms = 500").unwrap();
        assert!(config.trusted_callers().contains(1000));
        assert!(!config.trusted_callers().contains(1001));
        assert_eq!(config.supervisor_config().bus.lane_idle_ms, 500);
    }

    #[test]
    fn rejects_unknown_keys_and_zero_limits() {
        assert!(ServiceConfig::parse("queue_size = 3").is_err());
        assert!(ServiceConfig::parse("max_workers = 0").is_err());
        assert!(ServiceConfig::parse("[retry]\nbase_ms = 100\ncap_ms = 10").is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ServiceConfig::default());
    }
}
