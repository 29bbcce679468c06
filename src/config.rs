use std::fs::read_to_string;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/oplogd/config.toml";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/oplogd";

pub const DEFAULT_EXPIRE_OPLOG_DAYS: u64 = 0;
pub const DEFAULT_EXPIRE_OPLOG_HOURS: u64 = 0;
pub const DEFAULT_OVERFLOW_CHUNK_SIZE: usize = 512 * 1024;
pub const DEFAULT_MAX_INLINE_OPS_SIZE: usize = 1024 * 1024;
pub const DEFAULT_COMPACTION_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_COMPACTION_TIMEOUT_MS: u64 = 5000;

pub static CONFIG: Lazy<RwLock<Configuration>> = Lazy::new(Default::default);

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Configuration {
    pub name: Option<String>,
    pub data_dir: Option<String>,

    /// Zero days and zero hours keep the oplog forever.
    pub expire_oplog_days: Option<u64>,
    pub expire_oplog_hours: Option<u64>,

    pub overflow_chunk_size: Option<usize>,
    pub max_inline_ops_size: Option<usize>,

    pub compaction_interval_secs: Option<u64>,
    pub compaction_timeout_ms: Option<u64>,
}

impl Configuration {
    pub fn parse_config_file(file: &str) -> Result<Configuration> {
        info!("parsing configuration file: {}", file);

        let file_contents = read_to_string(file)
            .with_context(|| format!("failed to read configuration file {}", file))?;
        let ret: Configuration = toml::from_str(&file_contents)
            .with_context(|| format!("failed to parse configuration file {}", file))?;

        debug!("configuration: {:?}", ret);
        Ok(ret)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("oplogd")
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or(DEFAULT_DATA_DIR))
    }

    pub fn expire_oplog_days(&self) -> u64 {
        self.expire_oplog_days.unwrap_or(DEFAULT_EXPIRE_OPLOG_DAYS)
    }

    pub fn expire_oplog_hours(&self) -> u64 {
        self.expire_oplog_hours.unwrap_or(DEFAULT_EXPIRE_OPLOG_HOURS)
    }

    pub fn overflow_chunk_size(&self) -> usize {
        self.overflow_chunk_size
            .unwrap_or(DEFAULT_OVERFLOW_CHUNK_SIZE)
    }

    pub fn max_inline_ops_size(&self) -> usize {
        self.max_inline_ops_size
            .unwrap_or(DEFAULT_MAX_INLINE_OPS_SIZE)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(
            self.compaction_interval_secs
                .unwrap_or(DEFAULT_COMPACTION_INTERVAL_SECS),
        )
    }

    pub fn compaction_timeout(&self) -> Duration {
        Duration::from_millis(
            self.compaction_timeout_ms
                .unwrap_or(DEFAULT_COMPACTION_TIMEOUT_MS),
        )
    }
}

fn validate_configuration(config: &Configuration) -> Result<()> {
    if config.overflow_chunk_size() == 0 {
        bail!("overflow_chunk_size must be positive");
    }
    if config.compaction_interval().is_zero() {
        bail!("compaction_interval_secs must be positive");
    }
    Ok(())
}

pub fn init_config(config_file: &str) -> Result<()> {
    let conf = Configuration::parse_config_file(config_file)?;
    validate_configuration(&conf)?;

    *CONFIG.write() = conf;

    info!("successfully initialized config module");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_config_parse() {
        let config1 = Configuration::parse_config_file("tests/test_config/config1.toml").unwrap();

        assert_eq!(config1.name(), "oplogd-test");
        assert_eq!(config1.data_dir(), PathBuf::from("/tmp/oplogd-test"));
        assert_eq!(config1.expire_oplog_days(), 1);
        assert_eq!(config1.expire_oplog_hours(), 6);
        assert_eq!(config1.overflow_chunk_size(), 65536);
        // not set in the file
        assert_eq!(config1.max_inline_ops_size(), DEFAULT_MAX_INLINE_OPS_SIZE);
        assert_eq!(config1.compaction_interval(), Duration::from_secs(30));
        assert_eq!(config1.compaction_timeout(), Duration::from_millis(2000));
    }

    #[test]
    pub fn test_config_defaults() {
        let conf = Configuration::default();
        assert_eq!(conf.name(), "oplogd");
        assert_eq!(conf.expire_oplog_days(), 0);
        assert!(validate_configuration(&conf).is_ok());

        let bad = Configuration {
            overflow_chunk_size: Some(0),
            ..Default::default()
        };
        assert!(validate_configuration(&bad).is_err());
        assert!(Configuration::parse_config_file("tests/test_config/missing.toml").is_err());
    }
}
