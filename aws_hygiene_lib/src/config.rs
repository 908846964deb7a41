use anyhow::{Error, format_err};
use serde::Deserialize;
use std::{ops::Deref, path::Path, sync::Arc, time::Duration};

/// Tunables shared by every tool, read from the environment (or `config.env`)
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ConfigInner {
    /// seconds between image scan status checks
    #[serde(default = "default_scan_poll_seconds")]
    pub scan_poll_seconds: u64,
    #[serde(default = "default_scan_max_attempts")]
    pub scan_max_attempts: usize,
    /// seconds between checks while waiting on snapshots, instances etc.
    #[serde(default = "default_waiter_poll_seconds")]
    pub waiter_poll_seconds: u64,
    #[serde(default = "default_waiter_max_attempts")]
    pub waiter_max_attempts: usize,
    #[serde(default = "default_credential_report_tries")]
    pub credential_report_tries: usize,
    /// lines requested per `DownloadDBLogFilePortion` call
    #[serde(default = "default_log_portion_lines")]
    pub log_portion_lines: i32,
}

fn default_scan_poll_seconds() -> u64 {
    15
}
fn default_scan_max_attempts() -> usize {
    10
}
fn default_waiter_poll_seconds() -> u64 {
    15
}
fn default_waiter_max_attempts() -> usize {
    40
}
fn default_credential_report_tries() -> usize {
    5
}
fn default_log_portion_lines() -> i32 {
    10_000
}

impl Default for ConfigInner {
    fn default() -> Self {
        Self {
            scan_poll_seconds: default_scan_poll_seconds(),
            scan_max_attempts: default_scan_max_attempts(),
            waiter_poll_seconds: default_waiter_poll_seconds(),
            waiter_max_attempts: default_waiter_max_attempts(),
            credential_report_tries: default_credential_report_tries(),
            log_portion_lines: default_log_portion_lines(),
        }
    }
}

impl ConfigInner {
    #[must_use]
    pub fn scan_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scan_poll_seconds)
    }

    #[must_use]
    pub fn waiter_poll_interval(&self) -> Duration {
        Duration::from_secs(self.waiter_poll_seconds)
    }
}

#[derive(Default, Debug, Clone)]
pub struct Config(Arc<ConfigInner>);

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_inner(inner: ConfigInner) -> Self {
        Self(Arc::new(inner))
    }

    /// # Errors
    /// Returns error if a config value in the environment fails to parse
    pub fn init_config() -> Result<Self, Error> {
        let fname = Path::new("config.env");
        let default_fname = dirs::config_dir()
            .map(|d| d.join("aws_hygiene_rust").join("config.env"));

        dotenv::dotenv().ok();

        if fname.exists() {
            dotenv::from_path(fname).ok();
        } else if let Some(default_fname) = default_fname.filter(|f| f.exists()) {
            dotenv::from_path(default_fname).ok();
        }

        let conf: ConfigInner =
            envy::from_env().map_err(|e| format_err!("Invalid config: {e}"))?;

        Ok(Self(Arc::new(conf)))
    }
}
