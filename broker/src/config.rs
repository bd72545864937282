/*!
# Config Module

Broker settings. Values are layered: compiled-in defaults, then an optional
YAML file, then `HOOKRELAY__`-prefixed environment variables (sections
separated by `__`, e.g. `HOOKRELAY__SCHEDULER__BATCH_SIZE=10`).
*/

use config::{Config, Environment, File, Source};
use serde::Deserialize;
use std::time::Duration;

use hookrelay_core::error::{HookRelayError, Result};
use hookrelay_core::{RetryPolicy, SchedulerConfig};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7575,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub database_url: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./hookrelay.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Timeout for a single delivery attempt (in seconds)
    pub timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl ExecutorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorSettings,
    pub retry: RetryPolicy,
}

impl Settings {
    /// Load settings from `path` (missing files are fine) and the environment
    pub fn load(path: &str) -> Result<Self> {
        Self::from_file(File::with_name(path).required(false))
    }

    fn from_file<S>(file: S) -> Result<Self>
    where
        S: Source + Send + Sync + 'static,
    {
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("HOOKRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| HookRelayError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.scheduler.validate()?;
        if self.executor.timeout_secs == 0 {
            return Err(HookRelayError::Config(
                "executor timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
