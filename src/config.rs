//! Watcher configuration.
//!
//! Layered loading in the usual order: defaults from code, then an optional
//! TOML file, then `REMOTESTATE_*` environment overrides.

use std::path::Path;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Capacity of the two shared channels all sub-watchers feed into. The
    /// buffer absorbs bursts while a handler is mid-refresh, not history.
    #[serde(default = "default_aggregate_buffer")]
    pub aggregate_buffer: usize,
}

fn default_aggregate_buffer() -> usize {
    32
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            aggregate_buffer: default_aggregate_buffer(),
        }
    }
}

impl WatcherConfig {
    /// Loads configuration: defaults, then `path` (if given), then
    /// `REMOTESTATE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("REMOTESTATE"));
        let loaded: WatcherConfig = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| Error::Config(err.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregate_buffer == 0 {
            return Err(Error::Config("aggregate_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
