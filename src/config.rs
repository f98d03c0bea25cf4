//! Run configuration: defaults < YAML file < environment < CLI flags.
//!
//! Every source produces a [`ConfigLayer`]; layers are merged and then
//! resolved into an immutable [`RunConfig`].

use crate::error::{SetupError, SetupResult};
use crate::query::{QueryShape, ShapeSelection};
use crate::store::config::parse_engine;
use crate::store::{ConnectOptions, StoreDescriptor};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DURATION_SECS: u64 = 600;
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_ENGINE: &str = "mongodb";

/// Named worker-count presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Light,
    #[default]
    Moderate,
    Heavy,
}

impl Preset {
    pub fn workers(&self) -> u32 {
        match self {
            Preset::Light => 8,
            Preset::Moderate => 35,
            Preset::Heavy => 100,
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "moderate" => Ok(Self::Moderate),
            "heavy" => Ok(Self::Heavy),
            other => Err(format!("unknown preset: {}", other)),
        }
    }
}

/// One partial configuration source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub preset: Option<Preset>,
    pub workers: Option<u32>,
    pub duration_secs: Option<u64>,
    pub join_timeout_secs: Option<u64>,
    pub status_interval_secs: Option<u64>,
    pub engine: Option<String>,
    pub connect: BTreeMap<String, String>,
    pub shapes: Option<Vec<QueryShape>>,
    pub selection: Option<ShapeSelection>,
    pub seed: Option<u64>,
    pub window_start: Option<NaiveDate>,
}

impl ConfigLayer {
    pub fn from_yaml_str(text: &str, origin: &str) -> SetupResult<Self> {
        serde_yaml::from_str(text).map_err(|source| SetupError::ConfigFile {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> SetupResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    /// Values set in `over` win; connect params are merged key by key.
    pub fn merge(mut self, over: ConfigLayer) -> ConfigLayer {
        self.connect.extend(over.connect);
        ConfigLayer {
            preset: over.preset.or(self.preset),
            workers: over.workers.or(self.workers),
            duration_secs: over.duration_secs.or(self.duration_secs),
            join_timeout_secs: over.join_timeout_secs.or(self.join_timeout_secs),
            status_interval_secs: over.status_interval_secs.or(self.status_interval_secs),
            engine: over.engine.or(self.engine),
            connect: self.connect,
            shapes: over.shapes.or(self.shapes),
            selection: over.selection.or(self.selection),
            seed: over.seed.or(self.seed),
            window_start: over.window_start.or(self.window_start),
        }
    }

    /// Apply defaults and validate.
    pub fn resolve(self) -> SetupResult<RunConfig> {
        let engine_name = self.engine.unwrap_or_else(|| DEFAULT_ENGINE.to_string());
        let engine =
            parse_engine(&engine_name).ok_or_else(|| SetupError::UnknownEngine(engine_name.clone()))?;
        let config = RunConfig {
            workers: self
                .workers
                .unwrap_or_else(|| self.preset.unwrap_or_default().workers()),
            duration: Duration::from_secs(self.duration_secs.unwrap_or(DEFAULT_DURATION_SECS)),
            join_timeout: Duration::from_secs(
                self.join_timeout_secs.unwrap_or(DEFAULT_JOIN_TIMEOUT_SECS),
            ),
            status_interval: Duration::from_secs(
                self.status_interval_secs
                    .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
            ),
            store: StoreDescriptor::new(engine, ConnectOptions { params: self.connect }),
            shapes: self.shapes.unwrap_or_else(|| QueryShape::ALL.to_vec()),
            selection: self.selection.unwrap_or_default(),
            window_start: self.window_start.unwrap_or_else(default_window_start),
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_window_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default()
}

/// Immutable once a run starts.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunConfig {
    pub workers: u32,
    pub duration: Duration,
    pub join_timeout: Duration,
    pub status_interval: Duration,
    pub store: StoreDescriptor,
    pub shapes: Vec<QueryShape>,
    pub selection: ShapeSelection,
    pub window_start: NaiveDate,
    pub seed: Option<u64>,
}

impl RunConfig {
    /// Defaults for everything except the store.
    pub fn new(store: StoreDescriptor) -> Self {
        Self {
            workers: Preset::default().workers(),
            duration: Duration::from_secs(DEFAULT_DURATION_SECS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            status_interval: Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS),
            store,
            shapes: QueryShape::ALL.to_vec(),
            selection: ShapeSelection::default(),
            window_start: default_window_start(),
            seed: None,
        }
    }

    pub fn validate(&self) -> SetupResult<()> {
        if self.workers == 0 {
            return Err(SetupError::InvalidWorkers);
        }
        if self.duration.is_zero() {
            return Err(SetupError::InvalidDuration);
        }
        if self.status_interval.is_zero() {
            return Err(SetupError::InvalidStatusInterval);
        }
        if self.shapes.is_empty() {
            return Err(SetupError::EmptyCatalog);
        }
        Ok(())
    }
}
