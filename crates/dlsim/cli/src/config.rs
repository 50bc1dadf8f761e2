//! Scenario configuration

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use dlsim_core::SimulationConfig;
use dlsim_types::AcquisitionMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A scenario: core settings plus the commands applied at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Core limits, actor and event settings
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Resources registered at startup, in order
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,

    /// Processes created after the resources
    #[serde(default)]
    pub processes: Vec<ProcessEntry>,

    /// Detector settings
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Run settings
    #[serde(default)]
    pub run: RunConfig,
}

/// A resource to register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: i64,
    pub name: String,
    pub instances: i64,
}

/// A process to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub id: i64,

    /// Pause before each request, in milliseconds
    pub request_interval_ms: u64,

    /// How long a granted instance is held, in milliseconds
    pub usage_interval_ms: u64,

    #[serde(default)]
    pub mode: AcquisitionMode,
}

impl ProcessEntry {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn usage_interval(&self) -> Duration {
        Duration::from_millis(self.usage_interval_ms)
    }
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Start the detector with the scenario
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep period in milliseconds
    #[serde(default = "default_detector_period_ms")]
    pub period_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: default_detector_period_ms(),
        }
    }
}

impl DetectorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// How long to run before shutting down; 0 runs until interrupted
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_detector_period_ms() -> u64 {
    2_000
}

fn default_duration_secs() -> u64 {
    30
}

impl ScenarioConfig {
    /// Builder seeded with the built-in defaults
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder().add_source(Config::try_from(&ScenarioConfig::default())?))
    }

    /// Load from defaults, then the scenario file, then `DLSIM_*` variables.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `DLSIM_RUN__DURATION_SECS=60`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("DLSIM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
