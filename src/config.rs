use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alignment::{AlignmentParameters, CalibrationProfile, SimulationConfig};

/// Main configuration structure for optiline
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OptilineConfig {
    /// Orchestration engine tuning
    pub engine: EngineConfig,
    /// Alignment controller defaults
    pub alignment: AlignmentConfig,
    /// Process store settings
    pub persistence: PersistenceConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

/// Timing and concurrency knobs of the orchestration engine
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sleep between scheduler polls while an instance is stalled
    pub stall_poll_interval_ms: u64,
    /// Polls before a stalled instance is failed
    pub stall_max_polls: u32,
    /// How long abort waits for running steps to acknowledge cancellation
    pub abort_grace_ms: u64,
    /// How long a cancelled or timed-out step may take to wind down
    pub cancel_grace_ms: u64,
    /// Delay between retry attempts of a failed step
    pub retry_delay_ms: u64,
    /// Concurrency cap applied to components registered without an explicit one
    pub default_component_concurrency: Option<usize>,
    /// Per-component concurrency caps
    pub component_concurrency: HashMap<String, usize>,
    /// Capacity of each instance's command queue
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stall_poll_interval_ms: 1000,
            stall_max_polls: 30,
            abort_grace_ms: 5000,
            cancel_grace_ms: 1000,
            retry_delay_ms: 0,
            default_component_concurrency: None,
            component_concurrency: HashMap::new(),
            command_buffer: 32,
        }
    }
}

impl EngineConfig {
    pub fn stall_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stall_poll_interval_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Cap for `component`: explicit entry first, then the default
    pub fn concurrency_for(&self, component: &str) -> Option<usize> {
        self.component_concurrency
            .get(component)
            .copied()
            .or(self.default_component_concurrency)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Defaults every alignment run starts from
    pub parameters: AlignmentParameters,
    /// Vision-to-stage correction applied to the coarse move
    pub calibration: CalibrationProfile,
    /// Optional calibration file overriding `calibration`
    pub calibration_file: Option<PathBuf>,
    /// Simulated stage used by the CLI
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Mirror instances to JSON files instead of memory only
    pub enabled: bool,
    /// Directory holding one JSON file per instance
    pub state_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            state_dir: PathBuf::from(".optiline/instances"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl OptilineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (optiline.toml, .optiline-rc)
    /// 3. Environment variables (OPTILINE__SECTION__KEY)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("optiline.toml").exists() {
            builder = builder.add_source(File::with_name("optiline"));
        }

        if Path::new(".optiline-rc").exists() {
            builder = builder.add_source(
                File::with_name(".optiline-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("OPTILINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: OptilineConfig = builder.build()?.try_deserialize()?;

        if let Some(path) = loaded.alignment.calibration_file.clone() {
            loaded.alignment.calibration = CalibrationProfile::load(&path)?;
            tracing::info!(file = ?path, "Loaded calibration profile");
        }
        loaded.alignment.parameters.validate()?;
        loaded.alignment.simulation.validate()?;

        Ok(loaded)
    }

    /// Load a specific TOML file on top of the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path.as_ref()))
            .build()?;
        let loaded: OptilineConfig = config.try_deserialize()?;
        loaded.alignment.parameters.validate()?;
        loaded.alignment.simulation.validate()?;
        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<OptilineConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = OptilineConfig::load_env_file();
        OptilineConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static OptilineConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
