use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use optiline::alignment::{
    AlignmentController, AlignmentExecutor, AlignmentMode, Position, SearchStrategy,
    SimulatedStage,
};
use optiline::config::OptilineConfig;
use optiline::workflow::{
    ComponentExecutor, ExecutionError, InMemoryProcessStore, JsonFileProcessStore, Metadata,
    ProcessState, ProcessStore, StepParameters, WorkflowManager, WorkflowTemplate,
};
use optiline::{init_telemetry, shutdown_telemetry, ShutdownCoordinator};

/// Component name the alignment controller is registered under
const ALIGNMENT_COMPONENT: &str = "alignment";

#[derive(Parser)]
#[command(name = "optiline")]
#[command(about = "Optical packaging process orchestration and active fiber alignment")]
#[command(long_about = "Optiline runs packaging process templates (dispense, align, cure, inspect) \
                       as dependency graphs against station components, and drives closed-loop \
                       fiber-to-waveguide alignment. Hardware is simulated from configuration.")]
struct Cli {
    /// Configuration file to load instead of the default search
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a template file for structural errors without running it
    Validate {
        /// Template file (.toml or .json)
        template: PathBuf,
    },
    /// Run a template to completion on a simulated station
    Run {
        /// Template file (.toml or .json)
        template: PathBuf,
        /// Batch identifier recorded on the instance
        #[arg(long)]
        batch: Option<String>,
        /// Instance metadata entries
        #[arg(long = "meta", value_parser = parse_key_val, help = "Metadata entry as key=value (repeatable)")]
        meta: Vec<(String, String)>,
    },
    /// Run one alignment on the simulated stage and print the report
    Align {
        /// Fine search strategy: gradient, spiral or combined
        #[arg(long)]
        strategy: Option<SearchStrategy>,
        /// Stage start position as x,y,z in microns
        #[arg(long)]
        start: Option<Position>,
        /// Phases to run: full, coarse or fine
        #[arg(long, default_value = "full")]
        mode: AlignmentMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OptilineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            OptilineConfig::load_env_file()?;
            optiline::config()?.clone()
        }
    };
    init_telemetry(&config.observability)?;

    let outcome = match cli.command {
        Commands::Validate { template } => validate_command(&template),
        Commands::Run {
            template,
            batch,
            meta,
        } => run_command(&config, &template, batch, meta).await,
        Commands::Align {
            strategy,
            start,
            mode,
        } => align_command(&config, strategy, start, mode).await,
    };

    shutdown_telemetry();
    outcome
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn load_template(path: &Path) -> Result<WorkflowTemplate> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    let template = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        _ => toml::from_str(&raw)?,
    };
    Ok(template)
}

fn validate_command(path: &Path) -> Result<()> {
    let template = load_template(path)?;
    let graph = template.validate()?;

    println!(
        "✅ Template '{}' v{} is valid: {} steps",
        template.id,
        template.version,
        graph.len()
    );
    for step in &template.steps {
        let deps = if step.dependencies.is_empty() {
            "-".to_string()
        } else {
            step.dependencies.join(", ")
        };
        println!(
            "   {:<20} component={:<12} after={}{}",
            step.id,
            step.component,
            deps,
            if step.critical { " (critical)" } else { "" }
        );
    }
    Ok(())
}

async fn run_command(
    config: &OptilineConfig,
    path: &Path,
    batch: Option<String>,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let template = load_template(path)?;

    let store: Arc<dyn ProcessStore> = if config.persistence.enabled {
        Arc::new(JsonFileProcessStore::new(&config.persistence.state_dir))
    } else {
        Arc::new(InMemoryProcessStore::new())
    };
    let manager = Arc::new(WorkflowManager::with_store(config.engine.clone(), store));

    let stage = Arc::new(SimulatedStage::new(config.alignment.simulation.clone()));
    let controller = AlignmentController::new(
        stage.clone(),
        stage,
        config.alignment.calibration.clone(),
    );
    manager
        .register_component(
            ALIGNMENT_COMPONENT,
            Arc::new(AlignmentExecutor::new(
                controller,
                config.alignment.parameters.clone(),
            )),
        )
        .await;

    // Every other station component is a timed no-op on a simulated line
    for step in &template.steps {
        if step.component != ALIGNMENT_COMPONENT
            && !manager.component_names().await.contains(&step.component)
        {
            info!(component = %step.component, "Registering simulated station component");
            manager
                .register_component(step.component.clone(), Arc::new(SimulatedOperation))
                .await;
        }
    }

    let template_id = template.id.clone();
    manager.register_template(template).await?;

    let metadata: Metadata = meta
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    let instance_id = manager
        .create_instance(&template_id, batch, metadata)
        .await?
        .id;
    manager.start(instance_id).await?;
    println!("🚀 Started process {instance_id} from template '{template_id}'");

    let coordinator = ShutdownCoordinator::new(manager.clone());
    let finished = coordinator
        .run_until_signal(manager.wait_for_terminal(instance_id))
        .await?;
    let instance = match finished {
        Some(instance) => instance?,
        None => manager.status(instance_id).await?,
    };

    println!("{}", serde_json::to_string_pretty(&instance)?);
    match instance.state {
        ProcessState::Completed => {
            println!("✅ Process completed ({:.0}%)", instance.progress_percentage());
            Ok(())
        }
        state => bail!(
            "Process ended {}: {}",
            state,
            instance.failure.as_deref().unwrap_or("no diagnostic")
        ),
    }
}

async fn align_command(
    config: &OptilineConfig,
    strategy: Option<SearchStrategy>,
    start: Option<Position>,
    mode: AlignmentMode,
) -> Result<()> {
    let mut simulation = config.alignment.simulation.clone();
    if let Some(start) = start {
        simulation.start = start;
    }
    let mut params = config.alignment.parameters.clone();
    if let Some(strategy) = strategy {
        params.strategy = strategy;
    }

    simulation.validate()?;
    let stage = Arc::new(SimulatedStage::new(simulation));
    let controller =
        AlignmentController::new(stage.clone(), stage, config.alignment.calibration.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling alignment");
            on_signal.cancel();
        }
    });

    let report = controller.run(mode, &params, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.success {
        println!(
            "✅ Aligned at {} with {:.2} dBm after {} iterations",
            report
                .final_position
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string()),
            report.final_power_dbm.unwrap_or(f64::NAN),
            report.iterations
        );
        Ok(())
    } else {
        bail!(
            "Alignment did not succeed ({:?}): {}",
            report.stop_reason,
            report.message.as_deref().unwrap_or("no diagnostic")
        )
    }
}

/// Station operation that waits `duration_ms` (default 50) and echoes its parameters
struct SimulatedOperation;

#[async_trait]
impl ComponentExecutor for SimulatedOperation {
    async fn execute(
        &self,
        parameters: &StepParameters,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let duration_ms = match parameters.get("duration_ms") {
            None => 50,
            Some(value) => value.as_u64().ok_or_else(|| ExecutionError::InvalidParameters {
                message: format!("duration_ms must be a non-negative integer, got {value}"),
            })?,
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                Ok(Value::Object(parameters.clone()))
            }
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        }
    }
}
