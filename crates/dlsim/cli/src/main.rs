//! dlsim - Command-line driver for the resource allocation simulator
//!
//! Loads a scenario (resources, processes, detector period), runs it and
//! renders the event stream. In interactive mode the same commands can be
//! typed on stdin while the simulation runs.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dlsim_core::{Simulation, StopHandle, StopSignal};
use dlsim_types::{LedgerSnapshot, ProcessStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod command;
mod config;
mod error;
mod render;

use command::{Command, HELP};
use config::ScenarioConfig;
use error::CliResult;
use render::{EventPrinter, OutputFormat};

/// dlsim CLI
#[derive(Parser)]
#[command(name = "dlsim")]
#[command(about = "Resource allocation and deadlock detection simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Scenario file path (TOML, YAML or JSON)
    #[arg(short, long, env = "DLSIM_CONFIG")]
    config: Option<String>,

    /// Log level for diagnostics. Simulation events are printed separately.
    #[arg(long, env = "DLSIM_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "DLSIM_LOG_JSON")]
    json: bool,

    /// Output format for events and tables
    #[arg(short, long, default_value = "table")]
    output: OutputFormat,

    /// Also print process state changes and ledger versions
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Run the scenario (default)
    Run {
        /// Seconds to run before shutting down; 0 runs until interrupted
        #[arg(short, long)]
        duration: Option<u64>,

        /// Read commands from stdin while running
        #[arg(short, long)]
        interactive: bool,
    },

    /// Print the effective scenario configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let scenario = ScenarioConfig::load(cli.config.as_deref()).context("loading scenario")?;

    match cli.command.unwrap_or(Commands::Run {
        duration: None,
        interactive: false,
    }) {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&scenario)?);
            Ok(())
        }
        Commands::Run {
            duration,
            interactive,
        } => {
            let duration = duration.unwrap_or(scenario.run.duration_secs);
            run(scenario, cli.output, cli.verbose, duration, interactive)
                .await
                .context("running scenario")
        }
    }
}

async fn run(
    scenario: ScenarioConfig,
    format: OutputFormat,
    verbose: bool,
    duration_secs: u64,
    interactive: bool,
) -> CliResult<()> {
    let sim = Simulation::new(scenario.simulation.clone());

    let (printer_stop, printer_signal) = StopHandle::new();
    let printer = spawn_printer(&sim, EventPrinter::new(format, verbose), printer_signal);

    apply_scenario(&sim, &scenario).await;

    let deadline =
        (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    if interactive {
        interactive_loop(&sim, format, deadline).await?;
    } else {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sleep_until(deadline) => {}
        }
    }

    // Shutdown force-clears the ledger, so take the final view first.
    let snapshot = sim.snapshot();
    let processes = sim.list_processes();
    let report = sim.sweep();

    sim.shutdown().await;
    printer_stop.stop();
    if let Err(err) = printer.await {
        warn!(error = %err, "Event printer failed");
    }

    print_status(&snapshot, &processes, format)?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        render::print_report(&report);
    }
    Ok(())
}

/// Print events until stopped, then drain whatever is still queued.
fn spawn_printer(
    sim: &Simulation,
    mut printer: EventPrinter,
    mut stop: StopSignal,
) -> JoinHandle<()> {
    let mut events = sim.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(err) = printer.print(&event) {
                            warn!(error = %err, "Failed to print event");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event printer lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
                _ = stop.stopped() => break,
            }
        }

        while let Ok(event) = events.try_recv() {
            if let Err(err) = printer.print(&event) {
                warn!(error = %err, "Failed to print event");
            }
        }
    })
}

/// Apply the scenario's startup commands. Rejections are already reported
/// on the event stream, so they do not abort the run.
async fn apply_scenario(sim: &Simulation, scenario: &ScenarioConfig) {
    for resource in &scenario.resources {
        if let Err(err) = sim.add_resource(resource.id, resource.name.clone(), resource.instances) {
            debug!(error = %err, "Scenario resource rejected");
        }
    }

    for process in &scenario.processes {
        if let Err(err) = sim.create_process(
            process.id,
            process.request_interval(),
            process.usage_interval(),
            process.mode,
        ) {
            debug!(error = %err, "Scenario process rejected");
        }
    }

    if scenario.detector.enabled {
        if let Err(err) = sim.start_detector(scenario.detector.period()).await {
            debug!(error = %err, "Scenario detector rejected");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn interactive_loop(
    sim: &Simulation,
    format: OutputFormat,
    deadline: Option<Instant>,
) -> CliResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    render::print_info("type 'help' for commands, 'quit' to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep_until(deadline) => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = execute(sim, command, format).await {
                            render::print_error(&err.to_string());
                        }
                    }
                    Err(err) => render::print_error(&err.to_string()),
                }
            }
        }
    }
    Ok(())
}

async fn execute(sim: &Simulation, command: Command, format: OutputFormat) -> CliResult<()> {
    match command {
        Command::AddResource {
            id,
            name,
            instances,
        } => {
            let def = sim.add_resource(id, name, instances)?;
            render::print_success(&format!(
                "registered {} with {} instance(s)",
                def, def.total_instances
            ));
        }
        Command::RedefineResource {
            id,
            name,
            instances,
        } => {
            let def = sim.redefine_resource(id, name, instances)?;
            render::print_success(&format!(
                "redefined {} with {} instance(s)",
                def, def.total_instances
            ));
        }
        Command::CreateProcess {
            id,
            request_interval,
            usage_interval,
            mode,
        } => {
            let spec = sim.create_process(id, request_interval, usage_interval, mode)?;
            render::print_success(&format!("started process {} ({:?})", spec.id, spec.mode));
        }
        Command::StopProcess(id) => {
            let cleared = sim.stop_process(id).await?;
            render::print_success(&format!(
                "stopped process {} ({} resource(s) returned, {} request(s) dropped)",
                id,
                cleared.released.len(),
                cleared.withdrawn.len()
            ));
        }
        Command::StartDetector(period) => {
            sim.start_detector(period).await?;
            render::print_success(&format!("detector running every {:?}", period));
        }
        Command::StopDetector => {
            if sim.stop_detector().await {
                render::print_success("detector stopped");
            } else {
                render::print_info("detector was not running");
            }
        }
        Command::Status => print_status(&sim.snapshot(), &sim.list_processes(), format)?,
        Command::Sweep => render::print_report(&sim.sweep()),
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn print_status(
    snapshot: &LedgerSnapshot,
    processes: &[ProcessStatus],
    format: OutputFormat,
) -> CliResult<()> {
    render::print_table("Resources", render::resource_rows(snapshot), format)?;
    render::print_table("Processes", render::process_rows(processes), format)?;
    Ok(())
}
