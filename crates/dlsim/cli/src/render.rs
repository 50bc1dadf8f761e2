//! Terminal rendering of simulation events and state

use crate::error::CliResult;
use colored::*;
use dlsim_types::snapshot::MatrixRow;
use dlsim_types::{
    DeadlockReport, DeadlockStatus, LedgerSnapshot, LogLevel, LogLine, ProcessId, ProcessStatus,
    ResourceId, SimEvent,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::{Table, Tabled};

/// Output format for events and tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Colored log lines and tables
    #[default]
    Table,
    /// One JSON document per line
    Json,
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

/// Renders the event stream, collapsing repeated detector reports
#[derive(Debug)]
pub struct EventPrinter {
    format: OutputFormat,
    verbose: bool,
    last_report: Option<(DeadlockStatus, Vec<ProcessId>)>,
}

impl EventPrinter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self {
            format,
            verbose,
            last_report: None,
        }
    }

    pub fn print(&mut self, event: &SimEvent) -> CliResult<()> {
        if self.format == OutputFormat::Json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }

        match event {
            SimEvent::Log(line) => print_log(line),
            SimEvent::DeadlockSwept(report) => {
                if self.report_changed(report) {
                    print_report(report);
                }
            }
            SimEvent::ProcessStateChanged { process_id, state } if self.verbose => {
                println!("{}", format!("  {} -> {}", process_id, state).dimmed());
            }
            SimEvent::LedgerUpdated(snapshot) if self.verbose => {
                println!("{}", format!("  ledger v{}", snapshot.version).dimmed());
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a report differs from the last one shown.
    fn report_changed(&mut self, report: &DeadlockReport) -> bool {
        let key = (report.status(), report.deadlocked.clone());
        if self.last_report.as_ref() == Some(&key) {
            return false;
        }
        self.last_report = Some(key);
        true
    }
}

fn print_log(line: &LogLine) {
    let level = match line.level {
        LogLevel::Debug => "DEBUG".dimmed(),
        LogLevel::Info => "INFO ".blue(),
        LogLevel::Warn => "WARN ".yellow(),
    };
    let time = line.timestamp.format("%H:%M:%S%.3f").to_string();
    println!("{} {} {}", time.dimmed(), level, line);
}

pub fn print_report(report: &DeadlockReport) {
    match report.status() {
        DeadlockStatus::Deadlocked => println!(
            "{} processes involved: {}",
            "DEADLOCK DETECTED!".red().bold(),
            report.summary()
        ),
        DeadlockStatus::Clear => println!(
            "{} ({} active process(es))",
            "No deadlock".green(),
            report.active_processes
        ),
        DeadlockStatus::Idle => println!("{}", "No active processes".dimmed()),
    }
}

/// One row per resource
#[derive(Debug, Serialize, Tabled)]
pub struct ResourceRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Total")]
    pub total: u32,
    #[tabled(rename = "Available")]
    pub available: u32,
    #[tabled(rename = "Allocated")]
    pub allocated: String,
    #[tabled(rename = "Requested")]
    pub requested: String,
}

/// One row per process
#[derive(Debug, Serialize, Tabled)]
pub struct ProcessRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Holding")]
    pub holding: String,
}

/// `P1×2, P3×1` for one resource column of a matrix, or `-`.
fn column(matrix: &BTreeMap<ProcessId, MatrixRow>, resource: ResourceId) -> String {
    let cells: Vec<String> = matrix
        .iter()
        .filter_map(|(process, row)| row.get(&resource).map(|n| format!("{}×{}", process, n)))
        .collect();
    if cells.is_empty() {
        "-".to_string()
    } else {
        cells.join(", ")
    }
}

pub fn resource_rows(snapshot: &LedgerSnapshot) -> Vec<ResourceRow> {
    snapshot
        .resources
        .iter()
        .map(|(id, counts)| ResourceRow {
            id: id.to_string(),
            name: counts.name.clone(),
            total: counts.total,
            available: counts.available,
            allocated: column(&snapshot.allocation, *id),
            requested: column(&snapshot.request, *id),
        })
        .collect()
}

pub fn process_rows(statuses: &[ProcessStatus]) -> Vec<ProcessRow> {
    statuses
        .iter()
        .map(|status| ProcessRow {
            id: status.id.to_string(),
            state: status.state.to_string(),
            holding: if status.holding.is_empty() {
                "-".to_string()
            } else {
                status
                    .holding
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        })
        .collect()
}

/// Print a table, or a JSON array in JSON mode.
pub fn print_table<T: Serialize + Tabled>(
    title: &str,
    rows: Vec<T>,
    format: OutputFormat,
) -> CliResult<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", title.bold());
            if rows.is_empty() {
                println!("{}", "  (none)".dimmed());
            } else {
                println!("{}", Table::new(rows));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&rows)?);
        }
    }
    Ok(())
}
