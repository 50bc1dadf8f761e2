//! Interactive line commands
//!
//! ```text
//! resource <id> <name> <instances>
//! redefine <id> <name> <instances>
//! process <id> <request> <usage> [sequential|overlapping]
//! stop <process-id>
//! detector <period> | detector off
//! status | sweep | help | quit
//! ```
//!
//! Durations accept `ms` or `s` suffixes; a bare number is seconds.

use crate::error::{CliError, CliResult};
use dlsim_types::{AcquisitionMode, ProcessId};
use std::time::Duration;

/// A parsed line command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddResource {
        id: i64,
        name: String,
        instances: i64,
    },
    RedefineResource {
        id: i64,
        name: String,
        instances: i64,
    },
    CreateProcess {
        id: i64,
        request_interval: Duration,
        usage_interval: Duration,
        mode: AcquisitionMode,
    },
    StopProcess(ProcessId),
    StartDetector(Duration),
    StopDetector,
    Status,
    Sweep,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  resource <id> <name> <instances>              register a resource type
  redefine <id> <name> <instances>              overwrite a resource type
  process <id> <request> <usage> [mode]         start a process (mode: sequential|overlapping)
  stop <id>                                     stop a process
  detector <period> | detector off              start, restart or stop the detector
  status                                        print resources, processes and the ledger
  sweep                                         run a deadlock sweep now
  quit                                          shut down";

impl Command {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> CliResult<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match verb.to_lowercase().as_str() {
            "resource" | "res" => {
                let (id, name, instances) = resource_args(verb, &args)?;
                Command::AddResource {
                    id,
                    name,
                    instances,
                }
            }
            "redefine" => {
                let (id, name, instances) = resource_args(verb, &args)?;
                Command::RedefineResource {
                    id,
                    name,
                    instances,
                }
            }
            "process" | "proc" => {
                if args.len() < 3 || args.len() > 4 {
                    return Err(usage("process <id> <request> <usage> [mode]"));
                }
                Command::CreateProcess {
                    id: integer("process id", args[0])?,
                    request_interval: duration(args[1])?,
                    usage_interval: duration(args[2])?,
                    mode: match args.get(3) {
                        Some(mode) => acquisition_mode(mode)?,
                        None => AcquisitionMode::Sequential,
                    },
                }
            }
            "stop" | "kill" => {
                let [id] = args.as_slice() else {
                    return Err(usage("stop <id>"));
                };
                let id = integer("process id", id)?;
                let id = u32::try_from(id)
                    .map_err(|_| CliError::parse(format!("invalid process id {}", id)))?;
                Command::StopProcess(ProcessId::new(id))
            }
            "detector" => match args.as_slice() {
                ["off"] | ["stop"] => Command::StopDetector,
                [period] => Command::StartDetector(duration(period)?),
                _ => return Err(usage("detector <period> | detector off")),
            },
            "status" | "ls" => Command::Status,
            "sweep" => Command::Sweep,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => {
                return Err(CliError::parse(format!(
                    "unknown command '{}' (try 'help')",
                    other
                )))
            }
        };

        Ok(Some(command))
    }
}

fn usage(form: &str) -> CliError {
    CliError::parse(format!("usage: {}", form))
}

fn resource_args(verb: &str, args: &[&str]) -> CliResult<(i64, String, i64)> {
    if args.len() < 3 {
        return Err(usage(&format!("{} <id> <name> <instances>", verb)));
    }
    // Names may contain spaces; the instance count is always last
    let last = args.len() - 1;
    let id = integer("resource id", args[0])?;
    let name = args[1..last].join(" ");
    let instances = integer("instance count", args[last])?;
    Ok((id, name, instances))
}

fn integer(what: &str, raw: &str) -> CliResult<i64> {
    raw.parse()
        .map_err(|_| CliError::parse(format!("invalid {}: '{}'", what, raw)))
}

/// Parse `250ms`, `2s` or a bare number of seconds.
pub fn duration(raw: &str) -> CliResult<Duration> {
    let invalid = || CliError::parse(format!("invalid duration: '{}'", raw));

    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.parse().map(Duration::from_millis).map_err(|_| invalid());
    }
    let secs = raw.strip_suffix('s').unwrap_or(raw);
    let secs: f64 = secs.parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

fn acquisition_mode(raw: &str) -> CliResult<AcquisitionMode> {
    match raw.to_lowercase().as_str() {
        "sequential" | "seq" => Ok(AcquisitionMode::Sequential),
        "overlapping" | "overlap" => Ok(AcquisitionMode::Overlapping),
        other => Err(CliError::parse(format!(
            "unknown mode '{}': expected sequential or overlapping",
            other
        ))),
    }
}
