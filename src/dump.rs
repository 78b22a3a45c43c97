//! Point-in-time snapshots of a [Graph], for diagnostics.
//!
//! A [Snapshot] renders as the text dump written on request by the
//! daemon. With the `"serde"` feature, it also serializes.

use crate::graph::Graph;
use crate::server::{ServerKey, ServerState, ServiceKey};
use crate::track::Name;

use std::fmt::{self, Write};
use std::path::PathBuf;

/// A tracked file, and the consumers following it.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileSnapshot {
    pub name: Name,
    pub path: PathBuf,
    pub weight: i64,
    pub weight_reverse: bool,
    pub status: i64,
    pub reloaded: bool,
    /// One rendered line per tracker, in registration order.
    pub trackers: Vec<String>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CheckerSnapshot {
    pub up: bool,
    pub has_run: bool,
    pub description: String,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ServerSnapshot {
    pub key: ServerKey,
    /// The configured weight.
    pub weight: i64,
    pub state: ServerState,
    pub checkers: Vec<CheckerSnapshot>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ServiceSnapshot {
    pub key: ServiceKey,
    pub servers: Vec<ServerSnapshot>,
}

/// The whole graph, at a single point-in-time.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Snapshot {
    pub files: Vec<FileSnapshot>,
    pub services: Vec<ServiceSnapshot>,
}

impl Snapshot {
    pub fn capture(graph: &Graph) -> Self {
        let files = graph
            .files()
            .iter()
            .map(|(_, file)| FileSnapshot {
                name: file.name.clone(),
                path: file.path.clone(),
                weight: file.weight,
                weight_reverse: file.weight_reverse,
                status: file.last_status(),
                reloaded: file.reloaded(),
                trackers: file
                    .trackers()
                    .iter()
                    .map(|link| render(|out| graph.link(*link).dump(out)))
                    .collect(),
            })
            .collect();

        let services = graph
            .services()
            .map(|(_, vs)| ServiceSnapshot {
                key: vs.key.clone(),
                servers: vs
                    .real_servers()
                    .iter()
                    .map(|rs| {
                        let server = graph.server(*rs);
                        ServerSnapshot {
                            key: server.key,
                            weight: server.weight,
                            state: graph.server_state(*rs),
                            checkers: server
                                .checkers()
                                .iter()
                                .map(|id| {
                                    let checker = graph.checker(*id);
                                    CheckerSnapshot {
                                        up: checker.is_up(),
                                        has_run: checker.has_run(),
                                        description: render(|out| checker.describe(graph, out)),
                                    }
                                })
                                .collect(),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self { files, services }
    }
}

// Writing into a String only fails if a Display impl does.
fn render(write: impl FnOnce(&mut dyn Write) -> fmt::Result) -> String {
    let mut out = String::new();
    let _ = write(&mut out);
    out
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------< Tracked files >------")?;
        for file in &self.files {
            writeln!(f, " Track file = {}", file.name)?;
            writeln!(f, "   File = {}", file.path.display())?;
            writeln!(f, "   Status = {}", file.status)?;
            write!(f, "   Weight = {}", file.weight)?;
            if file.weight_reverse {
                write!(f, " reverse")?;
            }
            writeln!(f)?;
            if file.trackers.is_empty() {
                writeln!(f, "   Tracked by: none")?;
            } else {
                writeln!(f, "   Tracked by:")?;
                for tracker in &file.trackers {
                    f.write_str(tracker)?;
                }
            }
        }

        writeln!(f, "------< Virtual servers >------")?;
        for service in &self.services {
            writeln!(f, " VS = {}", service.key)?;
            for server in &service.servers {
                writeln!(f, "  RS = {}", server.key)?;
                writeln!(
                    f,
                    "   Weight = {} (effective {})",
                    server.weight, server.state.weight
                )?;
                writeln!(f, "   Alive = {}", yes_no(server.state.alive))?;
                for checker in &server.checkers {
                    f.write_str(&checker.description)?;
                    writeln!(
                        f,
                        "     Up = {}, has run = {}",
                        yes_no(checker.up),
                        yes_no(checker.has_run)
                    )?;
                }
            }
        }
        Ok(())
    }
}
