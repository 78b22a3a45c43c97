//! lbcheck decides the health and weight of load-balanced backends.
//!
//! lbcheck is the reconciliation core of a failover daemon. It uses the
//! following terminology:
//! * Virtual servers are load-balanced services presented to clients.
//! * Real servers are the backends behind a virtual server.
//! * Checkers are units which decide whether a real server is usable,
//!   and with what weight.
//! * Tracked files are external signal sources whose numeric content
//!   encodes a status. One tracked file may be watched by many checkers,
//!   each applying its own weight policy through a tracking link.
//!
//! # Usage
//!
//! * The main interface for this crate is [checks::Checks], which owns the
//!   live check graph on a single control task.
//! * Configuration is read by [config::parse], producing a [graph::Graph].
//! * On reload, [reload::reconcile] diffs the new graph against the live
//!   one so that unchanged checks carry their state across the cutover.
//! * Real server state is published on a `tokio::sync::watch` channel,
//!   available from [checks::Checks::monitor].
//!
//! # DTrace probes
//!
//! lbcheck contains a number of DTrace USDT probes, which fire as tracked
//! file status changes flow through the graph. The full list of probes is:
//!
//! - `status-update`: Fires when a tracked file takes a new status and its
//!   trackers are recomputed.
//! - `status-unchanged`: Fires when an update carries the status already
//!   known, and is dropped.
//! - `checker-up`: Fires when a checker transitions to up.
//! - `checker-down`: Fires when a checker transitions to down.
//! - `weight-change`: Fires when the aggregate weight of a real server
//!   changes.
//! - `reload-start`: Fires before a new configuration is reconciled.
//! - `reload-done`: Fires after the new graph has replaced the old one.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly
//! enabled, by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registration of the probes is fallible, so [checks::Checks::new] returns
//! a [checks::RegistrationError] which still gives access to the running
//! checks, in the same way as `std::sync::PoisonError`.

// Public API
pub mod arena;
pub mod checker;
pub mod checks;
pub mod config;
pub mod dump;
pub mod graph;
pub mod link;
pub mod policy;
pub mod reload;
pub mod server;
pub mod track;

// Necessary for implementation
mod join;
mod propagate;
#[cfg(test)]
mod test_utils;

/// The largest weight magnitude accepted for a real server or a link.
///
/// This matches the maximum weight of the kernel load-balancing table.
pub const MAX_WEIGHT: i64 = 65535;

/// USDT probes for tracing how status changes move through the graph.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "lbcheck")]
mod probes {
    /// Fires when a tracked file takes a new status (or is forced to
    /// recompute), before its trackers are visited.
    fn status__update(file: &str, status: i64, forced: u64) {}

    /// Fires when an update repeats the known status of a tracked file.
    fn status__unchanged(file: &str, status: i64) {}

    /// Fires when a checker transitions to up.
    fn checker__up(server: &str, checker: u64) {}

    /// Fires when a checker transitions to down.
    fn checker__down(server: &str, checker: u64) {}

    /// Fires when the aggregate weight of a real server changes.
    fn weight__change(server: &str, old: i64, new: i64) {}

    /// Fires before a freshly parsed graph is reconciled with the live one.
    fn reload__start(generation: u64) {}

    /// Fires once the reconciled graph has replaced the live one.
    fn reload__done(generation: u64, equivalent: u64, changed: u64) {}
}
