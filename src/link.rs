//! Tracking links, associating a consumer with a tracked file.

use crate::arena::Handle;
use crate::checker::Checker;
use crate::server::{RsId, VsId};
use crate::track::{FileId, TrackedFile};
use crate::MAX_WEIGHT;

use debug_ignore::DebugIgnore;
use std::fmt;

pub type LinkId = Handle<TrackingLink>;

/// Renders the consumer of a link in diagnostic dumps.
pub type DumpFn = fn(&mut dyn fmt::Write, &TrackingLink) -> fmt::Result;

/// An edge from one consumer to the tracked file it watches.
#[derive(Debug)]
pub struct TrackingLink {
    // Resolved while parsing. A link leaving its configuration block
    // without a file is destroyed, so every link in an assembled graph
    // has one.
    pub(crate) file: Option<FileId>,

    /// Weight override; 0 inherits the policy of the tracked file.
    pub weight: i64,
    pub weight_reverse: bool,

    pub rs: RsId,
    pub vs: VsId,

    // Created when the graph is assembled.
    pub(crate) checker: Option<Handle<Checker>>,

    pub label: String,
    dump: DebugIgnore<DumpFn>,

    // The contribution most recently added to the real server's weight.
    pub(crate) applied: i64,
}

impl TrackingLink {
    pub(crate) fn new(rs: RsId, vs: VsId, label: String, dump: DumpFn) -> Self {
        Self {
            file: None,
            weight: 0,
            weight_reverse: false,
            rs,
            vs,
            checker: None,
            label,
            dump: DebugIgnore(dump),
            applied: 0,
        }
    }

    pub fn file(&self) -> Option<FileId> {
        self.file
    }

    pub fn checker(&self) -> Option<Handle<Checker>> {
        self.checker
    }

    /// Copies the weight policy of the tracked file, unless overridden.
    ///
    /// Called once, when the configuration block declaring the link closes.
    pub(crate) fn inherit(&mut self, file: &TrackedFile) {
        if self.weight == 0 {
            self.weight = file.weight;
            self.weight_reverse = file.weight_reverse;
        }
    }

    /// Returns true if this link only gates the consumer up or down.
    pub fn is_gating(&self) -> bool {
        self.weight == 0
    }

    /// The weight this link adds to its real server for `status`.
    pub fn contribution(&self, status: i64) -> i64 {
        if self.is_gating() {
            return 0;
        }
        let delta = status
            .saturating_mul(self.weight)
            .clamp(-MAX_WEIGHT, MAX_WEIGHT);
        if self.weight_reverse {
            -delta
        } else {
            delta
        }
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        (self.dump.0)(out, self)
    }
}

/// Dumps a link whose consumer is a real server's checker.
pub fn dump_tracking_rs(out: &mut dyn fmt::Write, link: &TrackingLink) -> fmt::Result {
    write!(out, "     {} weight {}", link.label, link.weight)?;
    if link.weight_reverse {
        write!(out, " reverse")?;
    }
    writeln!(out)
}
