//! Checkers decide whether a real server is usable.
//!
//! The set of checker variants is closed: file checkers follow a tracked
//! file through a [TrackingLink](crate::link::TrackingLink), and probe
//! checkers stand in for protocol probes run by an external scheduler.

use crate::arena::Handle;
use crate::graph::Graph;
use crate::link::LinkId;
use crate::server::{RsId, VsId};
use crate::track::FileId;

use std::fmt;

pub type CheckerId = Handle<Checker>;

/// The protocol probes which may be attached to a real server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ProbeKind {
    Tcp,
    Http,
    Ssl,
    Dns,
    Smtp,
    Misc,
}

impl ProbeKind {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "TCP_CHECK" => Some(ProbeKind::Tcp),
            "HTTP_GET" => Some(ProbeKind::Http),
            "SSL_GET" => Some(ProbeKind::Ssl),
            "DNS_CHECK" => Some(ProbeKind::Dns),
            "SMTP_CHECK" => Some(ProbeKind::Smtp),
            "MISC_CHECK" => Some(ProbeKind::Misc),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            ProbeKind::Tcp => "TCP_CHECK",
            ProbeKind::Http => "HTTP_GET",
            ProbeKind::Ssl => "SSL_GET",
            ProbeKind::Dns => "DNS_CHECK",
            ProbeKind::Smtp => "SMTP_CHECK",
            ProbeKind::Misc => "MISC_CHECK",
        }
    }
}

/// A protocol probe, as configured.
///
/// The directives are kept verbatim for the scheduler which runs the
/// probe, and to compare the probe across reloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeCheck {
    pub kind: ProbeKind,
    pub directives: Vec<Vec<String>>,
}

impl ProbeCheck {
    pub fn new(kind: ProbeKind) -> Self {
        Self {
            kind,
            directives: Vec::new(),
        }
    }
}

/// A checker following a tracked file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileCheck {
    pub file: FileId,
    pub link: LinkId,
}

#[derive(Clone, Debug)]
pub enum CheckerKind {
    File(FileCheck),
    Probe(ProbeCheck),
}

#[derive(Debug)]
pub struct Checker {
    pub kind: CheckerKind,
    pub rs: RsId,
    pub vs: VsId,
    pub(crate) is_up: bool,
    pub(crate) has_run: bool,
}

impl Checker {
    // There is no concept of a file check running: linking the file is
    // the only check, so it has run from the moment it exists.
    pub(crate) fn file(check: FileCheck, rs: RsId, vs: VsId) -> Self {
        Self {
            kind: CheckerKind::File(check),
            rs,
            vs,
            is_up: true,
            has_run: true,
        }
    }

    pub(crate) fn probe(check: ProbeCheck, rs: RsId, vs: VsId) -> Self {
        Self {
            kind: CheckerKind::Probe(check),
            rs,
            vs,
            is_up: true,
            has_run: false,
        }
    }

    pub fn is_up(&self) -> bool {
        self.is_up
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Returns the probe to hand to the scheduler, if this checker needs
    /// one running.
    pub fn launch(&self) -> Option<&ProbeCheck> {
        match &self.kind {
            CheckerKind::File(_) => None,
            CheckerKind::Probe(probe) => Some(probe),
        }
    }

    /// Writes a stable, human-readable description of the checker.
    pub fn describe(&self, graph: &Graph, out: &mut dyn fmt::Write) -> fmt::Result {
        match &self.kind {
            CheckerKind::File(check) => {
                let file = &graph.files()[check.file];
                writeln!(out, "   Keepalive method = FILE_CHECK")?;
                writeln!(out, "     Tracked file = {}", file.path.display())?;
                writeln!(
                    out,
                    "     Reloaded = {}",
                    if file.reloaded { "Yes" } else { "No" }
                )
            }
            CheckerKind::Probe(probe) => {
                writeln!(out, "   Keepalive method = {}", probe.kind.keyword())?;
                for directive in &probe.directives {
                    writeln!(out, "     {}", directive.join(" "))?;
                }
                Ok(())
            }
        }
    }

    /// Decides whether `new` continues the work of `old` across a reload.
    ///
    /// File checkers are equivalent when they follow the same path with the
    /// same effective weight policy. Probe checkers are equivalent when
    /// configured identically. Checkers of different kinds never are.
    pub fn equivalent(old_graph: &Graph, old: &Checker, new_graph: &Graph, new: &Checker) -> bool {
        match (&old.kind, &new.kind) {
            (CheckerKind::File(old_check), CheckerKind::File(new_check)) => {
                let old_file = &old_graph.files()[old_check.file];
                let new_file = &new_graph.files()[new_check.file];
                let old_link = old_graph.link(old_check.link);
                let new_link = new_graph.link(new_check.link);

                old_file.path == new_file.path
                    && old_link.weight == new_link.weight
                    && old_link.weight_reverse == new_link.weight_reverse
            }
            (CheckerKind::Probe(old_probe), CheckerKind::Probe(new_probe)) => old_probe == new_probe,
            _ => false,
        }
    }
}
