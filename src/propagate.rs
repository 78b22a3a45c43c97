//! Pushes tracked file status to every tracker of the file.
//!
//! A gating tracker (effective weight 0) turns its checker down while the
//! status is non-zero. A weighted tracker adds `status * weight` (negated
//! when reversed) to its real server's weight. Each link remembers the
//! contribution it applied, and only the difference is ever added, so the
//! result does not depend on the order trackers are visited in.

use crate::checker::CheckerId;
use crate::graph::Graph;
use crate::link::LinkId;
#[cfg(feature = "probes")]
use crate::probes;
use crate::track::FileId;

use tracing::{event, instrument, Level};

impl Graph {
    /// Records a new status for a tracked file, and recomputes its trackers.
    ///
    /// An update carrying the status already known is dropped, unless
    /// `force` is set. Returns true if the trackers were visited.
    #[instrument(level = "debug", skip(self), name = "Graph::update_status")]
    pub fn update_status(&mut self, file: FileId, status: i64, force: bool) -> bool {
        let Some(tracked) = self.files.get_mut(file) else {
            event!(Level::DEBUG, "Update for unknown tracked file dropped");
            return false;
        };
        if tracked.last_status == status && !force {
            #[cfg(feature = "probes")]
            probes::status__unchanged!(|| (tracked.name.as_str(), status));
            return false;
        }

        event!(
            Level::INFO,
            file = %tracked.name,
            old = tracked.last_status,
            new = status,
            force,
            "Tracked file status changed"
        );
        #[cfg(feature = "probes")]
        probes::status__update!(|| (tracked.name.as_str(), status, u64::from(force)));

        tracked.last_status = status;
        tracked.propagations += 1;
        for link in tracked.trackers.clone() {
            self.propagate_link(link, status);
        }
        true
    }

    fn propagate_link(&mut self, link: LinkId, status: i64) {
        let Some(tracking) = self.links.get(link) else {
            return;
        };
        if tracking.is_gating() {
            if let Some(checker) = tracking.checker {
                self.set_checker_up(checker, status == 0);
            }
        } else {
            let contribution = tracking.contribution(status);
            self.apply_contribution(link, contribution);
        }
    }

    // Moves the real server's weight by the difference between the new
    // contribution of a link and the one it last applied.
    fn apply_contribution(&mut self, link: LinkId, contribution: i64) {
        let tracking = &mut self.links[link];
        let delta = contribution - tracking.applied;
        if delta == 0 {
            return;
        }
        tracking.applied = contribution;
        let rs = tracking.rs;

        let server = self.server_mut(rs);
        let old = server.effective_weight();
        server.track_weight += delta;
        let new = server.effective_weight();

        if old != new {
            let label = self.server_label(rs);
            event!(Level::INFO, server = %label, old, new, "Changing weight");
            #[cfg(feature = "probes")]
            probes::weight__change!(|| (label.as_str(), old, new));
        }
    }

    /// Sets the up/down flag of a checker.
    ///
    /// Returns true if the flag changed.
    pub fn set_checker_up(&mut self, id: CheckerId, up: bool) -> bool {
        let Some(checker) = self.checkers.get_mut(id) else {
            return false;
        };
        checker.has_run = true;
        if checker.is_up == up {
            return false;
        }
        let rs = checker.rs;
        let was_alive = self.server_state(rs).alive;
        self.checkers[id].is_up = up;
        let alive = self.server_state(rs).alive;

        let label = self.server_label(rs);
        if up {
            event!(Level::INFO, server = %label, checker = ?id, "Checker is UP");
            #[cfg(feature = "probes")]
            probes::checker__up!(|| (label.as_str(), id.as_u64()));
        } else {
            event!(Level::INFO, server = %label, checker = ?id, "Checker is DOWN");
            #[cfg(feature = "probes")]
            probes::checker__down!(|| (label.as_str(), id.as_u64()));
        }
        match (was_alive, alive) {
            (false, true) => event!(Level::INFO, server = %label, "Adding real server"),
            (true, false) => event!(Level::INFO, server = %label, "Removing real server"),
            _ => (),
        }
        true
    }

    /// Applies the known status of every tracked file once a graph goes live.
    ///
    /// Weighted trackers get their contribution. Gating trackers of a file
    /// with a non-zero status are marked down directly, except on reload
    /// when no checker of the file was carried over unchanged: the status
    /// is then forced through the trackers, as if it were new.
    #[instrument(skip(self), name = "Graph::cutover")]
    pub fn cutover(&mut self, reload: bool) {
        let down: Vec<(FileId, i64, bool)> = self
            .files
            .iter()
            .filter(|(_, file)| file.last_status != 0)
            .map(|(id, file)| (id, file.last_status, file.reloaded))
            .collect();

        for (file, status, reloaded) in down {
            let mut forced = false;
            for link in self.files[file].trackers.clone() {
                let Some(tracking) = self.links.get(link) else {
                    continue;
                };
                if !tracking.is_gating() {
                    let contribution = tracking.contribution(status);
                    self.apply_contribution(link, contribution);
                } else if reload && !reloaded {
                    // One forced update recomputes every tracker of the file.
                    if !forced {
                        forced = true;
                        self.update_status(file, status, true);
                    }
                } else if let Some(checker) = tracking.checker {
                    self.set_checker_up(checker, false);
                }
            }
        }
    }
}
