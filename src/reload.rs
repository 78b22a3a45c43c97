//! Reconciles a freshly built graph with the live one on reload.
//!
//! The new graph is built in full while the old one keeps serving. Real
//! servers present in both are matched by key, and their checkers are
//! compared position by position. Equivalent checkers carry their state
//! across, and mark their tracked file as reloaded, so that the cutover
//! does not announce again what the old graph already knew.

use crate::checker::{Checker, CheckerKind};
use crate::graph::Graph;
use crate::track::FileId;

use tracing::{event, instrument, Level};

/// What the reconciler carried over from the old graph.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Real servers found in both graphs.
    pub matched_servers: usize,
    /// Checkers found equivalent to their old counterpart.
    pub equivalent_checkers: usize,
    /// Checkers on matched servers which changed, or are new.
    pub changed_checkers: usize,
    /// Tracked files which inherited the status of an old file.
    pub carried_files: Vec<FileId>,
    /// Tracked files unknown to the old graph, which must be read afresh.
    pub fresh_files: Vec<FileId>,
}

/// Carries the runtime state of `old` into `new`, where it still applies.
///
/// Both graphs must be assembled. `old` is left untouched.
#[instrument(skip_all, name = "reload::reconcile")]
pub fn reconcile(old: &Graph, new: &mut Graph) -> Summary {
    let mut summary = Summary::default();

    // A file keeps its status when it is declared again under the same
    // name and path.
    for (id, file) in new.files.iter_mut() {
        let previous = old
            .files()
            .resolve(file.name.as_str())
            .map(|old_id| &old.files()[old_id])
            .filter(|previous| previous.path == file.path);
        match previous {
            Some(previous) => {
                file.last_status = previous.last_status;
                summary.carried_files.push(id);
            }
            None => summary.fresh_files.push(id),
        }
    }

    let matches: Vec<_> = new
        .servers()
        .filter_map(|(id, server)| {
            let service = &new.service(server.vs).key;
            old.find_server(service, &server.key)
                .map(|old_id| (id, old_id))
        })
        .collect();

    for (new_rs, old_rs) in matches {
        summary.matched_servers += 1;
        let old_checkers = old.server(old_rs).checkers();
        let new_checkers = new.server(new_rs).checkers().to_vec();

        for (position, new_id) in new_checkers.into_iter().enumerate() {
            let Some(old_checker) = old_checkers.get(position).map(|id| old.checker(*id)) else {
                summary.changed_checkers += 1;
                continue;
            };
            if !Checker::equivalent(old, old_checker, new, new.checker(new_id)) {
                event!(
                    Level::DEBUG,
                    server = %new.server_label(new_rs),
                    position,
                    "Checker changed across reload"
                );
                summary.changed_checkers += 1;
                continue;
            }

            summary.equivalent_checkers += 1;
            let checker = &mut new.checkers[new_id];
            checker.is_up = old_checker.is_up;
            checker.has_run = old_checker.has_run;
            let (CheckerKind::File(check), CheckerKind::File(old_check)) =
                (&checker.kind, &old_checker.kind)
            else {
                continue;
            };
            let file = check.file;
            new.files[file].reloaded = true;

            // The carried up/down state must agree with the status, even
            // when the file was renamed on the same path.
            if let Some(at) = summary.fresh_files.iter().position(|f| *f == file) {
                summary.fresh_files.remove(at);
                summary.carried_files.push(file);
                new.files[file].last_status = old.files()[old_check.file].last_status;
            }
        }
    }

    event!(
        Level::INFO,
        matched = summary.matched_servers,
        equivalent = summary.equivalent_checkers,
        changed = summary.changed_checkers,
        "Reconciled new configuration"
    );
    summary
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config;
    use crate::test_utils::setup_tracing_subscriber;

    const BASE: &str = r#"
track_file health {
    file /tmp/health
    weight 0
}
track_file spare {
    file /tmp/spare
    weight 0
}
virtual_server 10.0.0.1 80 {
    real_server 10.0.0.2 80 {
        FILE_CHECK {
            track_file health
            weight 5
        }
    }
    real_server 10.0.0.3 80 {
        weight 2
        FILE_CHECK {
            track_file spare
        }
    }
}
"#;

    fn load(text: &str) -> Graph {
        let (mut graph, diagnostics) = config::parse(text);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        graph.assemble();
        graph
    }

    fn file(graph: &Graph, name: &str) -> FileId {
        graph.files().resolve(name).unwrap()
    }

    #[test]
    fn unrelated_change_keeps_continuity() {
        setup_tracing_subscriber();
        let mut old = load(BASE);
        let spare = file(&old, "spare");
        old.update_status(spare, 4, false);
        let old_rs = old
            .find_server(
                &crate::test_utils::service_key(),
                &crate::server::ServerKey::new("10.0.0.3:80".parse().unwrap()),
            )
            .unwrap();
        let old_state = old.server_state(old_rs);
        assert!(!old_state.alive);

        // Only the other real server changes.
        let mut new = load(&BASE.replace("weight 5", "weight 6"));
        let summary = reconcile(&old, &mut new);
        new.cutover(true);

        let spare = file(&new, "spare");
        assert!(new.files()[spare].reloaded());
        assert_eq!(new.files()[spare].last_status(), 4);
        assert_eq!(new.files()[spare].propagations(), 0);
        let new_rs = new
            .find_server(
                &crate::test_utils::service_key(),
                &crate::server::ServerKey::new("10.0.0.3:80".parse().unwrap()),
            )
            .unwrap();
        assert_eq!(new.server_state(new_rs), old_state);

        assert!(!new.files()[file(&new, "health")].reloaded());
        assert_eq!(summary.matched_servers, 2);
        assert_eq!(summary.equivalent_checkers, 1);
        assert_eq!(summary.changed_checkers, 1);
        assert_eq!(summary.carried_files.len(), 2);
        assert!(summary.fresh_files.is_empty());
    }

    #[test]
    fn weight_change_is_detected() {
        let old = load(BASE);
        let mut new = load(&BASE.replace("weight 5", "weight 10"));
        reconcile(&old, &mut new);
        assert!(!new.files()[file(&new, "health")].reloaded());
    }

    #[test]
    fn identical_configuration_reloads_everything() {
        let old = load(BASE);
        let mut new = load(BASE);
        let summary = reconcile(&old, &mut new);
        assert!(new.files()[file(&new, "health")].reloaded());
        assert!(new.files()[file(&new, "spare")].reloaded());
        assert_eq!(summary.equivalent_checkers, 2);
        assert_eq!(summary.changed_checkers, 0);
    }

    #[test]
    fn changed_gating_check_is_forced_at_cutover() {
        // The checker stops overriding the weight, so it becomes a gate
        // on a file which is already down.
        let mut old = load(BASE);
        let health = file(&old, "health");
        old.update_status(health, 1, false);

        let mut new = load(&BASE.replace("            weight 5\n", ""));
        let health = file(&new, "health");
        reconcile(&old, &mut new);
        assert!(!new.files()[health].reloaded());
        assert_eq!(new.files()[health].last_status(), 1);

        new.cutover(true);
        assert_eq!(new.files()[health].propagations(), 1);
        let rs = new
            .find_server(
                &crate::test_utils::service_key(),
                &crate::server::ServerKey::new("10.0.0.2:80".parse().unwrap()),
            )
            .unwrap();
        assert!(!new.server_state(rs).alive);
    }

    #[test]
    fn moved_file_is_read_afresh() {
        let mut old = load(BASE);
        let health = file(&old, "health");
        old.update_status(health, 3, false);

        let mut new = load(&BASE.replace("/tmp/health", "/tmp/moved"));
        let summary = reconcile(&old, &mut new);
        let health = file(&new, "health");

        assert_eq!(new.files()[health].last_status(), 0);
        assert_eq!(summary.fresh_files, vec![health]);
        assert!(!new.files()[health].reloaded());
    }

    #[test]
    fn renamed_file_on_the_same_path_keeps_its_status() {
        let mut old = load(BASE);
        let health = file(&old, "health");
        old.update_status(health, 1, false);

        let mut new = load(&BASE.replace("track_file health", "track_file renamed"));
        let summary = reconcile(&old, &mut new);
        let renamed = file(&new, "renamed");

        assert!(new.files()[renamed].reloaded());
        assert_eq!(new.files()[renamed].last_status(), 1);
        assert!(summary.carried_files.contains(&renamed));
        assert!(!summary.fresh_files.contains(&renamed));

        new.cutover(true);
        let rs = new
            .find_server(
                &crate::test_utils::service_key(),
                &crate::server::ServerKey::new("10.0.0.2:80".parse().unwrap()),
            )
            .unwrap();
        assert_eq!(new.server_state(rs).weight, 6);

        // The file recovering is seen as a change.
        assert!(new.update_status(renamed, 0, false));
        assert_eq!(new.server_state(rs).weight, 1);
    }

    #[test]
    fn renamed_gating_file_recovers() {
        let text = BASE.replace("            weight 5\n", "");
        let mut old = load(&text);
        let health = file(&old, "health");
        old.update_status(health, 1, false);

        let mut new = load(&text.replace("track_file health", "track_file renamed"));
        reconcile(&old, &mut new);
        let renamed = file(&new, "renamed");
        new.cutover(true);

        let rs = new
            .find_server(
                &crate::test_utils::service_key(),
                &crate::server::ServerKey::new("10.0.0.2:80".parse().unwrap()),
            )
            .unwrap();
        assert!(!new.server_state(rs).alive);
        assert!(new.update_status(renamed, 0, false));
        assert!(new.server_state(rs).alive);
    }

    #[test]
    fn old_graph_is_untouched() {
        let old = load(BASE);
        let mut new = load(BASE);
        reconcile(&old, &mut new);
        for (_, file) in old.files().iter() {
            assert!(!file.reloaded());
        }
    }
}
