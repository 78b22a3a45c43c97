//! The check graph: services, servers, checkers, links and tracked files.
//!
//! Every node lives in an [Arena] owned by the [Graph], and refers to its
//! neighbours by handle. Destroying a node removes it from every list
//! which references it, so no handle reachable from the graph dangles.

use crate::arena::Arena;
use crate::checker::{Checker, CheckerId, CheckerKind, FileCheck, ProbeCheck};
use crate::link::{self, LinkId, TrackingLink};
use crate::server::{RealServer, RsId, ServerKey, ServerState, ServiceKey, VirtualServer, VsId};
use crate::track::{FileId, Registry};

use std::collections::BTreeMap;
use tracing::{event, instrument, Level};

/// The state of every real server, keyed by service and server.
pub type ServerStates = BTreeMap<(ServiceKey, ServerKey), ServerState>;

#[derive(Debug, Default)]
pub struct Graph {
    services: Arena<VirtualServer>,
    servers: Arena<RealServer>,
    pub(crate) checkers: Arena<Checker>,
    pub(crate) links: Arena<TrackingLink>,
    pub(crate) files: Registry,

    // Materializing file checkers is only valid once per graph.
    assembled: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &Registry {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut Registry {
        &mut self.files
    }

    pub fn services(&self) -> impl Iterator<Item = (VsId, &VirtualServer)> {
        self.services.iter()
    }

    pub fn service(&self, id: VsId) -> &VirtualServer {
        &self.services[id]
    }

    pub(crate) fn service_mut(&mut self, id: VsId) -> &mut VirtualServer {
        &mut self.services[id]
    }

    pub fn servers(&self) -> impl Iterator<Item = (RsId, &RealServer)> {
        self.servers.iter()
    }

    pub fn server(&self, id: RsId) -> &RealServer {
        &self.servers[id]
    }

    pub fn server_mut(&mut self, id: RsId) -> &mut RealServer {
        &mut self.servers[id]
    }

    pub fn checker(&self, id: CheckerId) -> &Checker {
        &self.checkers[id]
    }

    pub fn link(&self, id: LinkId) -> &TrackingLink {
        &self.links[id]
    }

    pub fn link_mut(&mut self, id: LinkId) -> &mut TrackingLink {
        &mut self.links[id]
    }

    pub fn contains_link(&self, id: LinkId) -> bool {
        self.links.contains(id)
    }

    pub fn contains_checker(&self, id: CheckerId) -> bool {
        self.checkers.contains(id)
    }

    pub fn add_service(&mut self, key: ServiceKey) -> VsId {
        self.services.insert(VirtualServer::new(key))
    }

    pub fn find_service(&self, key: &ServiceKey) -> Option<VsId> {
        self.services
            .iter()
            .find(|(_, vs)| &vs.key == key)
            .map(|(id, _)| id)
    }

    pub fn add_server(&mut self, vs: VsId, key: ServerKey) -> RsId {
        let rs = self.servers.insert(RealServer::new(key, vs));
        self.services[vs].real_servers.push(rs);
        rs
    }

    /// Finds a real server by the keys which identify it across reloads.
    pub fn find_server(&self, service: &ServiceKey, server: &ServerKey) -> Option<RsId> {
        let vs = self.find_service(service)?;
        self.services[vs]
            .real_servers
            .iter()
            .copied()
            .find(|rs| &self.servers[*rs].key == server)
    }

    /// Renders a real server along with its virtual server, for logs.
    pub fn server_label(&self, rs: RsId) -> String {
        let server = &self.servers[rs];
        format!("{} for VS {}", server.key, self.services[server.vs].key)
    }

    /// Creates an unresolved tracking link owned by a real server.
    pub fn add_link(&mut self, rs: RsId) -> LinkId {
        let vs = self.servers[rs].vs;
        let label = self.server_label(rs);
        let link = self
            .links
            .insert(TrackingLink::new(rs, vs, label, link::dump_tracking_rs));
        self.servers[rs].links.push(link);
        link
    }

    pub fn set_link_file(&mut self, link: LinkId, file: FileId) {
        self.links[link].file = Some(file);
    }

    /// Gives a link the weight policy of its tracked file, unless it
    /// overrides it.
    pub(crate) fn inherit_link_policy(&mut self, link: LinkId) {
        if let Some(file) = self.links[link].file {
            self.links[link].inherit(&self.files[file]);
        }
    }

    /// Destroys a link, detaching it from its server and tracked file.
    ///
    /// A checker materialized from the link is destroyed with it.
    #[instrument(level = "debug", skip(self), name = "Graph::remove_link")]
    pub fn remove_link(&mut self, id: LinkId) {
        let Some(link) = self.links.remove(id) else {
            return;
        };
        if let Some(server) = self.servers.get_mut(link.rs) {
            server.links.retain(|l| *l != id);
            server.track_weight -= link.applied;
        }
        if let Some(file) = link.file.and_then(|file| self.files.get_mut(file)) {
            file.trackers.retain(|l| *l != id);
        }
        if let Some(checker) = link.checker {
            self.remove_checker(checker);
        }
    }

    /// Attaches a protocol probe to a real server.
    pub fn add_probe(&mut self, rs: RsId, probe: ProbeCheck) -> CheckerId {
        let vs = self.servers[rs].vs;
        let checker = self.checkers.insert(Checker::probe(probe, rs, vs));
        self.servers[rs].checkers.push(checker);
        checker
    }

    pub(crate) fn probe_mut(&mut self, id: CheckerId) -> Option<&mut ProbeCheck> {
        match &mut self.checkers.get_mut(id)?.kind {
            CheckerKind::Probe(probe) => Some(probe),
            CheckerKind::File(_) => None,
        }
    }

    /// Destroys a checker, detaching it from its server.
    ///
    /// Destroying a file checker also destroys its tracking link.
    pub fn remove_checker(&mut self, id: CheckerId) {
        let Some(checker) = self.checkers.remove(id) else {
            return;
        };
        if let Some(server) = self.servers.get_mut(checker.rs) {
            server.checkers.retain(|c| *c != id);
        }
        if let CheckerKind::File(FileCheck { link, .. }) = checker.kind {
            self.remove_link(link);
        }
    }

    /// Materializes one file checker per resolved tracking link.
    ///
    /// Each checker is appended to its server's checkers, and its link to
    /// the tracked file's trackers. This is only valid once per graph:
    /// later calls are ignored.
    #[instrument(skip(self), name = "Graph::assemble")]
    pub fn assemble(&mut self) {
        if self.assembled {
            event!(Level::WARN, "Graph already assembled, ignoring");
            return;
        }
        self.assembled = true;

        let vs_ids: Vec<VsId> = self.services.iter().map(|(id, _)| id).collect();
        for vs in vs_ids {
            for rs in self.services[vs].real_servers.clone() {
                for link in self.servers[rs].links.clone() {
                    let Some(file) = self.links[link].file else {
                        // Unresolved links are destroyed when their
                        // configuration block closes.
                        event!(Level::WARN, ?link, "Skipping link without tracked file");
                        continue;
                    };
                    let checker = self
                        .checkers
                        .insert(Checker::file(FileCheck { file, link }, rs, vs));
                    self.servers[rs].checkers.push(checker);
                    self.links[link].checker = Some(checker);
                    self.files[file].trackers.push(link);
                }
            }
        }
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    /// A real server is alive when every one of its checkers is up.
    pub fn server_state(&self, rs: RsId) -> ServerState {
        let server = &self.servers[rs];
        ServerState {
            weight: server.effective_weight(),
            alive: server
                .checkers
                .iter()
                .all(|checker| self.checkers[*checker].is_up),
        }
    }

    pub fn server_states(&self) -> ServerStates {
        self.servers
            .iter()
            .map(|(id, server)| {
                (
                    (self.services[server.vs].key.clone(), server.key),
                    self.server_state(id),
                )
            })
            .collect()
    }

    /// Lists the probes an external scheduler should be running.
    pub fn probes(&self) -> Vec<(ServiceKey, ServerKey, usize, &ProbeCheck)> {
        let mut probes = vec![];
        for (_, server) in self.servers.iter() {
            for (index, checker) in server.checkers.iter().enumerate() {
                if let Some(probe) = self.checkers[*checker].launch() {
                    probes.push((
                        self.services[server.vs].key.clone(),
                        server.key,
                        index,
                        probe,
                    ));
                }
            }
        }
        probes
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checker::ProbeKind;
    use crate::test_utils::{graph_with_server, service_key};

    #[test]
    fn assemble_links_checkers_and_trackers() {
        let (mut graph, rs) = graph_with_server();
        let file = graph.files_mut().register("health", "/tmp/health").unwrap();
        let a = graph.add_link(rs);
        let b = graph.add_link(rs);
        graph.set_link_file(a, file);
        graph.set_link_file(b, file);

        graph.assemble();

        assert_eq!(graph.server(rs).checkers().len(), 2);
        assert_eq!(graph.files()[file].trackers(), &[a, b]);
        let checker = graph.link(a).checker().unwrap();
        assert!(graph.checker(checker).has_run());
        assert!(graph.checker(checker).is_up());
        assert_eq!(graph.checker(checker).rs, rs);
    }

    #[test]
    fn assemble_runs_only_once() {
        let (mut graph, rs) = graph_with_server();
        let file = graph.files_mut().register("health", "/tmp/health").unwrap();
        let link = graph.add_link(rs);
        graph.set_link_file(link, file);

        graph.assemble();
        graph.assemble();

        assert_eq!(graph.server(rs).checkers().len(), 1);
        assert_eq!(graph.files()[file].trackers().len(), 1);
    }

    #[test]
    fn removing_a_link_unlinks_everywhere() {
        let (mut graph, rs) = graph_with_server();
        let file = graph.files_mut().register("health", "/tmp/health").unwrap();
        let keep = graph.add_link(rs);
        let gone = graph.add_link(rs);
        graph.set_link_file(keep, file);
        graph.set_link_file(gone, file);
        graph.assemble();
        let checker = graph.link(gone).checker().unwrap();

        graph.remove_link(gone);

        assert!(!graph.contains_link(gone));
        assert!(!graph.contains_checker(checker));
        assert_eq!(graph.server(rs).links(), &[keep]);
        assert_eq!(graph.server(rs).checkers().len(), 1);
        assert_eq!(graph.files()[file].trackers(), &[keep]);
    }

    #[test]
    fn removing_a_file_checker_removes_its_link() {
        let (mut graph, rs) = graph_with_server();
        let file = graph.files_mut().register("health", "/tmp/health").unwrap();
        let link = graph.add_link(rs);
        graph.set_link_file(link, file);
        graph.assemble();
        let checker = graph.link(link).checker().unwrap();

        graph.remove_checker(checker);

        assert!(!graph.contains_link(link));
        assert!(graph.server(rs).links().is_empty());
        assert!(graph.server(rs).checkers().is_empty());
        assert!(graph.files()[file].trackers().is_empty());
    }

    #[test]
    fn servers_are_found_by_key() {
        let (mut graph, rs) = graph_with_server();
        let key = graph.server(rs).key;
        assert_eq!(graph.find_server(&service_key(), &key), Some(rs));

        let other = ServerKey::new("10.0.0.9:80".parse().unwrap());
        assert_eq!(graph.find_server(&service_key(), &other), None);
        assert_eq!(graph.find_server(&ServiceKey::Fwmark(3), &key), None);

        let vs = graph.find_service(&service_key()).unwrap();
        let second = graph.add_server(vs, other);
        assert_eq!(graph.find_server(&service_key(), &other), Some(second));
    }

    #[test]
    fn states_and_probes() {
        let (mut graph, rs) = graph_with_server();
        graph.server_mut(rs).weight = 7;
        graph.add_probe(rs, ProbeCheck::new(ProbeKind::Tcp));

        let states = graph.server_states();
        let state = states
            .get(&(service_key(), graph.server(rs).key))
            .unwrap();
        assert_eq!(*state, ServerState { weight: 7, alive: true });

        let probes = graph.probes();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].2, 0);
        assert_eq!(probes[0].3.kind, ProbeKind::Tcp);
    }
}
