//! Utilities to help with testing lbcheck

use crate::graph::Graph;
use crate::server::{Protocol, RsId, ServerKey, ServiceKey};

/// The service used by [graph_with_server].
pub fn service_key() -> ServiceKey {
    ServiceKey::Address {
        address: "10.0.0.1:80".parse().unwrap(),
        protocol: Protocol::Tcp,
    }
}

/// Creates a graph with one virtual server, holding one real server.
pub fn graph_with_server() -> (Graph, RsId) {
    let mut graph = Graph::new();
    let vs = graph.add_service(service_key());
    let rs = graph.add_server(vs, ServerKey::new("10.0.0.2:80".parse().unwrap()));
    (graph, rs)
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
