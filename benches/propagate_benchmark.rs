use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lbcheck::config;
use lbcheck::graph::Graph;
use lbcheck::track::FileId;
use std::fmt::Write;

// One tracked file followed by every real server of one virtual server,
// alternating gating and weighted trackers.
fn fan_out(servers: usize) -> (Graph, FileId) {
    let mut text = String::from("track_file health {\n    file /run/health\n    weight 0\n}\n");
    text.push_str("virtual_server 10.0.0.1 80 {\n");
    for i in 0..servers {
        let weight = if i % 2 == 0 { 0 } else { 3 };
        write!(
            text,
            "    real_server 10.1.{}.{} 80 {{\n        FILE_CHECK {{\n            track_file health\n            weight {weight}\n        }}\n    }}\n",
            i / 250,
            i % 250 + 1,
        )
        .unwrap();
    }
    text.push_str("}\n");

    let (mut graph, diagnostics) = config::parse(&text);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    graph.assemble();
    let file = graph.files().resolve("health").unwrap();
    (graph, file)
}

fn criterion_benchmark(c: &mut Criterion) {
    for servers in [10, 100, 1000] {
        let (mut graph, file) = fan_out(servers);
        let mut status = 0;
        c.bench_function(&format!("propagate to {servers} trackers"), |b| {
            b.iter(|| {
                status = (status + 1) % 2;
                graph.update_status(file, black_box(status), false)
            })
        });
    }

    c.bench_function("parse and assemble 1000 servers", |b| {
        b.iter(|| fan_out(black_box(1000)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
