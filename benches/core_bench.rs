//! Benchmarks for webtier core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use webtier::core::datasource::{self, StaticBackend};
use webtier::core::graph::build_graph;
use webtier::core::types::{AttrValue, ObservedState, Reference, ResourceKind, ResourceNode};
use webtier::core::{parser, planner, stack, template};
use webtier::journal::hasher;

const STACK: &str = r#"
version: "1.0"
name: bench-stack
web_tier:
  cluster_name: bench
  server_port: 8080
  min_size: 2
  max_size: 10
  db_remote_state:
    bucket: bench-state
    key: db.tfstate
  health_check:
    drain_timeout_secs: 30
"#;

fn backend(config: &stack::WebTierConfig) -> StaticBackend {
    let mut backend = StaticBackend::with_default_network("vpc-1", &["subnet-a", "subnet-b"]);
    backend.publish_outputs(
        &config.db_remote_state,
        IndexMap::from([
            ("address".to_string(), AttrValue::from("10.0.0.5")),
            ("port".to_string(), AttrValue::Int(5432)),
        ]),
    );
    backend
}

fn bench_hash_attributes(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_attributes");
    for n in [4, 16, 64] {
        let attributes: IndexMap<String, AttrValue> = (0..n)
            .map(|i| {
                (
                    format!("attr_{i:03}"),
                    AttrValue::list([format!("value-{i}"), "x".repeat(32)]),
                )
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &attributes, |b, attributes| {
            b.iter(|| black_box(hasher::hash_attributes(black_box(attributes))));
        });
    }
    group.finish();
}

fn bench_template_render(c: &mut Criterion) {
    let vars = IndexMap::from([
        ("server_port".to_string(), AttrValue::Int(8080)),
        ("db_address".to_string(), AttrValue::from("10.0.0.5")),
        ("db_port".to_string(), AttrValue::Int(5432)),
    ]);
    c.bench_function("template_render_user_data", |b| {
        b.iter(|| {
            let rendered = template::render(black_box(stack::DEFAULT_USER_DATA), &vars).unwrap();
            black_box(template::encode_user_data(&rendered));
        });
    });
}

fn bench_plan_web_tier(c: &mut Criterion) {
    let config = parser::parse_config(STACK).unwrap();
    let tier = config.web_tier.unwrap();
    let backend = backend(&tier);
    let data = datasource::resolve_all(&stack::lookup_requests(&tier), &backend).unwrap();
    let (nodes, _) = stack::declare(&tier, &data).unwrap();
    let observed = ObservedState::default();

    c.bench_function("plan_web_tier", |b| {
        b.iter(|| {
            let graph = build_graph(black_box(nodes.clone()), &data).unwrap();
            black_box(planner::plan("bench", &graph, &observed).unwrap());
        });
    });
}

fn bench_plan_chain(c: &mut Criterion) {
    // a linear chain of security groups
    let mut group = c.benchmark_group("plan_chain");
    for n in [10, 50, 100] {
        let nodes: Vec<ResourceNode> = (0..n)
            .map(|i| {
                let node = ResourceNode::new(format!("sg_{i:04}"), ResourceKind::SecurityGroup)
                    .attr("name", format!("sg-{i}"));
                if i > 0 {
                    node.attr("peer", Reference::node(format!("sg_{:04}", i - 1), "id"))
                } else {
                    node
                }
            })
            .collect();
        let data = datasource::DataSourceResult::default();
        let observed = ObservedState::default();
        group.bench_with_input(BenchmarkId::from_parameter(n), &nodes, |b, nodes| {
            b.iter(|| {
                let graph = build_graph(nodes.clone(), &data).unwrap();
                black_box(planner::plan("chain", &graph, &observed).unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_hash_attributes,
    bench_template_render,
    bench_plan_web_tier,
    bench_plan_chain
);
criterion_main!(benches);
