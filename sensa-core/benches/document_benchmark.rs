use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sensa_core::{EditOp, MindMap, MindMapEdge, MindMapNode, NodePatch};
use std::hint::black_box;

fn build_ops(count: usize) -> Vec<EditOp> {
    let mut ops = Vec::with_capacity(count * 3);
    for i in 0..count {
        ops.push(EditOp::NodeAdd {
            node: MindMapNode::with_id(format!("n{i}"), format!("Concept {i}")).at(i as f64, 0.0),
        });
        if i > 0 {
            ops.push(EditOp::EdgeAdd {
                edge: MindMapEdge::with_id(format!("e{i}"), format!("n{}", i - 1), format!("n{i}")),
            });
        }
        ops.push(EditOp::NodeUpdate {
            patch: NodePatch::new(format!("n{i}")).moved_to(i as f64, 10.0),
        });
    }
    ops
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("MindMap");
    let ops = build_ops(25);
    group.throughput(Throughput::Elements(ops.len() as u64));

    group.bench_function("replay_25_node_map", |b| {
        b.iter(|| black_box(MindMap::replay(black_box(&ops))))
    });

    group.finish();
}

fn bench_op_json(c: &mut Criterion) {
    let op = EditOp::NodeUpdate {
        patch: NodePatch::new("n1").label("Renamed").moved_to(42.0, 7.0),
    };

    c.bench_function("edit_op_json_roundtrip", |b| {
        b.iter(|| {
            let json = serde_json::to_vec(black_box(&op)).unwrap();
            black_box(serde_json::from_slice::<EditOp>(&json).unwrap());
        })
    });
}

criterion_group!(benches, bench_apply, bench_op_json);
criterion_main!(benches);
