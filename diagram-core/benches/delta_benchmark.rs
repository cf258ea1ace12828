use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use diagram_core::{Delta, Document, Link, LinkCategory, Node, Point};
use std::hint::black_box;

fn class_diagram(classes: usize) -> Document {
    let mut doc = Document::new();
    for i in 0..classes {
        doc.upsert_node(Node::class(format!("C{i}"), format!("Class{i}")).at(i as f64 * 40.0, 0.0));
    }
    for i in 1..classes {
        doc.add_link(Link::new(format!("C{}", i - 1), format!("C{i}"), LinkCategory::Association));
    }
    doc
}

fn bench_delta_between(c: &mut Criterion) {
    let mut group = c.benchmark_group("Delta");
    group.throughput(Throughput::Elements(1));

    let before = class_diagram(200);
    let mut after = before.clone();
    if let Some(node) = after.node_mut("C100") {
        node.loc = Some(Point::new(120.0, 80.0));
    }

    group.bench_function("between_move_200_classes", |b| {
        b.iter(|| {
            black_box(Delta::between(black_box(&before), black_box(&after), "move").unwrap());
        })
    });

    group.finish();
}

fn bench_delta_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("Delta");
    group.throughput(Throughput::Elements(1));

    let before = class_diagram(200);
    let mut after = before.clone();
    after.upsert_node(Node::class("Extra", "Extra"));
    after.add_link(Link::new("C0", "Extra", LinkCategory::Composition));
    let delta = Delta::between(&before, &after, "add").unwrap();

    group.bench_function("apply_insert_200_classes", |b| {
        // Re-applying is idempotent, so one replica serves every iteration.
        let mut replica = before.clone();
        b.iter(|| {
            delta.apply_to(black_box(&mut replica)).unwrap();
        })
    });

    group.finish();
}

fn bench_snapshot_roundtrip(c: &mut Criterion) {
    let doc = class_diagram(200);
    c.bench_function("snapshot_roundtrip_200_classes", |b| {
        b.iter(|| {
            let json = black_box(&doc).to_json().unwrap();
            black_box(Document::parse(&json).unwrap());
        })
    });
}

criterion_group!(benches, bench_delta_between, bench_delta_apply, bench_snapshot_roundtrip);
criterion_main!(benches);
