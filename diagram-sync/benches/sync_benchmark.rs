use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use diagram_core::{Delta, DiagramEngine, Document, Link, LinkCategory, MemoryEngine, Node, Point};
use diagram_sync::{
    BroadcastGroup, ChangeObserver, ClientIdentity, ModelSnapshotStore, PhaseMachine,
    PresencePeer, RoomFrame, SyncMessage,
};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

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

fn move_delta(doc: &Document) -> Delta {
    let mut after = doc.clone();
    if let Some(node) = after.node_mut("C10") {
        node.loc = Some(Point::new(120.0, 80.0));
    }
    Delta::between(doc, &after, "move").unwrap()
}

fn bench_change_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("Protocol");
    group.throughput(Throughput::Elements(1));

    let doc = class_diagram(200);
    let delta = move_delta(&doc);
    let snapshot = doc.to_json().unwrap();
    let source = ClientIdentity::generate();

    group.bench_function("encode_change_200_classes", |b| {
        b.iter(|| {
            let msg = SyncMessage::change("d1", Some(&delta), Some(&snapshot), 1, source).unwrap();
            black_box(msg.encode().unwrap());
        })
    });

    let frame = SyncMessage::change("d1", Some(&delta), Some(&snapshot), 1, source)
        .unwrap()
        .encode()
        .unwrap();
    group.bench_function("decode_changed_200_classes", |b| {
        b.iter(|| {
            if let SyncMessage::Change(change) = SyncMessage::decode(black_box(&frame)).unwrap() {
                let changed = diagram_sync::ChangedPayload::from(change);
                black_box(changed.incoming().unwrap());
            }
        })
    });

    group.finish();
}

fn bench_observe(c: &mut Criterion) {
    let doc = class_diagram(200);
    let mut engine = MemoryEngine::with_document(doc.clone());
    let mut phase = PhaseMachine::new();
    phase.finish_loading().unwrap();
    let mut observer = ChangeObserver::new();
    let mut x = 0.0;

    c.bench_function("observe_move_200_classes", |b| {
        b.iter(|| {
            x += 1.0;
            engine.transact("move", |d| {
                if let Some(node) = d.node_mut("C10") {
                    node.loc = Some(Point::new(x, 80.0));
                }
            });
            let mut store = ModelSnapshotStore::new("");
            for event in engine.drain_events() {
                black_box(observer.observe(&engine, &phase, &mut store, &event));
            }
        })
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("Broadcast");

    for peers in [10usize, 100] {
        let group_under_test = BroadcastGroup::new(1024);
        let mut receivers = runtime.block_on(async {
            let mut receivers = Vec::with_capacity(peers);
            for i in 0..peers {
                let peer = PresencePeer {
                    user_id: format!("user{i}"),
                    source: None,
                };
                receivers.push(group_under_test.add_peer(Uuid::new_v4(), peer).await);
            }
            receivers
        });
        let frame = Arc::new(RoomFrame {
            origin: None,
            text: "{\"event\":\"changed\"}".to_string(),
        });

        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(BenchmarkId::new("fan_out", peers), &peers, |b, _| {
            b.iter(|| {
                group_under_test.broadcast_raw(frame.clone());
                for rx in receivers.iter_mut() {
                    black_box(rx.try_recv().unwrap());
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_change_frame, bench_observe, bench_fan_out);
criterion_main!(benches);
