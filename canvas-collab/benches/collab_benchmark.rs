use canvas_collab::broadcast::BroadcastGroup;
use canvas_collab::element::{Element, ElementMap};
use canvas_collab::files::{ContentGate, FileBlob};
use canvas_collab::presence::{CursorColor, PeerIdentity, PresenceRegistry, Vec2};
use canvas_collab::protocol::{ClientMessage, ElementsUpdate, ServerMessage};
use canvas_collab::reconcile::reconcile;
use canvas_collab::storage::{DrawingStorage, DrawingStore, DrawingWrite, NewDrawing, StoreConfig};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn scene(n: usize) -> Vec<Element> {
    (0..n)
        .map(|i| {
            Element::rectangle(format!("el-{i}"))
                .versioned(1, i as i64)
                .with_prop("x", json!(i * 10))
                .with_prop("y", json!(i * 5))
        })
        .collect()
}

fn bench_reconcile_1000(c: &mut Criterion) {
    let base: ElementMap = scene(1000).into_iter().map(|e| (e.header.id.clone(), e)).collect();
    let incoming: Vec<Element> = scene(1000)
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.versioned(1 + (i % 2) as u64, 0))
        .collect();

    c.bench_function("reconcile_1000_half_newer", |b| {
        b.iter(|| {
            let mut current = base.clone();
            black_box(reconcile(&mut current, black_box(incoming.clone())));
        })
    });
}

fn bench_update_encode(c: &mut Criterion) {
    let elements = scene(100);
    c.bench_function("update_encode_100", |b| {
        b.iter(|| {
            let msg = ServerMessage::Update(ElementsUpdate {
                elements: black_box(elements.clone()),
            });
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = ClientMessage::update(&scene(100)).unwrap().encode().unwrap();
    c.bench_function("update_decode_100", |b| {
        b.iter(|| {
            let msg = ClientMessage::decode(black_box(&encoded)).unwrap();
            if let ClientMessage::Update(update) = msg {
                black_box(Element::decode_batch(update.elements));
            }
        })
    });
}

fn bench_gate_png_75kb(c: &mut Criterion) {
    use base64::Engine;
    let payload = vec![0x89u8; 75 * 1024];
    let data_url = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&payload)
    );
    let blob = FileBlob::new("png", "image/png", data_url, 0);
    let gate = ContentGate::default();

    c.bench_function("gate_png_75kb", |b| {
        b.iter(|| black_box(gate.check(black_box(&blob))).is_ok())
    });
}

fn bench_gate_svg_scan(c: &mut Criterion) {
    let mut svg = String::from("<svg xmlns='http://www.w3.org/2000/svg'>");
    for i in 0..500 {
        svg.push_str(&format!("<rect x='{i}' y='{i}' width='10' height='10'/>"));
    }
    svg.push_str("</svg>");
    let blob = FileBlob::new("svg", "image/svg+xml", format!("data:image/svg+xml,{svg}"), 0);
    let gate = ContentGate::default();

    c.bench_function("gate_svg_scan_500_rects", |b| {
        b.iter(|| black_box(gate.check(black_box(&blob))).is_ok())
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let _receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let msg = ServerMessage::Update(ElementsUpdate { elements: scene(1) });

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(group.broadcast(None, &msg).unwrap());
            }
        })
    });
}

fn bench_cursor_coalescing(c: &mut Criterion) {
    let mut registry = PresenceRegistry::new(Duration::from_millis(33));
    let peers: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();
    let start = Instant::now();
    for peer in &peers {
        registry.join(*peer, PeerIdentity::named("bench"), start);
    }

    c.bench_function("cursor_update_100_peers", |b| {
        let mut tick = 0u64;
        b.iter(|| {
            tick += 1;
            let now = start + Duration::from_millis(tick);
            for peer in &peers {
                black_box(registry.update_cursor(peer, Vec2::new(tick as f64, 0.0), None, now));
            }
            black_box(registry.flush_pending(now));
        })
    });
}

fn bench_cursor_color_from_uuid(c: &mut Criterion) {
    let id = Uuid::new_v4();
    c.bench_function("cursor_color_from_uuid", |b| {
        b.iter(|| black_box(CursorColor::from_uuid(black_box(id)).to_hex()))
    });
}

fn bench_store_write_1000(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = DrawingStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let new = NewDrawing::named("bench");
    let id = new.id;
    store.create_drawing(new).unwrap();
    let elements = scene(1000);
    let mut version = 1;

    c.bench_function("store_write_1000_elements", |b| {
        b.iter(|| {
            let write = DrawingWrite {
                elements: elements.clone(),
                app_state: json!({}),
                ..Default::default()
            };
            version = store.write_drawing(id, version, write).unwrap();
        })
    });
}

fn bench_store_load_1000(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = DrawingStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let mut new = NewDrawing::named("bench");
    new.elements = scene(1000);
    let id = new.id;
    store.create_drawing(new).unwrap();

    c.bench_function("store_load_1000_elements", |b| {
        b.iter(|| black_box(store.load_drawing(black_box(id)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_reconcile_1000,
    bench_update_encode,
    bench_update_decode,
    bench_gate_png_75kb,
    bench_gate_svg_scan,
    bench_broadcast_1000_messages,
    bench_cursor_coalescing,
    bench_cursor_color_from_uuid,
    bench_store_write_1000,
    bench_store_load_1000,
);
criterion_main!(benches);
