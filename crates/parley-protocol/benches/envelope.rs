use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parley_protocol::{envelope, Message, MessageType};
use serde_json::json;

fn bench_envelope(c: &mut Criterion) {
    let plain = Message::new("alice", "Hello, world!", MessageType::Text);
    let rich = Message::new("alice", "Shared a dashboard", MessageType::SharedItem)
        .with_metadata(Some(json!({"itemType": "dashboard", "itemData": {"id": 7, "title": "Sales"}})))
        .with_recipient("bob");
    let rich_raw = envelope::encode(&rich);

    c.bench_function("envelope_encode_plain", |b| {
        b.iter(|| envelope::encode(black_box(&plain)))
    });

    c.bench_function("envelope_encode_rich", |b| {
        b.iter(|| envelope::encode(black_box(&rich)))
    });

    c.bench_function("envelope_decode_rich", |b| {
        b.iter(|| envelope::decode(black_box(&rich_raw)))
    });

    c.bench_function("envelope_decode_plain", |b| {
        b.iter(|| envelope::decode(black_box("just some chat text")))
    });
}

criterion_group!(benches, bench_envelope);
criterion_main!(benches);
