use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use portera::protocol::{Message, Startup, Vocabulary, PROTOCOL_VERSION_3_0};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    let query = Message::Other {
        tag: b'Q',
        body: Bytes::from_static(b"SELECT id, email FROM users WHERE active = true;\0"),
    };
    group.bench_function("query", |b| b.iter(|| black_box(&query).encode()));

    let startup = Message::Startup(Startup::new(
        PROTOCOL_VERSION_3_0,
        vec![
            ("user".to_string(), "app".to_string()),
            ("database".to_string(), "orders".to_string()),
            ("application_name".to_string(), "portera-bench".to_string()),
        ],
    ));
    group.bench_function("startup", |b| b.iter(|| black_box(&startup).encode()));

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let data_row = Message::Other {
        tag: b'D',
        body: Bytes::from_static(b"\x00\x03\x00\x00\x00\x0242\x00\x00\x00\x05alice\x00\x00\x00\x01t"),
    };
    let frame = data_row.encode();
    let body = frame.slice(5..);
    group.bench_function("data_row", |b| {
        b.iter(|| Vocabulary::Backend.parse(black_box(b'D'), body.clone()))
    });

    let error = Message::Error(portera::protocol::ErrorResponse::new(vec![
        (b'S', "ERROR".to_string()),
        (b'C', "28P01".to_string()),
        (b'M', "password authentication failed for user \"app\"".to_string()),
    ]));
    let frame = error.encode();
    let body = frame.slice(5..);
    group.bench_function("error_response", |b| {
        b.iter(|| Vocabulary::Backend.parse(black_box(b'E'), body.clone()))
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
