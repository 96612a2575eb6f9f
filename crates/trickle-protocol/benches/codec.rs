//! Codec benchmarks for trickle-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use trickle_protocol::codec;

fn bench_encode_small(c: &mut Criterion) {
    let payload = "x".repeat(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&payload))));
    group.finish();
}

fn bench_encode_multibyte(c: &mut Criterion) {
    let payload = "héllo 世界 ".repeat(16);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("multibyte", |b| {
        b.iter(|| codec::encode(black_box(&payload)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&"x".repeat(64));

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_streaming_decode(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for i in 0..32 {
        codec::encode_into(&format!(r#"{{"username":"u{i}","message":"hello"}}"#), &mut stream);
    }
    let stream = stream.freeze();

    c.bench_function("decode_from_32_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            while let Ok(Some(payload)) = codec::decode_from(&mut buf) {
                black_box(payload);
            }
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_encode_multibyte,
    bench_decode_small,
    bench_streaming_decode
);
criterion_main!(benches);
