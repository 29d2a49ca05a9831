#[macro_use]
extern crate criterion;

use criterion::black_box;
use criterion::Criterion;
use linkchat::net::frame::{decode_app, encode_app, Channel, Kind, TransferId};

fn codec_benchmark(c: &mut Criterion) {
    let id = TransferId::random();
    let payload = vec![0xa5u8; 1200];

    c.bench_function("encode_app_1200", move |b| {
        b.iter(|| encode_app(Kind::FileChunk, Channel::File, 42, &id, black_box(&payload)).unwrap())
    });

    let id = TransferId::random();
    let payload = vec![0xa5u8; 1200];
    let data = encode_app(Kind::FileChunk, Channel::File, 42, &id, &payload).unwrap();

    c.bench_function("decode_app_1200", move |b| {
        b.iter(|| decode_app(black_box(&data)).unwrap())
    });
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
