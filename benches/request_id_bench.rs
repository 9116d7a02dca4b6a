// Request id encode/decode cost -- this runs on every accepted
// connection and every completed request, so it needs to stay cheap.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emberhttp::net::request_id::{RequestId, RequestIdFields};

fn bench_encode(c: &mut Criterion) {
    let fields = RequestIdFields {
        iotd_idx: 3,
        conn_idx: 123_456,
        generation: 98_765,
    };
    c.bench_function("request_id_encode", |b| {
        b.iter(|| black_box(RequestId::encode(black_box(fields))));
    });
}

fn bench_decode(c: &mut Criterion) {
    let fields = RequestIdFields {
        iotd_idx: 3,
        conn_idx: 123_456,
        generation: 98_765,
    };
    let id = RequestId::encode(fields);
    c.bench_function("request_id_decode", |b| {
        b.iter(|| black_box(black_box(id).decode(63)));
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
