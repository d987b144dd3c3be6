//! Container and payload throughput.
//!
//! Run with: cargo bench -p bundlenet-testkit

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bundlenet_core::{pack, unpack, Adu, AppId, BundleId, BundlePayload, Direction, PeerId};

const SIZES: [usize; 3] = [1024, 64 * 1024, 1024 * 1024];

fn blob(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_pack");
    for size in SIZES {
        let data = blob(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(pack([("bundle.id", Bytes::from_static(b"id")), ("payload", data.clone())]).unwrap()))
        });
    }
    group.finish();
}

fn bench_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_unpack");
    for size in SIZES {
        let bytes = pack([("payload", blob(size))]).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| black_box(unpack(bytes).unwrap()))
        });
    }
    group.finish();
}

fn bench_payload(c: &mut Criterion) {
    let peer = PeerId::from_bytes([7; 32]);
    let app = AppId::new("mail").unwrap();
    let adus: Vec<Adu> = (1..=100).map(|seq| Adu::new(peer, app.clone(), seq, blob(512))).collect();
    let payload = BundlePayload::new(BundleId::new(peer, 1, Direction::Upstream), 0, adus);
    let encoded = payload.encode().unwrap();

    let mut group = c.benchmark_group("bundle_payload");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_100_adus", |b| b.iter(|| black_box(payload.encode().unwrap())));
    group.bench_function("decode_100_adus", |b| {
        b.iter(|| black_box(BundlePayload::decode(&encoded, peer).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_pack, bench_unpack, bench_payload);
criterion_main!(benches);
