//! Codec and ring throughput.
//!
//! Measures encode + decode of one frame per iteration for each bundled
//! codec, and single-threaded send/recv through a message ring.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use slotnet::{CodecKind, MessageBuffer};

const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];

/// Half random, half repeated bytes, so deflate has something to do.
fn payload(size: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    (0..size)
        .map(|i| if i % 2 == 0 { rng.gen() } else { b'a' })
        .collect()
}

fn codec_round_trip(c: &mut Criterion) {
    slotnet::dev_tracing::init_tracing();
    for kind in [CodecKind::Length, CodecKind::Checksum, CodecKind::Deflate] {
        let mut group = c.benchmark_group(format!("codec/{kind:?}"));
        for &size in MESSAGE_SIZES {
            let message = payload(size);
            let mut codec = kind.build(size).unwrap();
            let mut wire = BytesMut::with_capacity(codec.frame_length());
            let mut decoded = BytesMut::with_capacity(size);

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
                b.iter(|| {
                    codec.encode(black_box(message), &mut wire).unwrap();
                    decoded.clear();
                    codec.decode(&mut wire, &mut decoded).unwrap();
                    black_box(&decoded);
                });
            });
        }
        group.finish();
    }
}

fn ring_send_recv(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    for &size in &MESSAGE_SIZES[..3] {
        let message = payload(size);
        let (mut producer, mut consumer) = MessageBuffer::bounded(64, size).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| {
                producer.send(black_box(message)).unwrap();
                black_box(consumer.recv().unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, codec_round_trip, ring_send_recv);
criterion_main!(benches);
