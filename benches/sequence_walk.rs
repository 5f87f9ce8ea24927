use std::sync::Arc;

use criterion::{black_box, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};

use smartbeat::sequence::{Sequence, SequenceKind};
use smartbeat::wire;

fn build(segments: usize) -> Sequence {
    let shared: Arc<[u8]> = Arc::from(vec![7u8; 64]);
    let mut inner = Sequence::new("inner", 1, SequenceKind::Data);
    for tag in 0..segments as u64 / 2 {
        inner.add_reference(shared.clone(), tag).expect("reference");
    }
    let inner = inner.into_shared();

    let mut outer = Sequence::new("outer", 2, SequenceKind::Management);
    for tag in 0..segments as u64 / 2 {
        outer.add_owned_copy(&[1u8; 48], 0x1000 + tag).expect("owned");
    }
    outer.add_nested(&inner, 0).expect("nested");
    outer
}

fn bench_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_walk");
    for &segments in &[8_usize, 64, 512] {
        let seq = build(segments);
        group.bench_with_input(BenchmarkId::new("leaves", segments), &seq, |b, seq| {
            b.iter(|| {
                let bytes: usize = seq.leaves().map(|(_, data)| data.len()).sum();
                black_box(bytes)
            })
        });
        group.bench_with_input(BenchmarkId::new("encode", segments), &seq, |b, seq| {
            b.iter(|| black_box(wire::encode(seq).expect("encode")))
        });
        let frame = wire::encode(&seq).expect("encode");
        group.bench_with_input(BenchmarkId::new("decode", segments), &frame, |b, frame| {
            b.iter(|| black_box(wire::decode(frame).expect("decode")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_walk);
criterion_main!(benches);
