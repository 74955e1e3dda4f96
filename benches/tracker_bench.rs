use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use fmtp::{BlockTracker, BopInfo, Blake3Authenticator, Config, MacKey, Pdu, PduCodec, ProductId};

const PRODUCT_SIZE: usize = 1_400 * 1_000;

fn assemble_product(c: &mut Criterion) {
    let config = Config::default();
    let block = config.block_size;
    let payload = vec![0x5Au8; block];

    let mut group = c.benchmark_group("tracker");
    group.throughput(Throughput::Bytes(PRODUCT_SIZE as u64));
    group.bench_function("assemble_1000_blocks", |b| {
        b.iter_batched(
            || BlockTracker::new(&config),
            |mut tracker| {
                let id = ProductId(1);
                tracker
                    .begin(id, BopInfo::new(PRODUCT_SIZE as u32, Bytes::new()))
                    .unwrap();
                for offset in (0..PRODUCT_SIZE).step_by(block) {
                    tracker.insert_block(id, offset as u32, &payload).unwrap();
                }
                black_box(tracker.drain_events())
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("missing_ranges_sparse", |b| {
        let mut tracker = BlockTracker::new(&config);
        let id = ProductId(1);
        tracker
            .begin(id, BopInfo::new(PRODUCT_SIZE as u32, Bytes::new()))
            .unwrap();
        // 일곱 블록마다 하나씩 누락
        for (i, offset) in (0..PRODUCT_SIZE).step_by(block).enumerate() {
            if i % 7 != 0 {
                tracker.insert_block(id, offset as u32, &payload).unwrap();
            }
        }
        b.iter(|| black_box(tracker.missing_ranges(id)))
    });
    group.finish();
}

fn codec(c: &mut Criterion) {
    let codec = PduCodec::new(Arc::new(Blake3Authenticator::new(MacKey::from_bytes([7u8; 32]))));
    let pdu = Pdu::data(ProductId(42), 1_400 * 17, Bytes::from(vec![0xA5u8; 1_400]));
    let frame = codec.encode(&pdu).unwrap();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("encode_data_pdu", |b| b.iter(|| codec.encode(black_box(&pdu)).unwrap()));
    group.bench_function("decode_data_pdu", |b| b.iter(|| codec.decode(black_box(&frame)).unwrap()));
    group.finish();
}

criterion_group!(benches, assemble_product, codec);
criterion_main!(benches);
