//! Benchmarks for the Tephra storage core.
//!
//! Run with: cargo bench --package tephra
//!
//! ## Benchmark Categories
//!
//! - **Chunk Codec**: encode/decode/roundtrip of typical chunks
//! - **Order Conversion**: time order <-> chunk order
//! - **Page**: chunk completion and range search
//! - **Sequencer**: staged write path

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tephra::codec::{
    convert_from_chunk_order, convert_from_time_order, decode_chunk, encode_chunk,
    UncompressedChunk,
};
use tephra::page::Page;
use tephra::query::VecSink;
use tephra::search::NullSearchObserver;
use tephra::sequencer::Sequencer;
use tephra::{Query, QueryRange, Sample, StorageConfig};

/// Generate a typical chunk: a handful of series at regular intervals
/// with slowly varying values, already in chunk order.
fn generate_chunk(count: usize) -> UncompressedChunk {
    let start_ts = 1_000_000_000u64;
    let interval = 1_000_000_000u64;
    let series = 8u64;
    let per_series = count / series as usize;

    let mut chunk = UncompressedChunk::default();
    for id in 0..series {
        let mut value = 50.0;
        for i in 0..per_series {
            value += (i as f64 * 0.1).sin() * 0.1;
            chunk.push(&Sample::new(id, start_ts + i as u64 * interval, value));
        }
    }
    chunk
}

fn bench_chunk_encode(c: &mut Criterion) {
    let chunk = generate_chunk(10_000);
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(chunk.len() as u64));
    group.bench_function("encode_10k", |b| {
        b.iter(|| encode_chunk(black_box(&chunk)))
    });
    group.finish();
}

fn bench_chunk_decode(c: &mut Criterion) {
    let chunk = generate_chunk(10_000);
    let (bytes, meta) = encode_chunk(&chunk);
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(chunk.len() as u64));
    group.bench_function("decode_10k", |b| {
        b.iter(|| decode_chunk(black_box(&bytes), meta.n_elements).unwrap())
    });
    group.finish();
}

fn bench_chunk_roundtrip(c: &mut Criterion) {
    let chunk = generate_chunk(10_000);
    c.bench_function("codec/roundtrip_10k", |b| {
        b.iter(|| {
            let (bytes, meta) = encode_chunk(black_box(&chunk));
            black_box(decode_chunk(&bytes, meta.n_elements).unwrap())
        })
    });
}

fn bench_order_conversion(c: &mut Criterion) {
    let chunk_ordered = generate_chunk(10_000);
    let time_ordered = convert_from_chunk_order(&chunk_ordered);
    c.bench_function("codec/convert_from_time_order_10k", |b| {
        b.iter(|| convert_from_time_order(black_box(&time_ordered)))
    });
}

fn bench_page_complete_chunk(c: &mut Criterion) {
    let chunk = generate_chunk(1_000);
    c.bench_function("page/complete_chunk_1k", |b| {
        b.iter_batched(
            || {
                let mut page = Page::anonymous(8 << 20, 0).unwrap();
                page.reuse();
                page
            },
            |mut page| page.complete_chunk(black_box(&chunk)).unwrap(),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_page_search(c: &mut Criterion) {
    let mut page = Page::anonymous(8 << 20, 0).unwrap();
    page.reuse();
    for start in 0..16u64 {
        let mut chunk = UncompressedChunk::default();
        for ts in start * 1000..(start + 1) * 1000 {
            chunk.push(&Sample::new(1, ts, ts as f64));
        }
        page.complete_chunk(&chunk).unwrap();
    }
    let query = Query::new(QueryRange::forward(7_200, 7_400));
    c.bench_function("page/search_narrow_window", |b| {
        b.iter(|| {
            let mut sink = VecSink::default();
            page.search(black_box(&query), None, &NullSearchObserver, &mut sink)
                .unwrap();
            sink.samples.len()
        })
    });
}

fn bench_sequencer_add(c: &mut Criterion) {
    let config = StorageConfig::default();
    c.bench_function("sequencer/add_10k", |b| {
        b.iter_batched(
            || Sequencer::new(&config),
            |seq| {
                for ts in 0..10_000u64 {
                    seq.add(Sample::new(ts % 16, ts, ts as f64)).unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_chunk_encode,
    bench_chunk_decode,
    bench_chunk_roundtrip,
    bench_order_conversion,
    bench_page_complete_chunk,
    bench_page_search,
    bench_sequencer_add,
);
criterion_main!(benches);
