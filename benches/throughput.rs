//! Throughput Benchmark for respgate
//!
//! Measures how fast the streaming decoder turns pipelined RESP bytes into
//! values, and the cost of serializing replies.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use respgate::protocol::{Decoder, RespValue};
use tokio::runtime::Runtime;

const PIPELINE: usize = 1_000;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build runtime")
}

/// `count` SET commands with values of `value_len` bytes, back to back.
fn pipelined_sets(count: usize, value_len: usize) -> Vec<u8> {
    let value = "x".repeat(value_len);
    let mut out = Vec::new();
    for i in 0..count {
        let key = format!("key:{}", i);
        let command = RespValue::Array(vec![
            RespValue::bulk_string("SET"),
            RespValue::bulk_string(key),
            RespValue::bulk_string(value.clone()),
        ]);
        out.extend_from_slice(&command.serialize());
    }
    out
}

async fn decode_all(input: &[u8]) -> usize {
    let mut decoder = Decoder::new(input);
    let mut units = 0;
    while let Some(unit) = decoder.next_unit().await {
        if unit.is_err() {
            break;
        }
        units += 1;
    }
    units
}

/// Benchmark decoding of multibulk commands
fn bench_decode(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("decode");

    for (name, value_len) in [("small", 16), ("medium", 1024), ("large", 64 * 1024)] {
        let input = pipelined_sets(PIPELINE, value_len);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_function(format!("set_{}", name), |b| {
            b.iter(|| black_box(rt.block_on(decode_all(black_box(&input)))));
        });
    }

    group.finish();
}

/// Benchmark decoding of single-line values and inline commands
fn bench_decode_lines(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("decode_lines");
    group.throughput(Throughput::Elements(PIPELINE as u64));

    let simple: Vec<u8> = (0..PIPELINE)
        .flat_map(|i| format!("+OK{}\r\n:{}\r\n", i, i).into_bytes())
        .collect();
    group.bench_function("simple_and_integer", |b| {
        b.iter(|| black_box(rt.block_on(decode_all(black_box(&simple)))));
    });

    let inline: Vec<u8> = (0..PIPELINE)
        .flat_map(|i| format!("GET key:{}\r\n", i).into_bytes())
        .collect();
    group.bench_function("inline", |b| {
        b.iter(|| black_box(rt.block_on(decode_all(black_box(&inline)))));
    });

    group.finish();
}

/// Benchmark reply serialization
fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");
    group.throughput(Throughput::Elements(1));

    let bulk = RespValue::BulkString(Bytes::from("x".repeat(1024)));
    group.bench_function("bulk_1kb", |b| {
        b.iter(|| black_box(bulk.serialize()));
    });

    let array = RespValue::Array(
        (0..100)
            .map(|i| RespValue::bulk_string(format!("member:{}", i)))
            .collect(),
    );
    group.bench_function("array_100", |b| {
        b.iter(|| black_box(array.serialize()));
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_decode_lines, bench_serialize);

criterion_main!(benches);
