//! Throughput Benchmark for Hogimap
//!
//! This benchmark measures the line framer and response rendering under
//! the input shapes a session sees: single commands, pipelined batches,
//! and lines split across many reads.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hogimap::protocol::{LineFramer, Response, Status, DEFAULT_MAX_BUFFER_LENGTH, READ_CHUNK_SIZE};

/// Benchmark framing whole lines
fn bench_single_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer_single");
    group.throughput(Throughput::Elements(1));

    group.bench_function("noop", |b| {
        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_LENGTH);
        b.iter(|| {
            black_box(framer.push(b"A1 NOOP\r\n").unwrap());
        });
    });

    group.bench_function("login", |b| {
        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_LENGTH);
        b.iter(|| {
            black_box(framer.push(b"A2 LOGIN \"alice@example.com\" \"s3cr3t\"\r\n").unwrap());
        });
    });

    group.finish();
}

/// Benchmark pipelined commands arriving in one read
fn bench_pipelined(c: &mut Criterion) {
    let batch: Vec<u8> = (0..64)
        .flat_map(|i| format!("A{} NOOP\r\n", i).into_bytes())
        .collect();

    let mut group = c.benchmark_group("framer_pipelined");
    group.throughput(Throughput::Bytes(batch.len() as u64));

    group.bench_function("64_commands", |b| {
        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_LENGTH);
        b.iter(|| {
            let lines = framer.push(&batch).unwrap();
            black_box(lines.len());
        });
    });

    group.finish();
}

/// Benchmark a long line delivered in read-sized chunks
fn bench_split_line(c: &mut Criterion) {
    let mut line = vec![b'x'; 256 * 1024];
    line.extend_from_slice(b"\r\n");

    let mut group = c.benchmark_group("framer_split");
    group.throughput(Throughput::Bytes(line.len() as u64));

    group.bench_function("256k_line_1k_chunks", |b| {
        b.iter(|| {
            let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_LENGTH);
            let mut total = 0;
            for chunk in line.chunks(READ_CHUNK_SIZE) {
                total += framer.push(chunk).unwrap().len();
            }
            black_box(total);
        });
    });

    group.bench_function("byte_at_a_time", |b| {
        let short = b"A1 CAPABILITY\r\n";
        b.iter(|| {
            let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_LENGTH);
            let mut total = 0;
            for byte in short.chunks(1) {
                total += framer.push(byte).unwrap().len();
            }
            black_box(total);
        });
    });

    group.finish();
}

/// Benchmark response rendering
fn bench_responses(c: &mut Criterion) {
    let mut group = c.benchmark_group("response");
    group.throughput(Throughput::Elements(1));

    group.bench_function("tagged", |b| {
        b.iter(|| {
            let response = Response::tagged("A1", Status::Ok, "NOOP completed");
            black_box(response.serialize());
        });
    });

    group.bench_function("capability", |b| {
        b.iter(|| {
            let response = Response::untagged("CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN")
                .then_tagged("A1", Status::Ok, "CAPABILITY completed");
            black_box(response.serialize());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_line,
    bench_pipelined,
    bench_split_line,
    bench_responses,
);

criterion_main!(benches);
