use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use gasoline_agentd::app::capture::CaptureBuffers;
use gasoline_agentd::domain::capture::{CaptureFilter, LogEntry, LogLevel};
use serde_json::{json, Value};

fn log_batch(size: usize) -> Vec<Value> {
    (0..size)
        .map(|i| {
            json!({
                "level": if i % 5 == 0 { "error" } else { "info" },
                "message": format!("message {i}"),
                "url": format!("http://localhost:3000/page/{}", i % 20),
            })
        })
        .collect()
}

fn ingest_logs(c: &mut Criterion) {
    c.bench_function("ingest_100_logs", |b| {
        b.iter_batched(
            || (CaptureBuffers::new(), log_batch(100)),
            |(buffers, batch)| buffers.ingest::<LogEntry>(black_box(batch)),
            BatchSize::SmallInput,
        )
    });
}

fn ingest_into_full_ring(c: &mut Criterion) {
    let buffers = CaptureBuffers::new();
    buffers.ingest::<LogEntry>(log_batch(2000));

    c.bench_function("ingest_100_logs_full_ring", |b| {
        b.iter_batched(
            || log_batch(100),
            |batch| buffers.ingest::<LogEntry>(black_box(batch)),
            BatchSize::SmallInput,
        )
    });
}

fn filtered_snapshot(c: &mut Criterion) {
    let buffers = CaptureBuffers::new();
    buffers.ingest::<LogEntry>(log_batch(1000));
    let filter = CaptureFilter::default()
        .levels(vec![LogLevel::Error])
        .url("/page/7");

    c.bench_function("snapshot_errors_by_url", |b| {
        b.iter(|| buffers.snapshot::<LogEntry>(black_box(&filter), 100))
    });

    c.bench_function("snapshot_all_logs", |b| {
        b.iter(|| buffers.snapshot::<LogEntry>(black_box(&CaptureFilter::default()), 1000))
    });
}

criterion_group!(benches, ingest_logs, ingest_into_full_ring, filtered_snapshot);
criterion_main!(benches);
