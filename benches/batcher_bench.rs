//! Benchmark for batch planning

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use sheetops::batcher::{deep_merge, OperationBatcher};
use sheetops::transaction::{Operation, QueuedOperation};

fn create_queue(size: usize) -> Vec<QueuedOperation> {
    (0..size)
        .map(|i| {
            let row = i % 16 + 1;
            // Mix of mergeable patches, adjacent writes and barriers
            let operation = match i % 4 {
                0 | 1 => Operation::new("format", "set_background", "sheet-1")
                    .with_range(format!("A{}:D{}", row, row))
                    .with_params(json!({ "backgroundColor": { "red": i as f64 / size as f64 } }))
                    .field_patch(),
                2 => Operation::new("values", "write", "sheet-1")
                    .with_range(format!("F{}", i + 1))
                    .with_params(json!({ "values": [[i]] })),
                _ => Operation::new("format", "set_text_format", "sheet-1")
                    .with_range(format!("A{}:D{}", row, row))
                    .with_params(json!({ "textFormat": { "bold": true } }))
                    .field_patch(),
            };

            QueuedOperation {
                sequence_number: i as u64 + 1,
                operation,
                queued_at: Utc::now(),
            }
        })
        .collect()
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("batcher");
    let batcher = OperationBatcher::default();

    for size in [10, 50, 200].iter() {
        let queue = create_queue(*size);

        group.bench_with_input(BenchmarkId::new("plan", size), &queue, |b, queue| {
            b.iter(|| black_box(batcher.plan(black_box(queue))));
        });
    }

    group.finish();
}

fn bench_deep_merge(c: &mut Criterion) {
    let patch = json!({
        "textFormat": { "bold": true, "fontSize": 11, "foregroundColor": { "red": 0.2 } },
        "backgroundColor": { "green": 0.5 }
    });

    c.bench_function("deep_merge", |b| {
        b.iter(|| {
            let mut target = json!({ "textFormat": { "italic": true }, "borders": {} });
            deep_merge(&mut target, black_box(&patch));
            black_box(target)
        });
    });
}

criterion_group!(benches, bench_plan, bench_deep_merge);
criterion_main!(benches);
