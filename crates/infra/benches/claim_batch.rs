use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use drayhorse_core::{JobPayload, NewJob, PerformerId};
use drayhorse_infra::store::{InMemoryJobStore, JobStore};

fn seeded_store(waiting: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    for i in 0..waiting {
        store
            .enqueue(
                NewJob::new(JobPayload::new("bench.noop", serde_json::json!({"i": i})).into_value())
                    .with_priority((i % 10) as i32),
            )
            .unwrap();
    }
    store
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_throughput");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_single", |b| {
        let store = InMemoryJobStore::new();
        b.iter(|| {
            store
                .enqueue(NewJob::new(
                    JobPayload::new("bench.noop", black_box(serde_json::json!({}))).into_value(),
                ))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_claim_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_batch");
    let performer = PerformerId("bench.1.0".to_string());

    for backlog in [100, 1_000, 10_000].iter() {
        for batch in [1usize, 10, 50].iter() {
            group.throughput(Throughput::Elements(*batch as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("backlog_{backlog}"), batch),
                batch,
                |b, &batch| {
                    b.iter_batched(
                        || seeded_store(*backlog),
                        |store| {
                            black_box(
                                store
                                    .claim_batch(&[], batch, &performer, Utc::now())
                                    .unwrap(),
                            )
                        },
                        criterion::BatchSize::LargeInput,
                    );
                },
            );
        }
    }

    group.finish();
}

fn bench_full_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");
    group.sample_size(1000);
    let performer = PerformerId("bench.1.0".to_string());

    group.bench_function("enqueue_claim_run_succeed", |b| {
        let store = InMemoryJobStore::new();
        b.iter(|| {
            let id = store
                .enqueue(NewJob::new(
                    JobPayload::new("bench.noop", serde_json::json!({})).into_value(),
                ))
                .unwrap();
            let now = Utc::now();
            store.claim_batch(&[], 1, &performer, now).unwrap();
            store.mark_running(id, &performer, now).unwrap();
            store.mark_succeeded(id, now).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_claim_batch,
    bench_full_lifecycle
);
criterion_main!(benches);
