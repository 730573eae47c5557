use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use outboxd_core::bucket::route;
use outboxd_core::{BucketId, InstanceId, Membership, NewTask, NodeId, ShardMap};
use outboxd_infra::claim::ClaimService;
use outboxd_infra::task_store::{InMemoryTaskStore, InsertOutcome, TaskStore};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(1));

    let keys: Vec<String> = (0..1024).map(|i| format!("store-{i}")).collect();
    group.bench_function("route_partition_key", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(route(black_box(&keys[i])))
        })
    });

    let shards = ShardMap::new(32).unwrap();
    let all: Vec<BucketId> = BucketId::all().collect();
    group.bench_function("group_all_buckets_by_shard", |b| {
        b.iter(|| black_box(shards.group_by_shard(black_box(&all))))
    });

    for nodes in [1usize, 3, 16] {
        let live: Vec<NodeId> = (0..nodes)
            .map(|i| NodeId::new(format!("10.0.0.{i}:8080")).unwrap())
            .collect();
        let me = live[nodes / 2].clone();
        group.bench_with_input(BenchmarkId::new("owned_buckets", nodes), &live, |b, live| {
            b.iter(|| {
                let membership = Membership::compute(black_box(live), &me).unwrap();
                black_box(membership.owned_buckets())
            })
        });
    }

    group.finish();
}

fn bench_in_memory_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_claim");
    group.sample_size(20);
    let rt = runtime();
    let all: Vec<BucketId> = BucketId::all().collect();

    for batch_size in [10u32, 50, 200].iter() {
        let rows = 1_000u64;
        group.throughput(Throughput::Elements(rows));
        group.bench_with_input(BenchmarkId::new("drain", batch_size), batch_size, |b, &batch_size| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryTaskStore::arc(ShardMap::new(8).unwrap());
                    let now = Utc::now();
                    for i in 0..rows {
                        store
                            .insert(NewTask::new("REFUND_HTTP", format!("order-{i}"), format!("store-{i}"), "{}"), now)
                            .await
                            .unwrap();
                    }

                    let claims = ClaimService::new(store.clone(), InstanceId::new(), Duration::from_secs(30), batch_size);
                    let mut claimed = 0;
                    loop {
                        let batch = claims.claim_owned(&all, now).await.unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        claimed += batch.len();
                    }
                    black_box(claimed)
                })
            })
        });
    }

    group.finish();
}

fn bench_single_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_one");
    let rt = runtime();
    let store: Arc<InMemoryTaskStore> = InMemoryTaskStore::arc(ShardMap::default());

    group.bench_function("insert_and_claim_by_id", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            rt.block_on(async {
                let now = Utc::now();
                let outcome = store
                    .insert(NewTask::new("REFUND_HTTP", format!("order-{i}"), "store-7", "{}"), now)
                    .await
                    .unwrap();
                let claims = ClaimService::new(store.clone(), InstanceId::new(), Duration::from_secs(30), 1);
                if let InsertOutcome::Inserted(row) = outcome {
                    black_box(claims.claim_one(row.key(), now).await.unwrap());
                }
            })
        })
    });

    group.finish();
}

criterion_group!(benches, bench_routing, bench_in_memory_claim, bench_single_claim);
criterion_main!(benches);
