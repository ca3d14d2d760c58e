//! Performance benchmarks for cmdshelf core operations
//!
//! Run with: `cargo bench -p cmdshelf-core`
//!
//! These benchmarks measure critical path performance:
//! - Cache key building (filter normalization on every read)
//! - Midpoint placement and scope renumbering
//! - Optimistic update cycles against a warm cache (snapshot, patch, settle)

use cmdshelf_core::cache::{CacheKey, CacheService, CachedValue};
use cmdshelf_core::config::CacheConfig;
use cmdshelf_core::gateway::InMemoryGateway;
use cmdshelf_core::models::{
    Command, CommandPatch, Entity, EntityKind, FilterField, FilterScope, FilterValue,
};
use cmdshelf_core::ordering::ReorderEngine;
use cmdshelf_core::services::CollectionClient;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Seed a client whose root command list holds `count` commands, cached
async fn setup_warm_client(count: i64) -> CollectionClient {
    let gateway = Arc::new(InMemoryGateway::new());
    for id in 1..=count {
        gateway.insert(Command {
            id,
            name: format!("cmd-{}", id),
            command: "echo".to_string(),
            position: id as f64 * 1000.0,
            ..Default::default()
        });
    }
    let client = CollectionClient::new(gateway, CacheConfig::default()).unwrap();
    client
        .commands()
        .list(&FilterScope::root())
        .settled()
        .await
        .unwrap();
    client
}

fn bench_key_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_keys");

    group.bench_function("filtered_list_from_pairs", |b| {
        b.iter(|| {
            let scope = FilterScope::from_fields([
                (FilterField::FavoritesOnly, Some(FilterValue::Flag(true))),
                (FilterField::ParentId, Some(FilterValue::Id(12))),
                (FilterField::CategoryId, Some(FilterValue::Id(3))),
            ])
            .unwrap();
            black_box(CacheKey::filtered_list(EntityKind::Command, &scope))
        })
    });

    let prefix = CacheKey::list(EntityKind::Command);
    let key = CacheKey::filtered_list(EntityKind::Command, &FilterScope::category(3));
    group.bench_function("prefix_match", |b| {
        b.iter(|| black_box(key.starts_with(black_box(&prefix))))
    });

    group.finish();
}

/// Repeated inserts at the front of one gap exhaust it and force renumbering
fn bench_ordering(c: &mut Criterion) {
    let engine = ReorderEngine::default();
    let mut group = c.benchmark_group("ordering");

    group.bench_function("position_between", |b| {
        b.iter(|| engine.position_between(black_box(Some(1000.0)), black_box(Some(2000.0))))
    });

    for size in [10usize, 100, 1000] {
        let ids: Vec<i64> = (1..=size as i64).collect();
        group.bench_with_input(BenchmarkId::new("renumber", size), &ids, |b, ids| {
            b.iter(|| black_box(engine.renumber(ids)))
        });
    }

    group.finish();
}

fn bench_cache_access(c: &mut Criterion) {
    let cache = CacheService::default();
    let key = CacheKey::detail(EntityKind::Command, 1);
    cache.set(
        &key,
        CachedValue::Entity(Entity::from(Command::draft("status", "git status"))),
    );

    c.bench_function("cache_get_detail", |b| {
        b.iter(|| black_box(cache.get(black_box(&key))))
    });
}

/// Measures a full optimistic update: cancel, snapshot, patch every copy,
/// gateway call, invalidation plan
fn bench_optimistic_update(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("optimistic_update");
    group.sample_size(20);

    for size in [10i64, 500] {
        group.bench_function(BenchmarkId::new("rename_in_list", size), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let client = setup_warm_client(size).await;

                    let start = std::time::Instant::now();
                    for i in 0..iters {
                        client
                            .commands()
                            .update(
                                size / 2,
                                CommandPatch {
                                    name: Some(format!("renamed-{}", i)),
                                    ..Default::default()
                                },
                            )
                            .await
                            .unwrap();
                    }
                    start.elapsed()
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_building,
    bench_ordering,
    bench_cache_access,
    bench_optimistic_update
);
criterion_main!(benches);
