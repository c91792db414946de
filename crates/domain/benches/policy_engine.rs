#![allow(clippy::cast_possible_truncation)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use domain::common::entity::{Identity, OwnerId, Protocol};
use domain::policy::changes::ChangeState;
use domain::policy::engine::PolicyFeatures;
use domain::policy::entry::{InternalEntry, MapStateEntry};
use domain::policy::key::Key;
use domain::policy::mapstate::MapState;

fn allow_entry(owner: u64) -> InternalEntry {
    InternalEntry::new(Some(OwnerId(owner)), vec![], MapStateEntry::allow(), 0)
}

fn key(identity: u32, port: u16) -> Key {
    Key::ingress()
        .with_identity(Identity(identity))
        .with_port_proto(Protocol::Tcp, port)
}

/// Populate a state with `identities` x `ports` allow entries.
fn populate(identities: u32, ports: u16) -> MapState {
    let mut ms = MapState::new();
    let mut changes = ChangeState::new();
    for id in 1..=identities {
        for p in 0..ports {
            ms.insert_with_changes(
                key(id, 8000 + p),
                allow_entry(1),
                PolicyFeatures::ALL,
                &mut changes,
            );
        }
    }
    ms
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("deny_preferred_insert");
    for identities in [100u32, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(identities),
            &identities,
            |b, &identities| {
                b.iter(|| {
                    let ms = populate(black_box(identities), 4);
                    black_box(ms.len())
                });
            },
        );
    }
    group.finish();
}

fn bench_deny_vacuum(c: &mut Criterion) {
    // A wildcard deny sweeping away 4000 narrower allow entries.
    c.bench_function("deny_vacuum_4k", |b| {
        b.iter_batched(
            || populate(1000, 4),
            |mut ms| {
                let mut changes = ChangeState::new();
                let deny = InternalEntry::new(
                    Some(OwnerId(2)),
                    vec![],
                    MapStateEntry::deny(),
                    0,
                );
                ms.insert_with_changes(
                    Key::ingress().with_port_proto(Protocol::Tcp, 0),
                    deny,
                    PolicyFeatures::ALL,
                    &mut changes,
                );
                black_box(ms.len())
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

fn bench_covering_lookup(c: &mut Criterion) {
    let ms = populate(1000, 4);
    let probe = key(500, 8002);
    c.bench_function("broader_or_equal_keys", |b| {
        b.iter(|| black_box(ms.broader_or_equal_keys(black_box(&probe))));
    });
}

criterion_group!(benches, bench_insert, bench_deny_vacuum, bench_covering_lookup);
criterion_main!(benches);
