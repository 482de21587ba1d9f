use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use equiptrack_core::{CategoryId, ConditionId, StatusId, UserId};
use equiptrack_infra::store::UnitStore;
use equiptrack_infra::{InMemoryConfigResolver, Ledger, LedgerConfig, Scope, TransferRequest};
use equiptrack_inventory::{
    AllocationRequest, Identifier, ItemKey, NewUnit, Owner, TransferType, derive_counts,
    select_units,
};

fn laptops() -> CategoryId {
    CategoryId::parse("cat-laptops").expect("category id")
}

fn key() -> ItemKey {
    ItemKey::new("Dell01", laptops()).expect("item key")
}

fn new_unit(i: usize) -> NewUnit {
    NewUnit {
        key: key(),
        identifier: (i % 2 == 0).then(|| Identifier::serial(format!("SN-{i}")).expect("serial")),
        status_id: StatusId::parse("available").expect("status"),
        condition_id: ConditionId::parse(if i % 7 == 0 { "damaged" } else { "working" })
            .expect("condition"),
    }
}

/// Ledger holding `size` units of one key, a tenth of them issued to a user.
fn seeded_ledger(size: usize) -> Ledger {
    let resolver = Arc::new(InMemoryConfigResolver::new().with_category(laptops(), "Laptops"));
    let ledger = Ledger::in_memory(LedgerConfig::default(), resolver).expect("ledger");
    let user = Owner::user(UserId::parse("alice").expect("user id"));
    for i in 0..size {
        let unit = ledger
            .intake()
            .create_unit(new_unit(i), "bench")
            .expect("intake")
            .unit;
        if i % 10 == 1 {
            ledger
                .transfers()
                .transfer(TransferRequest {
                    unit_id: unit.id_typed(),
                    from: Owner::AdminStock,
                    to: user.clone(),
                    transfer_type: TransferType::RequestApproved,
                    processed_by: "bench".into(),
                    reason: String::new(),
                })
                .expect("transfer");
        }
    }
    ledger
}

fn bench_aggregate_recompute(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_recompute");

    for size in [100usize, 1_000, 10_000].iter() {
        let ledger = seeded_ledger(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(ledger.aggregates().recompute(&key()).expect("recompute")));
        });
    }

    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    for size in [100usize, 1_000, 10_000].iter() {
        let ledger = seeded_ledger(*size);
        let units = ledger
            .stores()
            .units
            .list_by_key(&key())
            .expect("list units");
        let rule = ledger.aggregates().rule().clone();
        let request = AllocationRequest {
            key: key(),
            quantity: 10,
            identifiers: vec!["SN-4".into(), "SN-8".into()],
        };

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("pure", size), size, |b, _| {
            b.iter(|| black_box(select_units(&units, &request, &rule).expect("select")));
        });
        group.bench_with_input(BenchmarkId::new("with_scan", size), size, |b, _| {
            b.iter(|| {
                black_box(
                    ledger
                        .selector()
                        .select_units(&key(), 10, &request.identifiers)
                        .expect("select"),
                )
            });
        });
    }

    group.finish();
}

fn bench_recompute_vs_pure_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("recompute_vs_derive");
    let ledger = seeded_ledger(1_000);
    let units = ledger
        .stores()
        .units
        .list_by_key(&key())
        .expect("list units");
    let rule = ledger.aggregates().rule().clone();

    group.bench_function("derive_counts_only", |b| {
        b.iter(|| black_box(derive_counts(&key(), &units, &rule)));
    });
    group.bench_function("recompute_and_store", |b| {
        b.iter(|| black_box(ledger.aggregates().recompute(&key()).expect("recompute")));
    });
    group.bench_function("reconcile_all", |b| {
        b.iter(|| black_box(ledger.reconciliation().reconcile(&Scope::All).expect("reconcile")));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_aggregate_recompute,
    bench_allocation,
    bench_recompute_vs_pure_derivation
);
criterion_main!(benches);
