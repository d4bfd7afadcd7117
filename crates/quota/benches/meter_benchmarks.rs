use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use quotaflow_core::{Clock, ResourceUsage, SystemClock, TenantId, Tier};
use quotaflow_quota::{
    BillingPeriod, InMemoryTenantDirectory, PolicyHandle, TenantAccount, UsageMeter,
};

fn meter_with_tenants(count: usize) -> (UsageMeter, Vec<TenantId>) {
    let tenants = Arc::new(InMemoryTenantDirectory::new());
    let clock = Arc::new(SystemClock);
    let period = BillingPeriod::monthly(clock.now());

    let ids: Vec<TenantId> = (0..count)
        .map(|_| {
            let id = TenantId::new();
            tenants.upsert(TenantAccount::new(id, Tier::Enterprise, period));
            id
        })
        .collect();

    let meter = UsageMeter::new(Arc::new(PolicyHandle::default()), tenants, clock);
    (meter, ids)
}

/// Reserve + finalize round trip, single tenant vs. spread across tenants.
fn bench_reserve_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_finalize");
    group.throughput(Throughput::Elements(1));

    for tenants in [1usize, 64] {
        let (meter, ids) = meter_with_tenants(tenants);
        let estimate = ResourceUsage::tokens(1_000);
        let actual = ResourceUsage::tokens(900);
        let mut i = 0usize;

        group.bench_with_input(BenchmarkId::from_parameter(tenants), &tenants, |b, _| {
            b.iter(|| {
                let tenant = ids[i % ids.len()];
                i += 1;
                let r = meter.reserve(tenant, black_box(&estimate)).unwrap();
                meter.finalize(tenant, r.id, black_box(&actual)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_current_usage(c: &mut Criterion) {
    let (meter, ids) = meter_with_tenants(1);
    let tenant = ids[0];
    for _ in 0..100 {
        let r = meter.reserve(tenant, &ResourceUsage::tokens(10)).unwrap();
        meter.finalize(tenant, r.id, &ResourceUsage::tokens(10)).unwrap();
    }

    c.bench_function("current_usage", |b| {
        b.iter(|| black_box(meter.current_usage(tenant).unwrap()));
    });
}

criterion_group!(benches, bench_reserve_finalize, bench_current_usage);
criterion_main!(benches);
