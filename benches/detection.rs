use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use accordance::{DetectionEngine, DetectionScope, Effect, EngineConfig, EngineStores, Policy, RiskLevel};

const SUBJECTS: [&str; 5] = ["admin", "Manager", "manager or director", "auditor", ""];
const RESOURCES: [&str; 8] = [
    "CustomerPII",
    "ExpenseReport",
    "Invoice",
    "PayrollRecord",
    "AuditLog",
    "SupportTicket",
    "Contract",
    "VendorProfile",
];

/// Builds an engine seeded with `apps * per_app` policies spread over a fixed
/// set of resources, so every bucket holds policies from every application.
fn make_engine(apps: usize, per_app: usize) -> DetectionEngine {
    let engine = DetectionEngine::new(EngineStores::in_memory(), EngineConfig::default()).unwrap();
    for app in 0..apps {
        for i in 0..per_app {
            let resource = RESOURCES[i % RESOURCES.len()];
            let subject = SUBJECTS[(app + i) % SUBJECTS.len()];
            let threshold = 1_000 * (1 + (app + i) % 7);
            let policy = Policy::builder()
                .application(format!("app{app}"))
                .subject(subject)
                .resource(resource)
                .action(if i % 3 == 0 { "write" } else { "read" })
                .conditions(format!("amount < {threshold}"))
                .effect(if (app * 31 + i) % 11 == 0 { Effect::Deny } else { Effect::Allow })
                .risk_level(if i % 5 == 0 { RiskLevel::High } else { RiskLevel::Medium })
                .build()
                .unwrap();
            engine.stores().policies.insert(policy).unwrap();
        }
    }
    engine
}

fn bench_intra_application(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect/intra");
    for per_app in [16usize, 64] {
        let apps = 8;
        group.throughput(Throughput::Elements((apps * per_app) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(per_app), &per_app, |b, &per_app| {
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    // Fresh stores per iteration; a second pass would skip every stored pair.
                    let engine = make_engine(apps, per_app);
                    let start = Instant::now();
                    let _ = engine.detect(&DetectionScope::All, false).unwrap();
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_cross_application(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect/cross");
    for apps in [4usize, 16] {
        let per_app = 16;
        group.throughput(Throughput::Elements((apps * per_app) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(apps), &apps, |b, &apps| {
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    let engine = make_engine(apps, per_app);
                    let start = Instant::now();
                    let _ = engine.detect(&DetectionScope::All, true).unwrap();
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_rerun_skips_existing(c: &mut Criterion) {
    c.bench_function("detect/rerun_cross", |b| {
        let engine = make_engine(8, 32);
        let _ = engine.detect(&DetectionScope::All, true).unwrap();
        b.iter(|| engine.detect(&DetectionScope::All, true).unwrap());
    });
}

criterion_group!(
    benches,
    bench_intra_application,
    bench_cross_application,
    bench_rerun_skips_existing
);
criterion_main!(benches);
