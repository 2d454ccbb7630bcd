use criterion::{criterion_group, criterion_main, Criterion};
use envlock_core::{plan, DiffEngine, DriftDetector};
use envlock_schema::{compute_checksum, BaseImage, PackageSet, Snapshot};
use std::hint::black_box;

fn large_snapshot(version: &str) -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.base_image = BaseImage {
        name: "python:3.11-slim".to_owned(),
        digest: "sha256:3f1c".to_owned(),
        id: "sha256:3f1c".to_owned(),
    };
    snapshot.packages = PackageSet {
        apt: (0..400).map(|i| format!("lib{i:03}=1.{i}-{version}")).collect(),
        pip: (0..200).map(|i| format!("pkg{i:03}=={version}.{i}")).collect(),
        npm: (0..200).map(|i| format!("@scope/mod{i:03}@{version}.{i}")).collect(),
        ..PackageSet::default()
    };
    snapshot.normalize();
    snapshot
}

fn bench_checksum(c: &mut Criterion) {
    let snapshot = large_snapshot("1");
    c.bench_function("checksum_800pkg", |b| {
        b.iter(|| compute_checksum(black_box(&snapshot)));
    });
}

fn bench_diff_identical(c: &mut Criterion) {
    let snapshot = large_snapshot("1");
    c.bench_function("diff_800pkg_identical", |b| {
        b.iter(|| DiffEngine.detect(black_box(&snapshot), black_box(&snapshot)));
    });
}

fn bench_diff_drifted(c: &mut Criterion) {
    let declared = large_snapshot("1");
    let live = large_snapshot("2");
    c.bench_function("diff_800pkg_all_changed", |b| {
        b.iter(|| DiffEngine.detect(black_box(&declared), black_box(&live)));
    });
}

fn bench_plan(c: &mut Criterion) {
    let declared = large_snapshot("1");
    let live = large_snapshot("2");
    c.bench_function("plan_800pkg_all_changed", |b| {
        b.iter(|| plan(black_box(&declared.packages), black_box(&live.packages)));
    });
}

criterion_group!(
    benches,
    bench_checksum,
    bench_diff_identical,
    bench_diff_drifted,
    bench_plan
);
criterion_main!(benches);
