//! Poison, check and metadata copy benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use memsan_engine::{AllocFlags, EngineConfig, ReportPolicy, ReportReason, Sanitizer};

const BASE: u64 = 0xffff_8880_0000_0000;
const SIZES: &[usize] = &[16, 64, 256, 1024, 4096, 16384];

fn engine() -> Sanitizer {
    let s = Sanitizer::new(
        EngineConfig::default()
            .with_direct_map(BASE, 256)
            .with_report_policy(ReportPolicy::Silent),
    )
    .expect("bench config");
    s.initialize();
    // 16 pages of source, 16 pages of destination.
    s.alloc_pages(0, 4, AllocFlags::ZERO);
    s.alloc_pages(16, 4, AllocFlags::ZERO);
    s
}

fn bench_poison(c: &mut Criterion) {
    let s = engine();
    let mut group = c.benchmark_group("poison");
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("poison", size), &size, |b, &n| {
            b.iter(|| s.poison(black_box(BASE + 24), n));
        });
        group.bench_with_input(BenchmarkId::new("unpoison", size), &size, |b, &n| {
            b.iter(|| s.unpoison(black_box(BASE + 24), n));
        });
    }
    group.finish();
}

fn bench_check(c: &mut Criterion) {
    let s = engine();
    let mut group = c.benchmark_group("check");
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("clean", size), &size, |b, &n| {
            b.iter(|| black_box(s.check(black_box(BASE), n, ReportReason::UninitValue)));
        });
    }
    // Silent policy: measures detection and report construction, not output.
    s.poison(BASE + 8 * 4096, 4);
    group.bench_function("poisoned_64", |b| {
        b.iter(|| black_box(s.check(black_box(BASE + 8 * 4096), 64, ReportReason::UninitValue)));
    });
    group.finish();
}

fn bench_memcpy_meta(c: &mut Criterion) {
    let s = engine();
    s.poison(BASE + 100, 300);
    let dst_base = BASE + 16 * 4096;
    let mut group = c.benchmark_group("memcpy");

    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("memsan_meta", size), &size, |b, &n| {
            b.iter(|| s.memcpy_meta(black_box(dst_base), black_box(BASE), n));
        });

        let src = vec![0xABu8; size];
        let mut dst = vec![0u8; size];
        group.bench_with_input(BenchmarkId::new("libc_baseline", size), &size, |b, &n| {
            b.iter(|| {
                // SAFETY: both buffers are `n` bytes and do not overlap.
                unsafe {
                    libc::memcpy(
                        dst.as_mut_ptr().cast(),
                        black_box(src.as_ptr()).cast(),
                        n,
                    );
                }
                black_box(&dst);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_poison, bench_check, bench_memcpy_meta);
criterion_main!(benches);
