//! Benchmark for the voxel box optimizer
//!
//! Measures merge time for a solid cube, a hollow shell and a sparse
//! checkerboard, which sit at the two ends of the box count range.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::IVec3;
use structure_physics::optimizer::optimize;

/// Benchmark configuration
struct BenchConfig {
    edge: i32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self { edge: 32 }
    }
}

fn cells(edge: i32, keep: impl Fn(IVec3) -> bool) -> Vec<IVec3> {
    let mut out = Vec::new();
    for x in 0..edge {
        for y in 0..edge {
            for z in 0..edge {
                let p = IVec3::new(x, y, z);
                if keep(p) {
                    out.push(p);
                }
            }
        }
    }
    out
}

fn bench_solid_cube(c: &mut Criterion) {
    let config = BenchConfig::default();
    let voxels = cells(config.edge, |_| true);

    c.bench_function("optimize_solid_cube", |b| {
        b.iter(|| black_box(optimize(voxels.iter().copied())));
    });
}

fn bench_hollow_shell(c: &mut Criterion) {
    let config = BenchConfig::default();
    let edge = config.edge;
    let voxels = cells(edge, |p| {
        p.min_element() == 0 || p.max_element() == edge - 1
    });

    c.bench_function("optimize_hollow_shell", |b| {
        b.iter(|| black_box(optimize(voxels.iter().copied())));
    });
}

fn bench_checkerboard(c: &mut Criterion) {
    let config = BenchConfig::default();
    // Worst case: no two voxels merge
    let voxels = cells(config.edge / 2, |p| (p.x + p.y + p.z) % 2 == 0);

    c.bench_function("optimize_checkerboard", |b| {
        b.iter(|| black_box(optimize(voxels.iter().copied())));
    });
}

criterion_group!(
    benches,
    bench_solid_cube,
    bench_hollow_shell,
    bench_checkerboard,
);

criterion_main!(benches);
