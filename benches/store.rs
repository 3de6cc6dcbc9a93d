use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, black_box};

use voxdata::core::DataConfig;
use voxdata::math::Aabb;
use voxdata::streaming::WorldSave;
use voxdata::voxel::{
    LockKind, NoiseGenerator, NoiseParams, QueryZone, VoxelData, VoxelValue,
};

use glam::IVec3;

fn noise_store(config: DataConfig) -> VoxelData {
    let generator = NoiseGenerator::new(NoiseParams::default());
    VoxelData::new(config, Arc::new(generator)).unwrap()
}

fn sphere(center: IVec3, radius: f32) -> impl FnMut(IVec3, &mut VoxelValue) {
    move |p, v| {
        let d = (p - center).as_vec3().length() - radius;
        *v = VoxelValue(v.0.min(d));
    }
}

fn bench_set_sphere(c: &mut Criterion) {
    let data = noise_store(DataConfig::with_depth(6));
    let bounds = Aabb::from_center_half_extent(IVec3::ZERO, 12);
    let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "bench").unwrap();

    c.bench_function("set_sphere_r12", |b| {
        b.iter(|| data.set::<VoxelValue>(black_box(bounds), sphere(IVec3::ZERO, 12.0)));
    });
    data.unlock(lock);
}

fn bench_set_sphere_with_undo(c: &mut Criterion) {
    let config = DataConfig {
        enable_undo_redo: true,
        ..DataConfig::with_depth(6)
    };
    let data = noise_store(config);
    let bounds = Aabb::from_center_half_extent(IVec3::ZERO, 12);
    let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "bench").unwrap();

    c.bench_function("set_sphere_r12_undo", |b| {
        let mut radius = 4.0;
        b.iter(|| {
            radius = if radius >= 12.0 { 4.0 } else { radius + 1.0 };
            data.set::<VoxelValue>(black_box(bounds), sphere(IVec3::ZERO, radius));
            data.save_frame(bounds);
        });
    });
    data.unlock(lock);
}

fn bench_get_zone(c: &mut Criterion) {
    let data = noise_store(DataConfig::with_depth(6));
    let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "bench").unwrap();
    data.set::<VoxelValue>(
        Aabb::from_center_half_extent(IVec3::ZERO, 16),
        sphere(IVec3::ZERO, 16.0),
    );

    for lod in [0u8, 2] {
        let zone = QueryZone::new(Aabb::from_center_half_extent(IVec3::ZERO, 32), lod);
        let mut out = vec![VoxelValue::default(); zone.len()];
        c.bench_function(&format!("get_zone_64_lod{}", lod), |b| {
            b.iter(|| data.get(black_box(&zone), lod, &mut out));
        });
    }
    data.unlock(lock);
}

fn bench_point_access(c: &mut Criterion) {
    let data = noise_store(DataConfig::with_depth(6));
    let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "bench").unwrap();

    c.bench_function("accelerator_row_1024", |b| {
        b.iter(|| {
            let mut acc = data.accelerator();
            for x in 0..1024 {
                let p = IVec3::new(x % 64, 3, x / 64);
                black_box(acc.get_value(p));
            }
        });
    });
    data.unlock(lock);
}

fn bench_archive(c: &mut Criterion) {
    let data = noise_store(DataConfig::with_depth(6));
    let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "bench").unwrap();
    data.set::<VoxelValue>(
        Aabb::from_center_half_extent(IVec3::ZERO, 32),
        sphere(IVec3::ZERO, 30.0),
    );
    let save = data.save();
    data.unlock(lock);

    c.bench_function("archive_compress", |b| {
        b.iter(|| save.compress().unwrap());
    });

    let bytes = save.compress().unwrap();
    c.bench_function("archive_decompress", |b| {
        b.iter(|| WorldSave::decompress(black_box(&bytes)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_set_sphere,
    bench_set_sphere_with_undo,
    bench_get_zone,
    bench_point_access,
    bench_archive,
);
criterion_main!(benches);
