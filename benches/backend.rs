//! Tile backend benchmarks for tilebuf
//!
//! Measures the command paths a compositor hits most:
//!
//! - set + get of fresh tiles per backend (allocation, queueing, read-through)
//! - rewriting one hot tile (coalescing in the writer queue)
//! - building a mip level from four children

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;
use tilebuf::{PixelFormat, Tile, TileBackend, TileConfig, TileContext, TileKey, TileLayout, ZoomCache};

fn layout() -> TileLayout {
    TileLayout::new(64, 64, PixelFormat::rgba_u8()).unwrap()
}

fn fill(backend: &dyn TileBackend, count: i32, tile: &Tile) {
    for i in 0..count {
        backend.set(TileKey::new(i % 64, i / 64, 0), tile).unwrap();
    }
}

fn bench_set_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_set_get");
    let tile = Tile::from_data(vec![0x7fu8; layout().tile_size()], 1);

    for count in [64, 512].iter() {
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("ram", count), count, |b, &count| {
            let ctx = TileContext::new(TileConfig::default()).unwrap();
            b.iter(|| {
                let ram = ctx.ram(layout());
                fill(&ram, count, &tile);
                black_box(ram.get(TileKey::new(0, 0, 0)).unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("swap", count), count, |b, &count| {
            let dir = tempdir().unwrap();
            let ctx = TileContext::new(TileConfig::default().with_swap_dir(dir.path())).unwrap();
            b.iter(|| {
                let swap = ctx.swap(layout());
                fill(&swap, count, &tile);
                black_box(swap.get(TileKey::new(0, 0, 0)).unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("file", count), count, |b, &count| {
            let dir = tempdir().unwrap();
            let ctx = TileContext::new(TileConfig::default().with_swap_dir(dir.path())).unwrap();
            let mut round = 0u32;
            b.iter(|| {
                round += 1;
                let path = dir.path().join(format!("bench-{}.gegl", round));
                let file = ctx.file(&path, Some(layout())).unwrap();
                fill(&file, count, &tile);
                file.flush().unwrap();
                black_box(file.get(TileKey::new(0, 0, 0)).unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("mapped", count), count, |b, &count| {
            let dir = tempdir().unwrap();
            let ctx = TileContext::new(TileConfig::default().with_swap_dir(dir.path())).unwrap();
            let mut round = 0u32;
            b.iter(|| {
                round += 1;
                let path = dir.path().join(format!("bench-{}.gegl", round));
                let mapped = ctx.mapped(&path, Some(layout())).unwrap();
                fill(&mapped, count, &tile);
                mapped.flush().unwrap();
                black_box(mapped.get(TileKey::new(0, 0, 0)).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_hot_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_hot_tile");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("file_rewrite", |b| {
        let dir = tempdir().unwrap();
        let ctx = TileContext::new(TileConfig::default().with_swap_dir(dir.path())).unwrap();
        let file = ctx.file(dir.path().join("hot.gegl"), Some(layout())).unwrap();
        let key = TileKey::new(3, 3, 0);
        let mut tile = Tile::zeroed(layout().tile_size());

        b.iter(|| {
            for i in 0..1000u32 {
                tile.data_mut()[0] = i as u8;
                file.set(key, &tile).unwrap();
            }
            black_box(file.get(key).unwrap())
        });
    });

    group.finish();
}

fn bench_zoom(c: &mut Criterion) {
    let mut group = c.benchmark_group("zoom_build");

    for format in [PixelFormat::rgba_u8(), PixelFormat::rgba_float()] {
        let name = format.description().to_string();
        let layout = TileLayout::new(64, 64, format).unwrap();
        let tile = Tile::from_data(vec![0x3cu8; layout.tile_size()], 1);

        group.bench_function(BenchmarkId::new("level1", name), |b| {
            let ctx = TileContext::new(TileConfig::default()).unwrap();
            b.iter(|| {
                let zoom = ZoomCache::new(ctx.ram(layout.clone()));
                for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    zoom.set(TileKey::new(x, y, 0), &tile).unwrap();
                }
                black_box(zoom.get(TileKey::new(0, 0, 1)).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_set_get, bench_hot_tile, bench_zoom);
criterion_main!(benches);
