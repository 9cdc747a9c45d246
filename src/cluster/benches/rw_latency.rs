use std::sync::Arc;

use cluster::{AllocDiscipline, VertBlockCluster};
use criterion::{criterion_group, criterion_main, Criterion};
use device::{Block, BlockDevice, LocalDevice};

fn bench_cluster(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let dev: Arc<dyn BlockDevice> =
        Arc::new(LocalDevice::open(0, dir.path().join("bench.img"), 1024).unwrap());
    let cached =
        VertBlockCluster::open(vec![dev.clone()], AllocDiscipline::Linear, Some(512)).unwrap();
    let raw = VertBlockCluster::open(vec![dev], AllocDiscipline::Linear, None).unwrap();

    let block = Block::filled(0x5A);

    c.bench_function("write 4k deferred", |b| {
        let mut v = 0u64;
        b.iter(|| {
            cached.write_block(v % 1024, block.clone(), false).unwrap();
            v += 1;
        })
    });

    c.bench_function("write 4k sync", |b| {
        let mut v = 0u64;
        b.iter(|| {
            raw.write_block(v % 1024, block.clone(), true).unwrap();
            v += 1;
        })
    });

    c.bench_function("read 4k cached", |b| {
        cached.write_block(7, block.clone(), false).unwrap();
        b.iter(|| cached.read_block(7).unwrap())
    });

    c.bench_function("read 4k uncached", |b| {
        b.iter(|| raw.read_block(7).unwrap())
    });

    c.bench_function("bulk read 64 blocks", |b| {
        let ids: Vec<u64> = (0..64).collect();
        b.iter(|| raw.read_blocks(&ids).unwrap())
    });
}

criterion_group!(benches, bench_cluster);
criterion_main!(benches);
