use std::sync::Arc;
use std::time::{Duration, Instant};

use chunkcache::test_transport::Memory;
use chunkcache::{CacheConfig, Object, Registry};
use criterion::{black_box, criterion_group, criterion_main, Criterion, SamplingMode};
use tikv_jemallocator::Jemalloc;
use tokio::runtime::Runtime;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const CHUNK_SIZE: u64 = 1 << 20;
const OBJECT_SIZE: usize = 64 << 20;
const URL: &str = "memory://bench";

fn backend() -> Arc<Memory> {
    let memory = Memory::new();
    memory.insert(URL, vec![42u8; OBJECT_SIZE]);
    Arc::new(memory)
}

fn registry(dir: &std::path::Path) -> Registry {
    let config = CacheConfig::builder()
        .dir(dir)
        .chunk_size(CHUNK_SIZE)
        .prefetch(false)
        .build()
        .unwrap();
    Registry::new(config)
}

/// Read a whole object sequentially, 128 KiB at a time.
async fn read_sequential(registry: &Registry, backend: Arc<Memory>) -> anyhow::Result<()> {
    let object = Object::new("bench", "bench", URL, OBJECT_SIZE as u64);
    let buffer = registry.acquire(backend, object)?;
    let mut pos = 0;
    while pos < OBJECT_SIZE as u64 {
        let bytes = buffer.read_bytes(pos, 128 << 10).await?;
        pos += bytes.len() as u64;
        black_box(bytes);
    }
    buffer.release()?;
    Ok(())
}

fn bench_sequential(c: &mut Criterion) {
    let mut g = c.benchmark_group("sequential_64m");
    g.sampling_mode(SamplingMode::Flat);
    g.sample_size(10);
    g.measurement_time(Duration::from_secs(20));

    let backend = backend();

    g.bench_function("cold", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let runtime = Runtime::new().unwrap();
                let dir = tempfile::tempdir().unwrap();
                let registry = registry(dir.path());
                let start = Instant::now();
                runtime
                    .block_on(read_sequential(&registry, Arc::clone(&backend)))
                    .unwrap();
                total += start.elapsed();
            }
            total
        })
    });

    let runtime = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    runtime
        .block_on(read_sequential(&registry, Arc::clone(&backend)))
        .unwrap();

    g.bench_function("warm", |b| {
        b.to_async(&runtime).iter(|| async {
            read_sequential(&registry, Arc::clone(&backend))
                .await
                .unwrap();
        });
    });

    g.finish();
}

criterion_group!(benches, bench_sequential);
criterion_main!(benches);
