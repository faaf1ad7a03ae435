use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chunkcache::transport::{http_client, Transport};
use chunkcache::{statsd, CacheConfig, Object, Registry, DEFAULT_CHUNK_SIZE};
use clap::Parser;
use shadow_rs::shadow;
use tikv_jemallocator::Jemalloc;
use tokio::time;
use tracing_subscriber::EnvFilter;

shadow!(build);

/// Read a byte range of a remote object through a chunked, disk-backed cache.
///
/// The object is fetched from `url` with HTTP range requests, one chunk at a
/// time, and every chunk is kept under the cache directory so that later reads
/// of the same object (by this or another process) are served locally.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None, long_version = Some(build::CLAP_LONG_VERSION))]
pub struct Cli {
    /// URL of the remote object. The server must support range requests.
    pub url: String,

    /// Identifier of the object, used as its chunk directory name.
    #[clap(long)]
    pub id: String,

    /// Display name used in logs. Defaults to the identifier.
    #[clap(long)]
    pub name: Option<String>,

    /// Size of the object in bytes. Discovered with a HEAD request if unset.
    #[clap(long)]
    pub size: Option<u64>,

    /// Offset of the first byte to read.
    #[clap(short, long, default_value_t = 0)]
    pub offset: u64,

    /// Number of bytes to read.
    #[clap(short, long)]
    pub length: u64,

    /// Root directory of the chunk cache.
    #[clap(short, long, env = "CHUNKCACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Chunk size in bytes. Zero selects the default of 5 MiB.
    #[clap(long, env = "CHUNKCACHE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Maximum size of the cache directory in bytes. Zero or negative values
    /// disable the quota.
    #[clap(long, env = "CHUNKCACHE_MAX_SIZE", default_value_t = 0, allow_negative_numbers = true)]
    pub max_size: i64,

    /// Do not prefetch the chunk following each cache miss.
    #[clap(long, env = "CHUNKCACHE_NO_PREFETCH")]
    pub no_prefetch: bool,

    /// Keep running until background prefetches have finished.
    #[clap(long)]
    pub wait_prefetch: bool,

    /// Disable StatsD metrics emission. By default emitted to 127.0.0.1:8125.
    #[clap(long)]
    pub no_statsd: bool,
}

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let config = CacheConfig::builder()
        .dir(args.cache_dir)
        .chunk_size(args.chunk_size)
        .max_size(args.max_size.max(0) as u64)
        .prefetch(!args.no_prefetch)
        .metrics(Arc::new(statsd::client(!args.no_statsd)?))
        .build()?;
    let registry = Registry::new(config);

    let transport = Arc::new(http_client());
    let size = match args.size {
        Some(size) => size,
        None => transport
            .head(&args.url)
            .await
            .with_context(|| format!("could not determine size of {}", args.url))?,
    };
    let name = args.name.unwrap_or_else(|| args.id.clone());
    let object = Object::new(args.id, name, args.url, size);

    let buffer = registry.acquire(transport, object)?;

    // Reads stop at chunk boundaries, so keep reading until the range is done.
    let end = args.offset.saturating_add(args.length).min(size);
    let mut pos = args.offset;
    let mut stdout = std::io::stdout().lock();
    while pos < end {
        let bytes = buffer.read_bytes(pos, end - pos).await?;
        if bytes.is_empty() {
            break;
        }
        stdout.write_all(&bytes)?;
        pos += bytes.len() as u64;
    }
    stdout.flush()?;

    // Prefetches are counted as soon as they are spawned, before they reach
    // the fetch map, so both counters must drain.
    if args.wait_prefetch {
        while buffer.pending_prefetches() > 0 || buffer.pending_fetches() > 0 {
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    buffer.release()?;
    Ok(())
}
