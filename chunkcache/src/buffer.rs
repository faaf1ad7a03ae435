//! Per-object read path: chunk lookup, fetch, persistence and prefetch.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use anyhow::anyhow;
use cadence::prelude::*;
use hyper::body::Bytes;
use hyper::StatusCode;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, Sender};
use tokio::task;
use tracing::{debug, info, trace, warn};

use crate::config::CacheConfig;
use crate::eviction;
use crate::store::ChunkStore;
use crate::transport::Transport;
use crate::utils::{check_object_id, chunk_window};
use crate::{Error, Object};

/// An in-flight chunk fetch that later readers of the same chunk can join.
struct PendingFetch {
    /// Distinguishes this fetch from later fetches of the same chunk.
    id: u64,
    receiver: broadcast::Receiver<Result<Bytes, Error>>,
}

/// Who initiated a read.
///
/// Only consumer reads chain a prefetch of the following chunk; otherwise the
/// two kinds take the same path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadKind {
    /// A read issued by a consumer of the buffer.
    Consumer,

    /// A background read issued by the buffer itself to warm the cache.
    Prefetch,
}

/// The cache engine for one remote object.
///
/// Buffers are shared between all consumers of the same object and are handed
/// out by a [`Registry`](crate::Registry).
pub struct ObjectBuffer {
    object: Object,
    transport: Arc<dyn Transport>,
    store: ChunkStore,
    config: Arc<CacheConfig>,
    prefetch: AtomicBool,
    /// Prefetch tasks spawned and not yet finished.
    prefetches: AtomicUsize,
    /// In-flight chunk fetches, keyed by chunk offset.
    pending_requests: Mutex<HashMap<u64, PendingFetch>>,
    next_fetch_id: AtomicU64,
}

impl ObjectBuffer {
    /// Create a buffer for `object`, creating its chunk directory.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        object: Object,
        config: Arc<CacheConfig>,
    ) -> Result<Self, Error> {
        check_object_id(&object.id)?;
        info!("starting playback of {}", object.name);
        debug!(object_id = %object.id, "creating buffer");

        let store = ChunkStore::create(config.dir.join(&object.id)).map_err(|err| {
            debug!(object_id = %object.id, "{err}");
            Error::CreateDir {
                object_id: object.id.clone(),
                source: Arc::new(err),
            }
        })?;

        Ok(Self {
            object,
            transport,
            store,
            prefetch: AtomicBool::new(config.prefetch),
            config,
            prefetches: Default::default(),
            pending_requests: Default::default(),
            next_fetch_id: Default::default(),
        })
    }

    /// The object served by this buffer.
    pub fn object(&self) -> &Object {
        &self.object
    }

    /// The directory holding this object's chunk files.
    pub fn chunk_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Whether new prefetch chains may still be started.
    pub fn prefetch_enabled(&self) -> bool {
        self.prefetch.load(SeqCst)
    }

    /// Number of chunk fetches currently in flight.
    pub fn pending_fetches(&self) -> usize {
        self.pending_requests.lock().len()
    }

    /// Number of prefetch tasks that have been spawned and not yet finished,
    /// including those still checking the disk before any fetch starts.
    pub fn pending_prefetches(&self) -> usize {
        self.prefetches.load(SeqCst)
    }

    /// Stop chaining new prefetches. Prefetches already running are not
    /// interrupted.
    pub(crate) fn disable_prefetch(&self) {
        self.prefetch.store(false, SeqCst);
    }

    /// Read up to `size` bytes starting at `start`.
    ///
    /// The result never extends past the chunk containing `start`, and is
    /// shorter than `size` near the end of that chunk or of the object.
    pub async fn read_bytes(self: &Arc<Self>, start: u64, size: u64) -> Result<Bytes, Error> {
        self.read(start, size, ReadKind::Consumer).await
    }

    /// Read up to `size` bytes starting at `start`, on behalf of `kind`.
    pub async fn read(
        self: &Arc<Self>,
        start: u64,
        size: u64,
        kind: ReadKind,
    ) -> Result<Bytes, Error> {
        if size == 0 {
            return Err(Error::BadRange {
                object_id: self.object.id.clone(),
                start,
                size,
            });
        }

        let Some((offset, offset_end)) = chunk_window(start, self.config.chunk_size) else {
            return Err(Error::BadRange {
                object_id: self.object.id.clone(),
                start,
                size,
            });
        };
        let pos = start - offset;
        debug!(
            object_id = %self.object.id,
            offset,
            offset_end,
            ?kind,
            "getting object bytes",
        );

        match self.store.read_at(offset, pos, size).await {
            Ok(Some(bytes)) => {
                debug!(object_id = %self.object.id, offset, offset_end, "found in cache");
                self.config.metrics.incr("cache.hit").ok();
                return Ok(bytes);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(object_id = %self.object.id, offset, "could not read cached chunk: {err}");
            }
        }
        self.config.metrics.incr("cache.miss").ok();

        let bytes = self.get_shared_chunk(offset, offset_end).await?;

        if kind == ReadKind::Consumer && self.prefetch_enabled() && offset_end < self.object.size {
            self.spawn_prefetch(offset_end + 1, size);
        }

        let len = bytes.len() as u64;
        let lo = pos.min(len);
        let hi = pos.saturating_add(size).min(len);
        Ok(bytes.slice(lo as usize..hi as usize))
    }

    /// Fetch a chunk, joining an in-flight fetch of the same chunk if there is
    /// one.
    async fn get_shared_chunk(
        self: &Arc<Self>,
        offset: u64,
        offset_end: u64,
    ) -> Result<Bytes, Error> {
        let (fetch_id, mut receiver) = {
            use std::collections::hash_map::Entry::*;
            match self.pending_requests.lock().entry(offset) {
                Occupied(o) => {
                    trace!(object_id = %self.object.id, offset, "joining pending fetch");
                    self.config.metrics.incr("cache.fetch_joined").ok();
                    let pending = o.get();
                    (pending.id, pending.receiver.resubscribe())
                }
                Vacant(v) => {
                    // Spawn a task to fetch the chunk to insulate from request cancellation
                    let (tx, rx) = broadcast::channel(1);
                    let id = self.next_fetch_id.fetch_add(1, SeqCst);
                    let this = Arc::clone(self);
                    let receiver = rx.resubscribe();
                    task::spawn(async move { this.fetch(offset, offset_end, tx).await });
                    v.insert(PendingFetch { id, receiver: rx });
                    (id, receiver)
                }
            }
        };

        match receiver.recv().await {
            Ok(result) => result,
            Err(_) => {
                // The fetch task died without publishing. Only clear its own
                // entry; a newer fetch of this chunk may have replaced it.
                let mut pending = self.pending_requests.lock();
                if pending.get(&offset).map_or(false, |p| p.id == fetch_id) {
                    pending.remove(&offset);
                }
                drop(pending);
                Err(anyhow!(
                    "pending fetch dropped for object {} bytes {offset}-{offset_end}",
                    self.object.id,
                )
                .into())
            }
        }
    }

    /// Run a chunk fetch and broadcast its result to all waiters.
    async fn fetch(&self, offset: u64, offset_end: u64, tx: Sender<Result<Bytes, Error>>) {
        let result = self.try_fetch(offset, offset_end).await;

        if let Some(_rx) = self.pending_requests.lock().remove(&offset) {
            tx.send(result).ok();
        }
    }

    async fn try_fetch(&self, offset: u64, offset_end: u64) -> Result<Bytes, Error> {
        // A fetch that finished just before this one was registered has
        // already written the chunk.
        if let Ok(Some(bytes)) = self.store.read_chunk(offset).await {
            trace!(object_id = %self.object.id, offset, "chunk written by a concurrent fetch");
            return Ok(bytes);
        }

        if self.config.quota_enabled() {
            self.make_room(offset, offset_end).await?;
        }

        debug!(
            object_id = %self.object.id,
            offset,
            offset_end,
            "requesting object bytes from backend",
        );
        let resp = self
            .transport
            .get_range(&self.object.url, offset, offset_end)
            .await
            .map_err(|err| Error::from_transport(err, &self.object.id, offset, offset_end))?;

        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::Status {
                object_id: self.object.id.clone(),
                offset,
                offset_end,
                status: resp.status(),
            });
        }

        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|err| Error::Body {
                object_id: self.object.id.clone(),
                offset,
                offset_end,
                source: Arc::new(err),
            })?;

        self.store
            .write_chunk(offset, bytes.clone())
            .await
            .map_err(|err| Error::Io {
                object_id: self.object.id.clone(),
                offset,
                offset_end,
                source: Arc::new(err),
            })?;
        self.config
            .metrics
            .count("cache.fetch_bytes", bytes.len() as i64)
            .ok();

        Ok(bytes)
    }

    /// Enforce the disk quota before writing the chunk at `offset`.
    async fn make_room(&self, offset: u64, offset_end: u64) -> Result<(), Error> {
        let root = self.config.dir.clone();
        let chunk_size = self.config.chunk_size;
        let max_size = self.config.max_size;

        let evicted =
            task::spawn_blocking(move || eviction::ensure_capacity(&root, chunk_size, max_size))
                .await
                .map_err(io::Error::from)
                .and_then(|result| result)
                .map_err(|err| {
                    debug!(object_id = %self.object.id, "{err}");
                    Error::Quota {
                        object_id: self.object.id.clone(),
                        offset,
                        offset_end,
                        source: Arc::new(err),
                    }
                })?;

        if let Some(path) = evicted {
            debug!("evicted chunk {}", path.display());
            self.config.metrics.incr("cache.evicted").ok();
        }
        Ok(())
    }

    /// Start a detached read of the chunk containing `start`.
    ///
    /// The release flag is checked again when the task starts running, so a
    /// buffer released in the meantime does not fetch anything.
    fn spawn_prefetch(self: &Arc<Self>, start: u64, size: u64) {
        self.config.metrics.incr("cache.prefetch").ok();
        self.prefetches.fetch_add(1, SeqCst);
        let this = Arc::clone(self);
        task::spawn(async move {
            if this.prefetch_enabled() {
                if let Err(err) = this.read(start, size, ReadKind::Prefetch).await {
                    warn!(object_id = %this.object.id, start, "prefetch failed: {err}");
                    this.config.metrics.incr("cache.prefetch_failed").ok();
                }
            }
            this.prefetches.fetch_sub(1, SeqCst);
        });
    }
}

impl std::fmt::Debug for ObjectBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBuffer")
            .field("object", &self.object)
            .field("chunk_dir", &self.store.dir())
            .field("prefetch", &self.prefetch_enabled())
            .finish()
    }
}
