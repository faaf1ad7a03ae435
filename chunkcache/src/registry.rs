//! Process-wide map from object identifiers to shared, reference-counted
//! buffers.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use cadence::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::buffer::ObjectBuffer;
use crate::config::{CacheConfig, DEFAULT_CHUNK_SIZE};
use crate::transport::Transport;
use crate::{Error, Object};

/// Hands out one shared [`ObjectBuffer`] per object identifier.
///
/// Cloning a registry is cheap and yields a handle to the same map.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RegistryState>,
}

struct RegistryEntry {
    buffer: Arc<ObjectBuffer>,
    refcount: usize,
}

struct RegistryState {
    config: Arc<CacheConfig>,
    buffers: Mutex<HashMap<String, RegistryEntry>>,
    buffers_created: AtomicU64,
    buffers_removed: AtomicU64,
}

/// Counters describing the registry's buffer lifecycle.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Buffers currently registered.
    pub open_buffers: u64,

    /// Buffers constructed since the registry was created.
    pub buffers_created: u64,

    /// Registry entries removed after their last release.
    pub buffers_removed: u64,
}

impl Registry {
    /// Create an empty registry with the given configuration.
    pub fn new(mut config: CacheConfig) -> Self {
        if config.chunk_size == 0 {
            debug!("chunk size was 0, setting to default (5 MiB)");
            config.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        Self {
            state: Arc::new(RegistryState {
                config: Arc::new(config),
                buffers: Default::default(),
                buffers_created: Default::default(),
                buffers_removed: Default::default(),
            }),
        }
    }

    /// The configuration shared by all buffers of this registry.
    pub fn config(&self) -> &CacheConfig {
        &self.state.config
    }

    /// Get the buffer for `object`, creating it if no consumer holds one.
    ///
    /// The transport is only used when a new buffer is constructed; an
    /// existing buffer keeps the transport it was created with.
    ///
    /// This is a blocking call. Creating a new buffer creates its chunk
    /// directory while the registry lock is held, so `acquire` and `release`
    /// calls for every other object wait on that filesystem operation. Async
    /// callers that acquire many new objects concurrently may want to go
    /// through [`tokio::task::spawn_blocking`].
    pub fn acquire(
        &self,
        transport: Arc<dyn Transport>,
        object: Object,
    ) -> Result<BufferHandle, Error> {
        use std::collections::hash_map::Entry::*;

        let mut buffers = self.state.buffers.lock();
        let buffer = match buffers.entry(object.id.clone()) {
            Occupied(mut o) => {
                let entry = o.get_mut();
                entry.refcount += 1;
                Arc::clone(&entry.buffer)
            }
            Vacant(v) => {
                // Construction happens under the lock so that concurrent first
                // acquirers never build two buffers for the same object.
                let buffer = Arc::new(ObjectBuffer::new(
                    transport,
                    object,
                    Arc::clone(&self.state.config),
                )?);
                self.state.buffers_created.fetch_add(1, Relaxed);
                v.insert(RegistryEntry {
                    buffer: Arc::clone(&buffer),
                    refcount: 1,
                });
                buffer
            }
        };
        self.state
            .config
            .metrics
            .gauge("registry.open_buffers", buffers.len() as u64)
            .ok();

        Ok(BufferHandle {
            buffer,
            state: Arc::clone(&self.state),
            released: false,
        })
    }

    /// Release a buffer handle. Equivalent to [`BufferHandle::release`].
    pub fn release(&self, handle: BufferHandle) -> Result<(), Error> {
        handle.release()
    }

    /// Current lifecycle counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            open_buffers: self.state.buffers.lock().len() as u64,
            buffers_created: self.state.buffers_created.load(Relaxed),
            buffers_removed: self.state.buffers_removed.load(Relaxed),
        }
    }
}

impl RegistryState {
    fn release(&self, buffer: &Arc<ObjectBuffer>) -> Result<(), Error> {
        let id = &buffer.object().id;
        let mut buffers = self.buffers.lock();
        let entry = match buffers.get_mut(id) {
            Some(entry) if Arc::ptr_eq(&entry.buffer, buffer) => entry,
            _ => return Err(Error::NotRegistered(id.clone())),
        };

        entry.refcount -= 1;
        if entry.refcount == 0 {
            info!("stopping playback of {}", buffer.object().name);
            debug!(object_id = %id, "stop buffering");
            buffer.disable_prefetch();
            buffers.remove(id);
            self.buffers_removed.fetch_add(1, Relaxed);
            self.config
                .metrics
                .gauge("registry.open_buffers", buffers.len() as u64)
                .ok();
        }
        Ok(())
    }
}

/// A consumer's reference to a shared [`ObjectBuffer`].
///
/// Dereferences to the buffer. Dropping the handle releases it; use
/// [`BufferHandle::release`] to observe release errors.
pub struct BufferHandle {
    buffer: Arc<ObjectBuffer>,
    state: Arc<RegistryState>,
    released: bool,
}

impl BufferHandle {
    /// Give up this consumer's reference. The last release of a buffer stops
    /// its prefetching and removes it from the registry; its chunk files stay
    /// on disk.
    pub fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.state.release(&self.buffer)
    }
}

impl Deref for BufferHandle {
    type Target = Arc<ObjectBuffer>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.state.release(&self.buffer) {
                error!("failed to release buffer: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::Registry;
    use crate::config::{CacheConfig, DEFAULT_CHUNK_SIZE};
    use crate::test_transport::Memory;
    use crate::{Error, Object};

    fn object(id: &str) -> Object {
        Object::new(id, format!("{id}.mkv"), format!("memory://{id}"), 4096)
    }

    #[test]
    fn zero_chunk_size_uses_default() -> Result<()> {
        let dir = tempdir()?;
        let config = CacheConfig::builder()
            .dir(dir.path())
            .chunk_size(0)
            .build()?;
        let registry = Registry::new(config);
        assert_eq!(registry.config().chunk_size, DEFAULT_CHUNK_SIZE);
        Ok(())
    }

    #[test]
    fn acquire_shares_one_buffer() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(CacheConfig::builder().dir(dir.path()).build()?);
        let transport = Arc::new(Memory::new());

        let a = registry.acquire(transport.clone(), object("obj"))?;
        let b = registry.acquire(transport.clone(), object("obj"))?;
        assert!(Arc::ptr_eq(&*a, &*b));
        assert!(a.chunk_dir().is_dir());
        assert_eq!(a.chunk_dir(), dir.path().join("obj"));

        let buffer = Arc::clone(&*a);
        registry.release(a)?;
        assert!(buffer.prefetch_enabled());
        assert_eq!(registry.stats().open_buffers, 1);

        b.release()?;
        assert!(!buffer.prefetch_enabled());
        assert_eq!(registry.stats().open_buffers, 0);
        assert_eq!(registry.stats().buffers_created, 1);
        assert_eq!(registry.stats().buffers_removed, 1);

        // Chunk directory is kept for the next session.
        assert!(dir.path().join("obj").is_dir());
        Ok(())
    }

    #[test]
    fn drop_releases_handle() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(CacheConfig::builder().dir(dir.path()).build()?);
        {
            let _handle = registry.acquire(Arc::new(Memory::new()), object("obj"))?;
            assert_eq!(registry.stats().open_buffers, 1);
        }
        assert_eq!(registry.stats().open_buffers, 0);
        assert_eq!(registry.stats().buffers_removed, 1);
        Ok(())
    }

    #[test]
    fn reacquire_after_release_builds_new_buffer() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(CacheConfig::builder().dir(dir.path()).build()?);
        let transport = Arc::new(Memory::new());

        let first = registry.acquire(transport.clone(), object("obj"))?;
        let old = Arc::clone(&*first);
        first.release()?;

        let second = registry.acquire(transport, object("obj"))?;
        assert!(!Arc::ptr_eq(&old, &*second));
        assert!(second.prefetch_enabled());
        assert_eq!(registry.stats().buffers_created, 2);
        Ok(())
    }

    #[test]
    fn invalid_object_id_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(CacheConfig::builder().dir(dir.path()).build()?);
        let result = registry.acquire(Arc::new(Memory::new()), object("../escape"));
        assert!(matches!(result, Err(Error::InvalidObjectId(_))));
        assert_eq!(registry.stats().open_buffers, 0);
        Ok(())
    }

    #[test]
    fn unwritable_root_fails_construction() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"file in the way")?;

        let registry = Registry::new(CacheConfig::builder().dir(&root).build()?);
        let result = registry.acquire(Arc::new(Memory::new()), object("obj"));
        assert!(matches!(result, Err(Error::CreateDir { .. })));
        assert_eq!(registry.stats().open_buffers, 0);
        assert_eq!(registry.stats().buffers_created, 0);
        Ok(())
    }
}
