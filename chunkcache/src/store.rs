//! On-disk chunk storage for a single object.
//!
//! Each object owns one directory under the cache root. Inside it, every
//! cached chunk is one file named by the decimal offset of the chunk's first
//! byte. A second process pointed at the same root finds the same files.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use hyper::body::Bytes;
use tokio::task;
use tracing::warn;

use crate::utils::atomic_write;

/// The chunk directory of one object.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    /// Open the chunk directory at `dir`, creating it and its ancestors if
    /// needed.
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The directory holding this object's chunks.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the chunk file starting at `offset`.
    pub fn chunk_path(&self, offset: u64) -> PathBuf {
        self.dir.join(offset.to_string())
    }

    /// Read up to `size` bytes at position `pos` within the chunk at `offset`.
    ///
    /// Returns `None` when the chunk is not cached or has no bytes at `pos`.
    /// On a hit the chunk's modification time is refreshed so that it is not
    /// the next eviction victim. The result may be shorter than `size` when
    /// the chunk file ends first.
    pub async fn read_at(&self, offset: u64, pos: u64, size: u64) -> io::Result<Option<Bytes>> {
        let path = self.chunk_path(offset);
        task::spawn_blocking(move || read_at_blocking(&path, pos, size)).await?
    }

    /// Read a whole chunk, returning `None` if it is missing or empty.
    pub async fn read_chunk(&self, offset: u64) -> io::Result<Option<Bytes>> {
        match tokio::fs::read(self.chunk_path(offset)).await {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Persist a chunk, replacing any previous content at `offset`.
    pub async fn write_chunk(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let path = self.chunk_path(offset);
        task::spawn_blocking(move || atomic_write(&data, &path))
            .await?
            .map_err(|err| match err.downcast::<io::Error>() {
                Ok(err) => err,
                Err(err) => io::Error::new(io::ErrorKind::Other, err),
            })
    }
}

fn read_at_blocking(path: &Path, pos: u64, size: u64) -> io::Result<Option<Bytes>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    file.seek(SeekFrom::Start(pos))?;

    let mut buf = Vec::with_capacity(size.min(1 << 24) as usize);
    file.take(size).read_to_end(&mut buf)?;
    if buf.is_empty() {
        return Ok(None);
    }

    // Recency is best-effort; a failure here must not fail the read.
    if let Err(err) = filetime::set_file_mtime(path, FileTime::now()) {
        warn!("could not update last modified time for {}: {err}", path.display());
    }
    Ok(Some(Bytes::from(buf)))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use filetime::{set_file_mtime, FileTime};
    use hyper::body::Bytes;
    use tempfile::tempdir;

    use super::ChunkStore;

    #[tokio::test]
    async fn missing_chunk_is_a_miss() -> Result<()> {
        let dir = tempdir()?;
        let store = ChunkStore::create(dir.path().join("obj"))?;
        assert!(store.dir().is_dir());
        assert_eq!(store.read_at(0, 0, 10).await?, None);
        assert_eq!(store.read_chunk(0).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn write_then_read_sub_ranges() -> Result<()> {
        let dir = tempdir()?;
        let store = ChunkStore::create(dir.path().join("obj"))?;
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        store.write_chunk(1024, Bytes::from(data.clone())).await?;

        assert_eq!(store.chunk_path(1024), dir.path().join("obj/1024"));
        assert_eq!(fs::read(store.chunk_path(1024))?, data);
        for (pos, size) in [(0, 1), (0, 1024), (100, 200), (1023, 1)] {
            let read = store.read_at(1024, pos, size).await?.unwrap();
            assert_eq!(read, data[pos as usize..(pos + size) as usize]);
        }
        assert_eq!(store.read_chunk(1024).await?, Some(Bytes::from(data)));
        Ok(())
    }

    #[tokio::test]
    async fn short_read_returns_available_bytes() -> Result<()> {
        let dir = tempdir()?;
        let store = ChunkStore::create(dir.path().join("obj"))?;
        store.write_chunk(0, Bytes::from_static(b"0123456789")).await?;

        let read = store.read_at(0, 6, 100).await?.unwrap();
        assert_eq!(read, Bytes::from_static(b"6789"));

        // Nothing at or past the end of the file.
        assert_eq!(store.read_at(0, 10, 100).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn empty_chunk_is_a_miss() -> Result<()> {
        let dir = tempdir()?;
        let store = ChunkStore::create(dir.path().join("obj"))?;
        fs::write(store.chunk_path(0), b"")?;
        assert_eq!(store.read_at(0, 0, 10).await?, None);
        assert_eq!(store.read_chunk(0).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn hit_refreshes_modification_time() -> Result<()> {
        let dir = tempdir()?;
        let store = ChunkStore::create(dir.path().join("obj"))?;
        store.write_chunk(0, Bytes::from_static(b"data")).await?;
        let path = store.chunk_path(0);
        set_file_mtime(&path, FileTime::from_unix_time(1_000, 0))?;

        store.read_at(0, 0, 4).await?.unwrap();
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&path)?);
        assert!(mtime.unix_seconds() > 1_000);
        Ok(())
    }
}
