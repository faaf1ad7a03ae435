//! Chunk arithmetic and file system utilities used by the cache.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::anyhow;

use crate::Error;

/// Prefix of temporary files created next to chunk files while writing.
pub(crate) const TEMP_PREFIX: &str = ".tmp";

/// Returns the chunk window `(offset, offset_end)` containing `start`.
///
/// `offset` is the largest multiple of `chunk_size` not exceeding `start`, and
/// `offset_end` is `offset + chunk_size`. Returns `None` if `offset_end` does
/// not fit in a `u64`.
pub fn chunk_window(start: u64, chunk_size: u64) -> Option<(u64, u64)> {
    let offset = start - start % chunk_size;
    Some((offset, offset.checked_add(chunk_size)?))
}

/// Checks that an object identifier can be used as a single path component.
pub(crate) fn check_object_id(id: &str) -> Result<(), Error> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.starts_with(TEMP_PREFIX)
        || id.contains(&['/', '\\', '\0'][..]);
    if invalid {
        return Err(Error::InvalidObjectId(id.to_owned()));
    }
    Ok(())
}

/// Writes data to a destination path atomically, replacing any file already
/// present there.
///
/// The data is written to a temporary file in the destination directory and
/// then renamed into place, so readers never observe a partially written file.
/// The parent directory and its ancestors are created if they are missing.
pub(crate) fn atomic_write(data: &[u8], dest: impl AsRef<Path>) -> anyhow::Result<()> {
    let dest = dest.as_ref();
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("no parent in destination path {dest:?}"))?;

    fs::create_dir_all(parent)?;
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    {
        let mut writer = BufWriter::with_capacity(1 << 21, &mut file);
        writer.write_all(data)?;
        writer.flush()?;
    }
    file.as_file().sync_data()?;

    // Concurrent writers of the same chunk race here; the last rename wins.
    file.persist(dest).map_err(|err| err.error)?;
    Ok(())
}
