//! Disk quota enforcement for the chunk storage tree.
//!
//! Before a new chunk is written, the total size of all files under the cache
//! root is compared against the quota. If the incoming chunk would push usage
//! over it, the single file with the oldest modification time anywhere under
//! the root is deleted. Directories are never removed.
//!
//! One victim is reclaimed per call. Concurrent writers may therefore overshoot
//! the quota by about one chunk each, which is acceptable because evicted
//! chunks are simply fetched again on demand.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;
use walkdir::WalkDir;

use crate::utils::TEMP_PREFIX;

/// Usage of the chunk storage tree, gathered in a single walk.
#[derive(Debug, Default)]
pub struct DirUsage {
    /// Total size of all files in bytes.
    pub total_bytes: u64,

    /// Number of files found.
    pub files: u64,

    /// The file with the oldest modification time, if any.
    pub oldest: Option<(PathBuf, SystemTime)>,
}

/// Walk `root` recursively, summing file sizes and tracking the oldest file.
///
/// A missing root counts as empty. Entries that disappear during the walk,
/// for example chunks removed by a concurrent eviction, are skipped. Temporary
/// files of in-progress writes count toward the total but are never chosen as
/// the oldest file.
pub fn dir_usage(root: &Path) -> io::Result<DirUsage> {
    let mut usage = DirUsage::default();
    if !root.exists() {
        return Ok(usage);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(err.into()),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(err.into()),
        };

        usage.total_bytes += metadata.len();
        usage.files += 1;

        let is_temp = entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with(TEMP_PREFIX));
        if is_temp {
            continue;
        }
        let modified = metadata.modified()?;
        match &usage.oldest {
            Some((_, oldest)) if *oldest <= modified => {}
            _ => usage.oldest = Some((entry.into_path(), modified)),
        }
    }

    Ok(usage)
}

/// Make room for one more chunk of `chunk_size` bytes under `root`.
///
/// Deletes the globally oldest file when `total + chunk_size > max_size`, and
/// returns its path. Returns `None` if the quota still has room or there was
/// nothing to delete.
pub fn ensure_capacity(root: &Path, chunk_size: u64, max_size: u64) -> io::Result<Option<PathBuf>> {
    let usage = dir_usage(root)?;
    if usage.total_bytes + chunk_size <= max_size {
        return Ok(None);
    }

    let Some((victim, modified)) = usage.oldest else {
        return Ok(None);
    };
    debug!(
        total_bytes = usage.total_bytes,
        max_size,
        ?modified,
        "deleting oldest chunk {}",
        victim.display(),
    );
    match fs::remove_file(&victim) {
        Ok(()) => Ok(Some(victim)),
        // Another writer evicted the same file first.
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map_or(false, |err| err.kind() == io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use anyhow::Result;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::tempdir;

    use super::{dir_usage, ensure_capacity};

    fn write_aged(path: &Path, len: usize, unix_secs: i64) -> Result<()> {
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, vec![7u8; len])?;
        set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0))?;
        Ok(())
    }

    #[test]
    fn usage_of_missing_root_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let usage = dir_usage(&dir.path().join("missing"))?;
        assert_eq!(usage.total_bytes, 0);
        assert_eq!(usage.files, 0);
        assert!(usage.oldest.is_none());
        Ok(())
    }

    #[test]
    fn usage_counts_nested_files() -> Result<()> {
        let dir = tempdir()?;
        write_aged(&dir.path().join("a/0"), 100, 1_000)?;
        write_aged(&dir.path().join("a/100"), 50, 3_000)?;
        write_aged(&dir.path().join("b/0"), 25, 2_000)?;

        let usage = dir_usage(dir.path())?;
        assert_eq!(usage.total_bytes, 175);
        assert_eq!(usage.files, 3);
        assert_eq!(usage.oldest.unwrap().0, dir.path().join("a/0"));
        Ok(())
    }

    #[test]
    fn no_eviction_below_quota() -> Result<()> {
        let dir = tempdir()?;
        write_aged(&dir.path().join("a/0"), 1024, 1_000)?;

        assert_eq!(ensure_capacity(dir.path(), 1024, 2048)?, None);
        assert!(dir.path().join("a/0").exists());
        Ok(())
    }

    #[test]
    fn evicts_globally_oldest_file() -> Result<()> {
        let dir = tempdir()?;
        write_aged(&dir.path().join("current/0"), 1024, 5_000)?;
        write_aged(&dir.path().join("current/1024"), 1024, 4_000)?;
        write_aged(&dir.path().join("other/0"), 1024, 1_000)?;

        let victim = ensure_capacity(dir.path(), 1024, 3 * 1024)?;
        assert_eq!(victim, Some(dir.path().join("other/0")));
        assert!(!dir.path().join("other/0").exists());
        assert!(dir.path().join("current/0").exists());
        assert!(dir.path().join("current/1024").exists());

        // Directories survive even when emptied.
        assert!(dir.path().join("other").is_dir());
        Ok(())
    }

    #[test]
    fn evicts_one_file_per_call() -> Result<()> {
        let dir = tempdir()?;
        for i in 0..4 {
            write_aged(&dir.path().join(format!("a/{}", i * 1024)), 1024, 1_000 + i)?;
        }

        // Far over quota, yet only one file is reclaimed.
        let victim = ensure_capacity(dir.path(), 1024, 1024)?;
        assert_eq!(victim, Some(dir.path().join("a/0")));
        assert_eq!(dir_usage(dir.path())?.files, 3);
        Ok(())
    }

    #[test]
    fn temporary_files_are_never_victims() -> Result<()> {
        let dir = tempdir()?;
        write_aged(&dir.path().join("a/.tmpXYZ"), 1024, 1)?;
        write_aged(&dir.path().join("a/0"), 1024, 1_000)?;

        let victim = ensure_capacity(dir.path(), 1024, 2048)?;
        assert_eq!(victim, Some(dir.path().join("a/0")));
        assert!(dir.path().join("a/.tmpXYZ").exists());
        Ok(())
    }
}
