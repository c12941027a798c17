//! Prefetched WAL segment directories.
//!
//! Restore replays segments one at a time; without prefetch, time spent
//! downloading is not also spent replaying. Speculative downloads land in
//! a `.walstash` directory next to the restore destination:
//!
//! ```text
//! .walstash/
//!     prefetch/
//!         000000070000EBC00000006C        complete segments
//!         running/
//!             000000070000EBC000000072/   in-progress download
//!                 .tmpXXXXXX
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;
use crate::names::SegmentName;

#[derive(Debug, Clone)]
pub struct PrefetchDirs {
    pub base: PathBuf,
    prefetched_dir: PathBuf,
    running: PathBuf,
}

impl PrefetchDirs {
    pub fn new(base: &Path) -> Self {
        let prefetched_dir = base.join(".walstash").join("prefetch");
        let running = prefetched_dir.join("running");
        Self {
            base: base.to_path_buf(),
            prefetched_dir,
            running,
        }
    }

    fn seg_dir(&self, segment: &SegmentName) -> PathBuf {
        self.running.join(segment.as_str())
    }

    /// Best-effort directory creation; failure downgrades prefetching to a
    /// no-op rather than failing the fetch.
    pub fn create(&self, segment: &SegmentName) {
        for dir in [&self.prefetched_dir, &self.running, &self.seg_dir(segment)] {
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!(
                    dir = %dir.display(),
                    "could not create prefetch directory: {e}"
                );
            }
        }
    }

    /// Whether a complete prefetched copy of the segment exists.
    pub fn contains(&self, segment: &SegmentName) -> bool {
        self.prefetched_dir.join(segment.as_str()).is_file()
    }

    /// Whether a download of the segment appears to be in progress.
    pub fn is_running(&self, segment: &SegmentName) -> bool {
        self.seg_dir(segment).is_dir()
    }

    /// Bytes downloaded so far by an in-progress prefetch, for progress
    /// probing. A missing directory reads as zero.
    pub fn running_size(&self, segment: &SegmentName) -> u64 {
        let mut bytes = 0;
        if let Ok(entries) = fs::read_dir(self.seg_dir(segment)) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    bytes += meta.len();
                }
            }
        }
        bytes
    }

    /// Move a complete prefetched segment into place at `destination`.
    pub fn promote(&self, segment: &SegmentName, destination: &Path) -> Result<()> {
        fs::rename(self.prefetched_dir.join(segment.as_str()), destination)?;
        Ok(())
    }

    /// Drop prefetch state for segments outside the retained window.
    pub fn clear_except(&self, retained: &[SegmentName]) {
        let keep: Vec<&str> = retained.iter().map(|s| s.as_str()).collect();

        if let Ok(entries) = fs::read_dir(&self.running) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if SegmentName::parse(&name).is_ok() && !keep.contains(&name.as_str()) {
                    let _ = fs::remove_dir_all(entry.path());
                }
            }
        }
        if let Ok(entries) = fs::read_dir(&self.prefetched_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if SegmentName::parse(&name).is_ok() && !keep.contains(&name.as_str()) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    /// Begin an atomic download of one segment.
    pub fn download(&self, segment: &SegmentName) -> Result<AtomicDownload<'_>> {
        let tmp = NamedTempFile::new_in(self.seg_dir(segment))?;
        Ok(AtomicDownload {
            dirs: self,
            segment: segment.clone(),
            tmp,
        })
    }
}

/// Temporary file for downloading exactly one segment.
///
/// [`commit`](AtomicDownload::commit) links the finished download into the
/// prefetched directory; the running directory is removed either way, so a
/// failed download leaves nothing behind.
pub struct AtomicDownload<'a> {
    dirs: &'a PrefetchDirs,
    segment: SegmentName,
    tmp: NamedTempFile,
}

impl AtomicDownload<'_> {
    pub fn file(&mut self) -> &mut fs::File {
        self.tmp.as_file_mut()
    }

    pub fn commit(self) -> Result<()> {
        // A crash can leave a torn file here since nothing is fsynced; the
        // database retries corrupt archive logs, so that is acceptable.
        fs::hard_link(
            self.tmp.path(),
            self.dirs.prefetched_dir.join(self.segment.as_str()),
        )?;
        Ok(())
        // Drop removes the running directory.
    }
}

impl Drop for AtomicDownload<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(self.dirs.seg_dir(&self.segment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn seg(name: &str) -> SegmentName {
        SegmentName::parse(name).unwrap()
    }

    #[test]
    fn committed_download_becomes_visible() {
        let base = tempfile::tempdir().unwrap();
        let dirs = PrefetchDirs::new(base.path());
        let segment = seg("0000000100000000000000AA");
        dirs.create(&segment);
        assert!(dirs.is_running(&segment));

        let mut download = dirs.download(&segment).unwrap();
        download.file().write_all(b"segment bytes").unwrap();
        download.commit().unwrap();

        assert!(dirs.contains(&segment));
        assert!(!dirs.is_running(&segment));

        let dest = base.path().join("pg_wal/RECOVERYXLOG");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        dirs.promote(&segment, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"segment bytes");
        assert!(!dirs.contains(&segment));
    }

    #[test]
    fn dropped_download_leaves_nothing() {
        let base = tempfile::tempdir().unwrap();
        let dirs = PrefetchDirs::new(base.path());
        let segment = seg("0000000100000000000000AB");
        dirs.create(&segment);
        {
            let mut download = dirs.download(&segment).unwrap();
            download.file().write_all(b"partial").unwrap();
            // Dropped without commit.
        }
        assert!(!dirs.contains(&segment));
        assert!(!dirs.is_running(&segment));
    }

    #[test]
    fn running_size_probes_progress() {
        let base = tempfile::tempdir().unwrap();
        let dirs = PrefetchDirs::new(base.path());
        let segment = seg("0000000100000000000000AC");
        assert_eq!(dirs.running_size(&segment), 0);
        dirs.create(&segment);
        let mut download = dirs.download(&segment).unwrap();
        download.file().write_all(&[0u8; 2048]).unwrap();
        assert_eq!(dirs.running_size(&segment), 2048);
    }

    #[test]
    fn clear_except_retains_window() {
        let base = tempfile::tempdir().unwrap();
        let dirs = PrefetchDirs::new(base.path());
        let keep = seg("0000000100000000000000AA");
        let drop_me = seg("0000000100000000000000AB");
        for s in [&keep, &drop_me] {
            dirs.create(s);
            let mut d = dirs.download(s).unwrap();
            d.file().write_all(b"x").unwrap();
            d.commit().unwrap();
        }

        dirs.clear_except(std::slice::from_ref(&keep));
        assert!(dirs.contains(&keep));
        assert!(!dirs.contains(&drop_me));
    }
}
