//! WAL segment push and fetch, with pooling and speculative prefetch.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{info, warn};
use walstash_storage::CancelFlag;

use crate::error::{ArchiveError, Result};
use crate::names::{self, SegmentName};
use crate::prefetch::PrefetchDirs;
use crate::worker;
use crate::ArchiveContext;

/// How long a stalled prefetch may sit without progress before wal-fetch
/// gives up waiting and downloads in-band.
const PREFETCH_PROGRESS_WAIT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// A segment queued for upload. Only segments discovered through
/// `archive_status` get their `.ready` marker flipped to `.done`; the
/// explicitly requested segment stays under the database's control.
#[derive(Debug, Clone)]
struct PushEntry {
    path: PathBuf,
    file_name: String,
    explicit: bool,
}

/// Upload the named segment, opportunistically draining other `.ready`
/// segments from the same WAL directory up to `pool_size` total.
///
/// The invocation succeeds only if every started upload succeeds; the
/// archive hook must see a non-zero exit for its own segment to retry it.
pub fn wal_push(ctx: &ArchiveContext, segment_path: &Path, pool_size: usize) -> Result<()> {
    let file_name = segment_path
        .file_name()
        .ok_or_else(|| {
            ArchiveError::Config(format!("bad WAL path: {}", segment_path.display()))
        })?
        .to_string_lossy()
        .into_owned();

    let mut entries = vec![PushEntry {
        path: segment_path.to_path_buf(),
        file_name,
        explicit: true,
    }];
    if pool_size > 1 {
        if let Some(wal_dir) = segment_path.parent() {
            for ready in ready_segments(wal_dir, segment_path, pool_size - 1) {
                entries.push(ready);
            }
        }
    }

    let pool = pool_size.max(1);
    let tasks: Vec<_> = entries
        .into_iter()
        .map(|entry| move |cancel: &CancelFlag| push_one(ctx, entry, cancel))
        .collect();
    worker::run_all(pool, &ctx.cancel, tasks)?;
    Ok(())
}

/// Scan `archive_status` for further `.ready` segments, earliest first.
fn ready_segments(wal_dir: &Path, exclude: &Path, limit: usize) -> Vec<PushEntry> {
    let status_dir = wal_dir.join("archive_status");
    let mut names: Vec<String> = match fs::read_dir(&status_dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                let stem = name.strip_suffix(".ready")?;
                SegmentName::parse(stem).ok()?;
                Some(stem.to_string())
            })
            .collect(),
        Err(_) => return Vec::new(),
    };
    names.sort();

    names
        .into_iter()
        .map(|stem| PushEntry {
            path: wal_dir.join(&stem),
            file_name: stem,
            explicit: false,
        })
        .filter(|entry| entry.path != exclude)
        .take(limit)
        .collect()
}

fn push_one(ctx: &ArchiveContext, entry: PushEntry, cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    let key = names::wal_key(&entry.file_name);
    info!(
        seg = %entry.file_name,
        key = %ctx.url_for(&key),
        "begin archiving WAL file"
    );

    let mut file = match fs::File::open(&entry.path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArchiveError::Precondition(format!(
                "could not find file for wal-push: {}",
                entry.path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let chain = ctx.filters.upload_chain();
    let mut staged = chain.stage(&mut file, &ctx.tmp_dir)?;
    let len = staged.len;
    ctx.store.put(&key, len, staged.body())?;

    if !entry.explicit {
        mark_done(&entry.path)?;
    }
    info!(seg = %entry.file_name, compressed_bytes = len, "completed archiving WAL file");
    Ok(())
}

/// Flip the archiver's `.ready` marker to `.done` for a segment uploaded
/// out of band, so the database does not archive it again.
fn mark_done(segment_path: &Path) -> Result<()> {
    let wal_dir = segment_path.parent().ok_or_else(|| {
        ArchiveError::Other(format!("bad WAL path: {}", segment_path.display()))
    })?;
    let name = segment_path
        .file_name()
        .ok_or_else(|| ArchiveError::Other(format!("bad WAL path: {}", segment_path.display())))?
        .to_string_lossy()
        .into_owned();
    let status_dir = wal_dir.join("archive_status");
    fs::rename(
        status_dir.join(format!("{name}.ready")),
        status_dir.join(format!("{name}.done")),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch and prefetch
// ---------------------------------------------------------------------------

/// Download one WAL file to `destination`.
///
/// With `prefetch > 0` and a regular segment name, a prefetch hit is
/// promoted by atomic rename, and the next `prefetch` segment names are
/// speculatively started as detached `wal-prefetch` child processes.
/// An absent object surfaces as NotFound, which the restore hook uses to
/// detect end-of-archive.
pub fn wal_fetch(
    ctx: &ArchiveContext,
    file_name: &str,
    destination: &Path,
    prefetch: usize,
) -> Result<()> {
    let key = names::wal_key(file_name);

    if prefetch > 0 {
        // Prefetch applies to plain segments, not label or history files.
        if let Ok(segment) = SegmentName::parse(file_name) {
            if let Some(base) = prefetch_base(destination) {
                let dirs = PrefetchDirs::new(&base);
                let started = start_prefetches(&segment, &dirs, prefetch);

                let mut last_size = 0;
                loop {
                    if dirs.contains(&segment) {
                        dirs.promote(&segment, destination)?;
                        info!(seg = %file_name, "promoted prefetched WAL segment");
                        dirs.clear_except(&started);
                        return Ok(());
                    }
                    // Wait on an in-progress prefetch only while it makes
                    // progress; a stalled one is assumed dead.
                    let size = dirs.running_size(&segment);
                    if size <= last_size {
                        break;
                    }
                    last_size = size;
                    std::thread::sleep(PREFETCH_PROGRESS_WAIT);
                }
                dirs.clear_except(&started);
            }
        }
    }

    info!(seg = %file_name, key = %ctx.url_for(&key), "begin WAL restore");
    download_to(ctx, &key, destination)?;
    info!(seg = %file_name, "complete WAL restore");
    Ok(())
}

/// Download one segment into the prefetch directory (the `wal-prefetch`
/// helper command). Failures only matter to logs; the database never sees
/// this process's exit code.
pub fn wal_prefetch(ctx: &ArchiveContext, base: &Path, file_name: &str) -> Result<()> {
    let segment = SegmentName::parse(file_name)?;
    let dirs = PrefetchDirs::new(base);
    if dirs.contains(&segment) {
        return Ok(());
    }
    dirs.create(&segment);

    let key = names::wal_key(file_name);
    info!(seg = %file_name, key = %ctx.url_for(&key), "begin WAL prefetch");
    let mut download = dirs.download(&segment)?;
    let chain = ctx.filters.download_chain();
    let body = ctx.store.get(&key)?;
    let mut reader = chain.reader(body)?;
    std::io::copy(&mut reader, download.file())?;
    reader.finish()?;
    download.commit()?;
    info!(seg = %file_name, "complete WAL prefetch");
    Ok(())
}

fn download_to(ctx: &ArchiveContext, key: &str, destination: &Path) -> Result<()> {
    let dest_dir = destination.parent().ok_or_else(|| {
        ArchiveError::Config(format!("bad WAL destination: {}", destination.display()))
    })?;

    let chain = ctx.filters.download_chain();
    let body = ctx.store.get(key)?;
    let mut reader = chain.reader(body)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
    std::io::copy(&mut reader, tmp.as_file_mut())?;
    reader.finish()?;
    tmp.persist(destination)
        .map_err(|e| ArchiveError::Io(e.error))?;
    Ok(())
}

/// The directory holding the `.walstash` prefetch tree: the real parent of
/// the restore destination.
fn prefetch_base(destination: &Path) -> Option<PathBuf> {
    let parent = destination.parent()?;
    fs::canonicalize(parent).ok()
}

/// Spawn detached prefetch children for the next segments on the timeline.
/// Returns the window of segments considered, running or not.
fn start_prefetches(segment: &SegmentName, dirs: &PrefetchDirs, how_many: usize) -> Vec<SegmentName> {
    let future: Vec<SegmentName> = segment.successors().take(how_many).collect();
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!("cannot locate own executable for prefetch: {e}");
            return future;
        }
    };

    for next in &future {
        if dirs.is_running(next) || dirs.contains(next) {
            continue;
        }
        let spawned = Command::new(&exe)
            .arg("wal-prefetch")
            .arg(&dirs.base)
            .arg(next.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(_) => info!(seg = %next, "started speculative WAL prefetch"),
            Err(e) => warn!(seg = %next, "could not start prefetch process: {e}"),
        }
    }
    future
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_segments_sorted_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("archive_status");
        fs::create_dir_all(&status).unwrap();
        for name in [
            "0000000100000000000000AC",
            "0000000100000000000000AA",
            "0000000100000000000000AB",
        ] {
            fs::write(dir.path().join(name), b"wal").unwrap();
            fs::write(status.join(format!("{name}.ready")), b"").unwrap();
        }
        // Non-segment markers are ignored.
        fs::write(status.join("00000002.history.ready"), b"").unwrap();

        let explicit = dir.path().join("0000000100000000000000AA");
        let ready = ready_segments(dir.path(), &explicit, 10);
        let names: Vec<_> = ready.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["0000000100000000000000AB", "0000000100000000000000AC"]);
        assert!(ready.iter().all(|e| !e.explicit));

        let capped = ready_segments(dir.path(), &explicit, 1);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].file_name, "0000000100000000000000AB");
    }

    #[test]
    fn mark_done_renames_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("archive_status");
        fs::create_dir_all(&status).unwrap();
        let seg = dir.path().join("0000000100000000000000AA");
        fs::write(&seg, b"wal").unwrap();
        fs::write(status.join("0000000100000000000000AA.ready"), b"").unwrap();

        mark_done(&seg).unwrap();
        assert!(!status.join("0000000100000000000000AA.ready").exists());
        assert!(status.join("0000000100000000000000AA.done").exists());
    }

    #[test]
    fn missing_ready_marker_fails_mark_done() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("archive_status")).unwrap();
        let seg = dir.path().join("0000000100000000000000AA");
        assert!(mark_done(&seg).is_err());
    }
}
