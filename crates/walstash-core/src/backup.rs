//! Base backup push, fetch, and listing.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walstash_storage::CancelFlag;

use crate::error::{ArchiveError, Result};
use crate::limits::ByteRateLimiter;
use crate::names::{self, BackupName, StoreKey};
use crate::pg::PgControl;
use crate::sentinel::{BackupSentinel, TablespaceSpec};
use crate::tar_partition::{
    self, extract_stream, partition_cluster, write_partition, TarPartition,
};
use crate::worker::{self, BACKUP_POOL_SIZE};
use crate::ArchiveContext;

/// File mode for directories created during restore.
const RESTORE_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub pool_size: usize,
    /// Cluster read throttle in bytes per second.
    pub rate_limit: Option<u64>,
    pub partition_max_bytes: u64,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            pool_size: BACKUP_POOL_SIZE,
            rate_limit: None,
            partition_max_bytes: tar_partition::PARTITION_MAX_BYTES,
        }
    }
}

/// Upload a base backup of `data_dir`.
///
/// Phases are strictly ordered: backup start, partition uploads, backup
/// stop, sentinel write. The sentinel is written last and atomically
/// publishes the backup; on upload failure the backup state is still
/// released via backup stop, no sentinel is written, and partial
/// partitions are left for the pruner to sweep.
pub fn backup_push(
    ctx: &ArchiveContext,
    control: &PgControl,
    data_dir: &Path,
    opts: &PushOptions,
) -> Result<BackupName> {
    let label = format!("freeze_start_{}", chrono::Utc::now().to_rfc3339());
    let start = control.backup_start(&label)?;
    let name = BackupName::new(start.file_name.clone(), &start.file_offset)?;
    info!(backup = %name, "started base backup");

    let upload_result = upload_cluster(ctx, data_dir, &name, opts);

    // The database's backup state must be released whether or not the
    // uploads survived.
    let stop_result = control.backup_stop();

    let (expanded_size_bytes, partition_count, tablespaces) = match upload_result {
        Ok(summary) => summary,
        Err(e) => {
            if let Err(stop_err) = stop_result {
                warn!("backup stop after failed upload also failed: {stop_err}");
            }
            return Err(e);
        }
    };
    let stop = stop_result?;

    let sentinel = BackupSentinel {
        wal_segment_backup_start: start.file_name.to_string(),
        wal_segment_offset_backup_start: start.file_offset.clone(),
        wal_segment_backup_stop: stop.file_name.to_string(),
        wal_segment_offset_backup_stop: stop.file_offset.clone(),
        expanded_size_bytes,
        partition_count,
        spec: (!tablespaces.is_empty()).then(|| {
            let mut spec = tablespaces;
            spec.base_prefix = Some(data_dir.to_string_lossy().into_owned());
            spec
        }),
    };
    write_sentinel(ctx, &name, &sentinel)?;
    info!(
        backup = %name,
        partitions = partition_count,
        expanded_bytes = expanded_size_bytes,
        "base backup complete"
    );
    Ok(name)
}

fn upload_cluster(
    ctx: &ArchiveContext,
    data_dir: &Path,
    name: &BackupName,
    opts: &PushOptions,
) -> Result<(u64, u64, TablespaceSpec)> {
    let plan = partition_cluster(data_dir, opts.partition_max_bytes)?;
    let expanded_size_bytes: u64 = plan.partitions.iter().map(|p| p.total_member_size()).sum();
    let partition_count = plan.partitions.len() as u64;
    let limiter = opts.rate_limit.map(ByteRateLimiter::new);

    let tasks: Vec<_> = plan
        .partitions
        .into_iter()
        .map(|partition| {
            let limiter = limiter.as_ref();
            move |cancel: &CancelFlag| upload_partition(ctx, name, partition, limiter, cancel)
        })
        .collect();
    worker::run_all(opts.pool_size, &ctx.cancel, tasks)?;

    Ok((expanded_size_bytes, partition_count, plan.tablespaces))
}

/// Stage one partition through the filter pipeline and upload it. A member
/// that changed under the scan gets one retry with fresh sizes.
fn upload_partition(
    ctx: &ArchiveContext,
    name: &BackupName,
    mut partition: TarPartition,
    limiter: Option<&ByteRateLimiter>,
    cancel: &CancelFlag,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    let key = names::partition_key(name, partition.index);
    let chain = ctx.filters.upload_chain();

    let attempt = |partition: &TarPartition| -> Result<()> {
        let mut staged = chain.stage_from(
            |w| write_partition(partition, w, limiter),
            &ctx.tmp_dir,
        )?;
        info!(
            key = %key,
            compressed_bytes = staged.len,
            member_bytes = partition.total_member_size(),
            "uploading base backup partition"
        );
        let len = staged.len;
        ctx.store.put(&key, len, staged.body())?;
        Ok(())
    };

    match attempt(&partition) {
        Err(ArchiveError::MemberChanged(path)) => {
            warn!(
                path = %path.display(),
                "partition member changed during read, retrying with fresh sizes"
            );
            partition.refresh_sizes()?;
            attempt(&partition)
        }
        other => other,
    }
}

fn write_sentinel(ctx: &ArchiveContext, name: &BackupName, sentinel: &BackupSentinel) -> Result<()> {
    let body = serde_json::to_vec(sentinel)?;
    let len = body.len() as u64;
    ctx.store
        .put(&names::sentinel_key(name), len, &mut Cursor::new(body))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Listing and resolution
// ---------------------------------------------------------------------------

/// One completed backup known to the store.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub name: BackupName,
    pub last_modified: Option<String>,
}

/// All complete backups under the prefix, in name order.
pub fn list_backups(ctx: &ArchiveContext) -> Result<Vec<BackupInfo>> {
    let mut backups = Vec::new();
    for meta in ctx.store.list(&names::basebackups_dir())? {
        if let StoreKey::Sentinel { name } = names::classify(&meta.key) {
            backups.push(BackupInfo {
                name,
                last_modified: meta.last_modified,
            });
        }
    }
    backups.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(backups)
}

/// Resolve a backup query: an exact name, or `LATEST` for the greatest
/// name in lexicographic order (the newest completed backup).
pub fn resolve_backup(ctx: &ArchiveContext, query: &str) -> Result<BackupInfo> {
    let backups = list_backups(ctx)?;
    let found = if query == "LATEST" {
        backups.into_iter().last()
    } else {
        let wanted = BackupName::parse(query)?;
        backups.into_iter().find(|b| b.name == wanted)
    };
    found.ok_or_else(|| {
        ArchiveError::Precondition(format!("no backup matching '{query}' was found"))
    })
}

pub fn read_sentinel(ctx: &ArchiveContext, name: &BackupName) -> Result<BackupSentinel> {
    let mut body = Vec::new();
    ctx.store
        .get(&names::sentinel_key(name))?
        .read_to_end(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write the backup listing as CSV with a header row. `--detail` costs one
/// sentinel GET per backup to fill the stop-position and size columns.
pub fn backup_list(
    ctx: &ArchiveContext,
    query: Option<&str>,
    detail: bool,
    out: &mut dyn Write,
) -> Result<()> {
    writeln!(
        out,
        "name,last_modified,expanded_size_bytes,wal_segment_backup_start,\
         wal_segment_offset_backup_start,wal_segment_backup_stop,wal_segment_offset_backup_stop"
    )?;

    let backups = match query {
        Some("LATEST") => vec![resolve_backup(ctx, "LATEST")?],
        Some(name) => {
            let wanted = BackupName::parse(name)?;
            list_backups(ctx)?
                .into_iter()
                .filter(|b| b.name == wanted)
                .collect()
        }
        None => list_backups(ctx)?,
    };

    for backup in backups {
        let detail_fields = if detail {
            match read_sentinel(ctx, &backup.name) {
                Ok(sentinel) => Some(sentinel),
                Err(e) => {
                    // A concurrent delete can remove a sentinel mid-listing.
                    warn!(backup = %backup.name, "could not load backup detail: {e}");
                    None
                }
            }
        } else {
            None
        };
        let (size, stop_seg, stop_off) = match &detail_fields {
            Some(s) => (
                s.expanded_size_bytes.to_string(),
                s.wal_segment_backup_stop.clone(),
                s.wal_segment_offset_backup_stop.clone(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            backup.name,
            backup.last_modified.as_deref().unwrap_or(""),
            size,
            backup.name.segment,
            backup.name.offset,
            stop_seg,
            stop_off,
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub pool_size: usize,
    /// Skip tablespace link verification and restore content in place.
    pub blind_restore: bool,
    /// Operator-provided restore specification path.
    pub restore_spec: Option<PathBuf>,
}

/// Restore a base backup into `data_dir`.
pub fn backup_fetch(
    ctx: &ArchiveContext,
    data_dir: &Path,
    query: &str,
    opts: &FetchOptions,
) -> Result<()> {
    if data_dir.join("postmaster.pid").exists() {
        return Err(ArchiveError::Precondition(
            "refusing to restore over a live data directory: found postmaster.pid \
             (shut the server down first, then remove a stale lockfile only if you \
             are sure it is stale)"
                .into(),
        ));
    }

    let backup = resolve_backup(ctx, query)?;
    let sentinel = read_sentinel(ctx, &backup.name)?;
    info!(backup = %backup.name, "fetching base backup");

    match (&opts.restore_spec, opts.blind_restore) {
        (Some(spec_path), _) => {
            let raw = fs::read_to_string(spec_path)?;
            let mut spec: TablespaceSpec = serde_json::from_str(&raw)
                .map_err(|e| ArchiveError::Config(format!("bad restore spec: {e}")))?;
            if spec.base_prefix.is_none() {
                spec.base_prefix = Some(data_dir.to_string_lossy().into_owned());
            }
            build_restore_paths(data_dir, &spec)?;
        }
        (None, true) => {
            // Blind restore: tablespace content lands directly under
            // pg_tblspc with no link verification.
        }
        (None, false) => {
            if let Some(spec) = &sentinel.spec {
                verify_restore_paths(data_dir, spec)?;
            }
        }
    }

    fs::create_dir_all(data_dir)?;
    let partition_keys = list_partitions(ctx, &backup.name)?;
    if partition_keys.len() as u64 != sentinel.partition_count {
        return Err(ArchiveError::Integrity(format!(
            "backup {} has {} partitions on store but its sentinel says {}",
            backup.name,
            partition_keys.len(),
            sentinel.partition_count
        )));
    }

    let tasks: Vec<_> = partition_keys
        .into_iter()
        .map(|key| move |cancel: &CancelFlag| fetch_partition(ctx, &key, data_dir, cancel))
        .collect();
    let pool = if opts.pool_size == 0 {
        BACKUP_POOL_SIZE
    } else {
        opts.pool_size
    };
    worker::run_all(pool, &ctx.cancel, tasks)?;
    info!(backup = %backup.name, "base backup fetch complete");
    Ok(())
}

fn list_partitions(ctx: &ArchiveContext, name: &BackupName) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for meta in ctx.store.list(&names::partition_dir(name))? {
        if matches!(names::classify(&meta.key), StoreKey::Partition { .. }) {
            keys.push(meta.key);
        }
    }
    keys.sort();
    Ok(keys)
}

fn fetch_partition(
    ctx: &ArchiveContext,
    key: &str,
    data_dir: &Path,
    cancel: &CancelFlag,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    info!(key = %key, "fetching base backup partition");
    let chain = ctx.filters.download_chain();
    let body = ctx.store.get(key)?;
    let mut reader = chain.reader(body)?;
    let stats = extract_stream(&mut reader, data_dir)?;
    reader.finish()?;
    info!(
        key = %key,
        files = stats.files,
        bytes = stats.bytes,
        "extracted base backup partition"
    );
    Ok(())
}

/// Spec-driven restore: create tablespace storage directories and links
/// before any extraction. Links are created at a temporary name and
/// renamed into place.
fn build_restore_paths(data_dir: &Path, spec: &TablespaceSpec) -> Result<()> {
    mkdir_restore(data_dir)?;
    mkdir_restore(&data_dir.join("pg_tblspc"))?;

    for oid in &spec.tablespaces {
        let link = spec.links.get(oid).ok_or_else(|| {
            ArchiveError::Config(format!("restore spec lists tablespace {oid} without a link entry"))
        })?;
        let source = PathBuf::from(&link.loc);
        if !source.is_dir() {
            mkdir_restore(&source)?;
        }
        let dest = data_dir.join(&link.link);
        let staging = dest.with_extension("tmp-link");
        let _ = fs::remove_file(&staging);
        std::os::unix::fs::symlink(&source, &staging)?;
        fs::rename(&staging, &dest)?;
    }
    Ok(())
}

fn mkdir_restore(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(RESTORE_DIR_MODE)
        .create(path)?;
    Ok(())
}

/// User-directed restore: every tablespace link recorded in the backup
/// must already exist under the cluster's tablespace directory.
fn verify_restore_paths(data_dir: &Path, spec: &TablespaceSpec) -> Result<()> {
    let mut bad = Vec::new();
    for oid in &spec.tablespaces {
        let link = data_dir.join("pg_tblspc").join(oid);
        let valid = link.is_symlink() && link.is_dir();
        if !valid {
            bad.push(oid.clone());
        }
    }
    if bad.is_empty() {
        Ok(())
    } else {
        Err(ArchiveError::Precondition(format!(
            "tablespace symlinks not found or not directories: {} \
             (create them before fetching, pass --blind-restore to skip \
             linking, or supply --restore-spec)",
            bad.join(", ")
        )))
    }
}
