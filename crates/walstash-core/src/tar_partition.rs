//! Partitioning a cluster directory tree into bounded-size tar streams.
//!
//! Packing many small files into a few tar partitions amortizes per-object
//! store overhead, while the size bound keeps partitions independently
//! downloadable and extractable in parallel. Every eligible file belongs to
//! exactly one partition.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::limits::{ByteRateLimiter, LimitedReader};
use crate::sentinel::{TablespaceLink, TablespaceSpec};

/// Soft partition size bound. The database allocates nominal 1 GiB heap
/// files, so the bound must exceed that.
pub const PARTITION_MAX_BYTES: u64 = 1_610_612_736;

/// Cap on members per partition, restraining tar metadata memory for
/// workloads with very many tiny files.
pub const PARTITION_MAX_MEMBERS: usize = (PARTITION_MAX_BYTES / 262_144) as usize;

/// Lock and status files in the cluster root that must not be archived.
const ROOT_EXCLUDES: &[&str] = &["postmaster.pid", "postmaster.opts"];

/// Root directories whose contents are excluded (the entry itself is kept
/// so restores recreate it).
const CONTENT_EXCLUDED_DIRS: &[&str] = &["pg_wal", "pg_xlog", "pg_log", "log"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    File,
    Directory,
    Symlink,
}

/// A single tar member, captured at scan time.
#[derive(Debug, Clone)]
pub struct TarMember {
    pub abs_path: PathBuf,
    pub arcname: String,
    pub kind: MemberKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u64,
    pub gid: u64,
    pub link_target: Option<PathBuf>,
}

impl TarMember {
    fn from_entry(abs_path: &Path, arcname: String, meta: &fs::Metadata) -> Result<Self> {
        let file_type = meta.file_type();
        let (kind, size, link_target) = if file_type.is_dir() {
            (MemberKind::Directory, 0, None)
        } else if file_type.is_symlink() {
            (MemberKind::Symlink, 0, Some(fs::read_link(abs_path)?))
        } else {
            (MemberKind::File, meta.len(), None)
        };
        Ok(Self {
            abs_path: abs_path.to_path_buf(),
            arcname,
            kind,
            size,
            mode: meta.permissions().mode() & 0o7777,
            mtime: meta.mtime().max(0) as u64,
            uid: meta.uid() as u64,
            gid: meta.gid() as u64,
            link_target,
        })
    }
}

/// One tar partition: a disjoint subset of the tree, bounded in size.
#[derive(Debug, Clone)]
pub struct TarPartition {
    pub index: u64,
    pub members: Vec<TarMember>,
}

impl TarPartition {
    /// Sum of expanded member sizes in bytes.
    pub fn total_member_size(&self) -> u64 {
        self.members.iter().map(|m| m.size).sum()
    }

    /// Re-stat file members, refreshing sizes for a retry after a member
    /// changed mid-read. A member that has disappeared fails the refresh.
    pub fn refresh_sizes(&mut self) -> Result<()> {
        for member in &mut self.members {
            if member.kind != MemberKind::File {
                continue;
            }
            match fs::symlink_metadata(&member.abs_path) {
                Ok(meta) => member.size = meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ArchiveError::MemberChanged(member.abs_path.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// The partition plan for a cluster directory.
pub struct PartitionPlan {
    pub partitions: Vec<TarPartition>,
    pub tablespaces: TablespaceSpec,
}

/// Walk `data_dir` and produce the partition plan.
///
/// The walk is deterministic (lexicographic per directory). Exclusions:
/// WAL and server-log directory contents, root lock files, special file
/// types, and the contents of `pgsql_tmp*` directories. Tablespace links
/// under `pg_tblspc/` are followed into the target tree and recorded in the
/// tablespace map instead of being archived as symlinks.
pub fn partition_cluster(data_dir: &Path, max_bytes: u64) -> Result<PartitionPlan> {
    let root = fs::canonicalize(data_dir)?;
    if !root.is_dir() {
        return Err(ArchiveError::Precondition(format!(
            "cluster path {} is not a directory",
            root.display()
        )));
    }

    let mut members = Vec::new();
    let mut tablespaces = TablespaceSpec::default();
    collect_tree(&root, "", &mut members, Some(&mut tablespaces))?;

    // Tablespace subtrees, in oid order, after the main tree.
    for oid in &tablespaces.tablespaces {
        let link = &tablespaces.links[oid];
        let ts_root = PathBuf::from(&link.loc);
        let prefix = format!("pg_tblspc/{oid}");
        members.push(TarMember {
            abs_path: ts_root.clone(),
            arcname: prefix.clone(),
            kind: MemberKind::Directory,
            size: 0,
            mode: 0o700,
            mtime: 0,
            uid: 0,
            gid: 0,
            link_target: None,
        });
        collect_tree(&ts_root, &format!("{prefix}/"), &mut members, None)?;
    }

    Ok(PartitionPlan {
        partitions: segment_members(members, max_bytes),
        tablespaces,
    })
}

/// Walk one tree, appending members. `arc_prefix` is prepended to every
/// arcname; `tablespaces` is `Some` only for the cluster root walk, where
/// `pg_tblspc` links get special treatment.
fn collect_tree(
    root: &Path,
    arc_prefix: &str,
    members: &mut Vec<TarMember>,
    mut tablespaces: Option<&mut TablespaceSpec>,
) -> Result<()> {
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| ArchiveError::Other(format!("walk error: {e}")))?;
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue, // the root itself
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let arcname = format!("{arc_prefix}{rel_str}");
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();
        let file_name = entry.file_name().to_string_lossy();

        // Directories whose contents stay behind: the entry is archived so
        // a restore recreates it, but nothing below it is.
        if file_type.is_dir()
            && ((entry.depth() == 1
                && arc_prefix.is_empty()
                && CONTENT_EXCLUDED_DIRS.contains(&file_name.as_ref()))
                || file_name.starts_with("pgsql_tmp"))
        {
            members.push(TarMember::from_entry(path, arcname, &meta)?);
            walker.skip_current_dir();
            continue;
        }

        // Root lock and status files.
        if entry.depth() == 1
            && arc_prefix.is_empty()
            && file_type.is_file()
            && ROOT_EXCLUDES.contains(&file_name.as_ref())
        {
            continue;
        }

        // Tablespace links: record the mapping, archive the target subtree
        // later, and write no symlink member.
        if file_type.is_symlink() && entry.depth() == 2 && rel_str.starts_with("pg_tblspc/") {
            if let Some(spec) = tablespaces.as_deref_mut() {
                let oid = file_name.to_string();
                let target = fs::canonicalize(path).map_err(|e| {
                    ArchiveError::Precondition(format!(
                        "tablespace link {} is dangling: {e}",
                        path.display()
                    ))
                })?;
                spec.tablespaces.push(oid.clone());
                spec.links.insert(
                    oid.clone(),
                    TablespaceLink {
                        loc: target.to_string_lossy().into_owned(),
                        link: format!("pg_tblspc/{oid}"),
                    },
                );
                continue;
            }
        }

        // Sockets, fifos, and device nodes are never archived.
        if !file_type.is_dir() && !file_type.is_file() && !file_type.is_symlink() {
            tracing::debug!(path = %path.display(), "skipping special file");
            continue;
        }

        members.push(TarMember::from_entry(path, arcname, &meta)?);
    }
    Ok(())
}

/// Pack members into partitions under the soft size bound.
///
/// A partition is sealed when adding the next member would exceed the
/// bound and the partition is non-empty, or when the member cap is
/// reached; a single file larger than the bound goes whole into its own
/// partition.
fn segment_members(members: Vec<TarMember>, max_bytes: u64) -> Vec<TarPartition> {
    let mut partitions = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;

    for member in members {
        let size = member.size;
        if !current.is_empty()
            && (current_bytes + size > max_bytes || current.len() >= PARTITION_MAX_MEMBERS)
        {
            partitions.push(TarPartition {
                index: partitions.len() as u64,
                members: std::mem::take(&mut current),
            });
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(member);
    }
    if !current.is_empty() {
        partitions.push(TarPartition {
            index: partitions.len() as u64,
            members: current,
        });
    }
    partitions
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Reader that yields exactly `expected` bytes from the underlying file:
/// growth past the declared length is discarded, and a file that comes up
/// short errors out so the partition can be retried with fresh sizes.
struct ExactReader<R> {
    inner: std::io::Take<R>,
    short_by: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, expected: u64) -> Self {
        Self {
            inner: inner.take(expected),
            short_by: expected,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && self.short_by > 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file shrank {} bytes short of its scanned length", self.short_by),
            ));
        }
        self.short_by -= n as u64;
        Ok(n)
    }
}

/// Serialize one partition as a tar stream into `out`.
///
/// Returns [`ArchiveError::MemberChanged`] when a file was unlinked or
/// shrank between scan and read; the caller retries the partition once
/// after [`TarPartition::refresh_sizes`].
pub fn write_partition(
    partition: &TarPartition,
    out: &mut dyn Write,
    limiter: Option<&ByteRateLimiter>,
) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    for member in &partition.members {
        let mut header = tar::Header::new_gnu();
        header.set_mode(member.mode);
        header.set_mtime(member.mtime);
        header.set_uid(member.uid);
        header.set_gid(member.gid);

        match member.kind {
            MemberKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &member.arcname, std::io::empty())?;
            }
            MemberKind::Symlink => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                let target = member
                    .link_target
                    .as_ref()
                    .ok_or_else(|| ArchiveError::Other("symlink member without target".into()))?;
                builder.append_link(&mut header, &member.arcname, target)?;
            }
            MemberKind::File => {
                let file = match fs::File::open(&member.abs_path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(ArchiveError::MemberChanged(member.abs_path.clone()))
                    }
                    Err(e) => return Err(e.into()),
                };
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(member.size);
                let reader = ExactReader::new(LimitedReader::new(file, limiter), member.size);
                match builder.append_data(&mut header, &member.arcname, reader) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Err(ArchiveError::MemberChanged(member.abs_path.clone()))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    builder.finish()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Extract a tar stream rooted at `dest`.
///
/// Honors regular files, directories, and symlinks; any other member type
/// aborts the fetch. Member paths are validated against escaping `dest`,
/// but extraction deliberately follows directory symlinks inside it:
/// tablespace content must flow through the recreated `pg_tblspc` links to
/// its storage location.
pub fn extract_stream(input: &mut dyn Read, dest: &Path) -> Result<ExtractStats> {
    let mut archive = tar::Archive::new(input);
    archive.set_preserve_permissions(true);
    let mut stats = ExtractStats::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !path_stays_inside(&path) {
            return Err(ArchiveError::Integrity(format!(
                "tar member escapes the destination: {}",
                path.display()
            )));
        }
        let target = dest.join(&path);

        let entry_type = entry.header().entry_type();
        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Directory | tar::EntryType::Symlink => {
                let size = entry.header().size()?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&target)?;
                match entry_type {
                    tar::EntryType::Regular => {
                        stats.files += 1;
                        stats.bytes += size;
                    }
                    tar::EntryType::Directory => stats.dirs += 1,
                    _ => stats.symlinks += 1,
                }
            }
            other => {
                return Err(ArchiveError::Other(format!(
                    "unrecognized tar member type {other:?} for {}",
                    path.display()
                )))
            }
        }
    }
    Ok(stats)
}

/// Relative path with no parent traversal.
fn path_stays_inside(path: &Path) -> bool {
    use std::path::Component;
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::symlink;

    const MIB: u64 = 1_048_576;

    fn write_file(dir: &Path, rel: &str, data: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn plan(dir: &Path, max_bytes: u64) -> PartitionPlan {
        partition_cluster(dir, max_bytes).unwrap()
    }

    fn arcnames(partition: &TarPartition) -> Vec<&str> {
        partition.members.iter().map(|m| m.arcname.as_str()).collect()
    }

    #[test]
    fn three_files_split_at_the_soft_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/1/a", &vec![1u8; (MIB / 2) as usize]);
        write_file(dir.path(), "base/1/b", &vec![2u8; (MIB / 2) as usize]);
        write_file(dir.path(), "base/1/c_big", &vec![3u8; (2 * MIB) as usize]);

        let plan = plan(dir.path(), MIB);
        assert_eq!(plan.partitions.len(), 2);
        // Two half-MiB files exactly fill the first partition; the
        // oversized file goes whole into its own.
        let total: u64 = plan.partitions.iter().map(|p| p.total_member_size()).sum();
        assert_eq!(total, 3 * MIB);
        assert!(arcnames(&plan.partitions[1]).contains(&"base/1/c_big"));
    }

    #[test]
    fn every_file_lands_in_exactly_one_partition() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..40 {
            write_file(dir.path(), &format!("base/f{i:02}"), &vec![0u8; 64 * 1024]);
        }
        let plan = plan(dir.path(), 256 * 1024);
        let mut seen = std::collections::HashSet::new();
        for partition in &plan.partitions {
            for member in &partition.members {
                if member.kind == MemberKind::File {
                    assert!(seen.insert(member.arcname.clone()), "{} twice", member.arcname);
                }
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[test]
    fn walk_order_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha", "midl"] {
            write_file(dir.path(), name, b"x");
        }
        let first = plan(dir.path(), PARTITION_MAX_BYTES);
        let second = plan(dir.path(), PARTITION_MAX_BYTES);
        assert_eq!(
            arcnames(&first.partitions[0]),
            arcnames(&second.partitions[0])
        );
        assert_eq!(arcnames(&first.partitions[0]), vec!["alpha", "midl", "zeta"]);
    }

    #[test]
    fn exclusions_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/1/heap", b"data");
        write_file(dir.path(), "pg_wal/0000000100000000000000AA", b"wal");
        write_file(dir.path(), "pg_log/server.log", b"log line");
        write_file(dir.path(), "base/2/pgsql_tmp/pgsql_tmp123.0", b"scratch");
        write_file(dir.path(), "postmaster.pid", b"1234");
        write_file(dir.path(), "postmaster.opts", b"postgres");
        write_file(dir.path(), "PG_VERSION", b"9.4");

        let plan = plan(dir.path(), PARTITION_MAX_BYTES);
        let names: Vec<String> = plan
            .partitions
            .iter()
            .flat_map(|p| p.members.iter().map(|m| m.arcname.clone()))
            .collect();

        assert!(names.contains(&"PG_VERSION".to_string()));
        assert!(names.contains(&"base/1/heap".to_string()));
        // Excluded directories keep their entry, lose their contents.
        assert!(names.contains(&"pg_wal".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("pg_wal/")));
        assert!(names.contains(&"pg_log".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("pg_log/")));
        assert!(names.contains(&"base/2/pgsql_tmp".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("base/2/pgsql_tmp/")));
        // Lock files are dropped entirely.
        assert!(!names.contains(&"postmaster.pid".to_string()));
        assert!(!names.contains(&"postmaster.opts".to_string()));
    }

    #[test]
    fn tablespace_links_are_mapped_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let ts_store = tempfile::tempdir().unwrap();
        write_file(ts_store.path(), "16401_data/relfile", b"tablespace bytes");
        write_file(dir.path(), "base/1/heap", b"data");
        fs::create_dir_all(dir.path().join("pg_tblspc")).unwrap();
        symlink(
            ts_store.path().join("16401_data"),
            dir.path().join("pg_tblspc/16401"),
        )
        .unwrap();

        let plan = plan(dir.path(), PARTITION_MAX_BYTES);
        assert_eq!(plan.tablespaces.tablespaces, vec!["16401"]);
        let link = &plan.tablespaces.links["16401"];
        assert_eq!(link.link, "pg_tblspc/16401");
        assert!(link.loc.ends_with("16401_data"));

        let names: Vec<String> = plan
            .partitions
            .iter()
            .flat_map(|p| p.members.iter().map(|m| m.arcname.clone()))
            .collect();
        assert!(names.contains(&"pg_tblspc/16401/relfile".to_string()));
        // No symlink member for the link itself.
        assert!(plan
            .partitions
            .iter()
            .flat_map(|p| &p.members)
            .all(|m| !(m.arcname == "pg_tblspc/16401" && m.kind == MemberKind::Symlink)));
    }

    #[test]
    fn write_and_extract_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/1/heap", b"heap bytes");
        write_file(dir.path(), "global/pg_control", b"control");
        fs::create_dir_all(dir.path().join("base/empty")).unwrap();
        symlink("heap", dir.path().join("base/1/heap_link")).unwrap();

        let plan = plan(dir.path(), PARTITION_MAX_BYTES);
        let mut buf = Vec::new();
        for partition in &plan.partitions {
            write_partition(partition, &mut buf, None).unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        let stats = extract_stream(&mut Cursor::new(buf), dest.path()).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.symlinks, 1);
        assert_eq!(
            fs::read(dest.path().join("base/1/heap")).unwrap(),
            b"heap bytes"
        );
        assert_eq!(
            fs::read_link(dest.path().join("base/1/heap_link")).unwrap(),
            PathBuf::from("heap")
        );
        assert!(dest.path().join("base/empty").is_dir());
    }

    #[test]
    fn grown_file_is_truncated_to_scanned_length() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/grows", b"original");
        let mut plan = plan(dir.path(), PARTITION_MAX_BYTES);
        // Simulate growth after the scan.
        write_file(dir.path(), "base/grows", b"original plus surplus bytes");

        let mut buf = Vec::new();
        write_partition(&mut plan.partitions[0], &mut buf, None).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_stream(&mut Cursor::new(buf), dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("base/grows")).unwrap(), b"original");
    }

    #[test]
    fn shrunk_file_fails_with_member_changed() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/shrinks", &vec![9u8; 4096]);
        let plan = plan(dir.path(), PARTITION_MAX_BYTES);
        write_file(dir.path(), "base/shrinks", b"tiny");

        let err = write_partition(&plan.partitions[0], &mut Vec::new(), None).unwrap_err();
        assert!(matches!(err, ArchiveError::MemberChanged(_)), "got {err}");
    }

    #[test]
    fn unlinked_file_fails_and_refresh_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/doomed", b"bytes");
        let mut plan = plan(dir.path(), PARTITION_MAX_BYTES);
        fs::remove_file(dir.path().join("base/doomed")).unwrap();

        let err = write_partition(&plan.partitions[0], &mut Vec::new(), None).unwrap_err();
        assert!(matches!(err, ArchiveError::MemberChanged(_)));
        let err = plan.partitions[0].refresh_sizes().unwrap_err();
        assert!(matches!(err, ArchiveError::MemberChanged(_)));
    }

    #[test]
    fn refresh_sizes_picks_up_new_length() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base/f", &vec![1u8; 1000]);
        let mut plan = plan(dir.path(), PARTITION_MAX_BYTES);
        write_file(dir.path(), "base/f", &vec![1u8; 500]);

        plan.partitions[0].refresh_sizes().unwrap();
        let mut buf = Vec::new();
        write_partition(&plan.partitions[0], &mut buf, None).unwrap();
        let dest = tempfile::tempdir().unwrap();
        extract_stream(&mut Cursor::new(buf), dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("base/f")).unwrap().len(), 500);
    }
}
