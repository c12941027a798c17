//! Deletion of backups and WAL that are no longer needed for recovery.
//!
//! Every subcommand is a dry run unless explicitly confirmed. Keys that do
//! not match the known layout are warned about and never deleted. Within a
//! sweep the order is sentinels, then partitions, then WAL, so a backup
//! loses its completeness marker before any of its content disappears.

use std::io::Write;

use tracing::{info, warn};

use crate::error::{ArchiveError, Result};
use crate::names::{self, BackupName, SegmentName, SegmentNumber, StoreKey};
use crate::ArchiveContext;

/// Maximum keys per delete call, the bulk-delete page size.
const DELETE_PAGE: usize = 1000;

/// Keys marked for deletion, grouped to preserve the deletion order.
#[derive(Debug, Default)]
pub struct DeletePlan {
    pub sentinels: Vec<String>,
    pub partitions: Vec<String>,
    pub wal: Vec<String>,
    /// Old-version and delete-everything sweeps: keys removed wholesale.
    pub other: Vec<String>,
}

impl DeletePlan {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.sentinels.len() + self.partitions.len() + self.wal.len() + self.other.len()
    }

    /// Keys in deletion order.
    fn ordered(&self) -> impl Iterator<Item = &String> {
        self.sentinels
            .iter()
            .chain(self.partitions.iter())
            .chain(self.wal.iter())
            .chain(self.other.iter())
    }
}

/// The deletion horizon for `before` and `retain`: a WAL position compared
/// timeline-naively, which is conservative across timeline divergence.
pub fn parse_horizon(raw: &str) -> Result<SegmentNumber> {
    if let Ok(name) = BackupName::parse(raw) {
        return Ok(name.segment.number());
    }
    if let Ok(segment) = SegmentName::parse(raw) {
        return Ok(segment.number());
    }
    Err(ArchiveError::Config(format!(
        "'{raw}' is neither a backup name nor a WAL segment name"
    )))
}

/// Mark everything strictly before `horizon`: completed backups whose
/// start position is older, their partitions, and WAL files below the
/// horizon. Timeline history files are never marked.
pub fn plan_before(ctx: &ArchiveContext, horizon: SegmentNumber) -> Result<DeletePlan> {
    let mut plan = DeletePlan::default();

    for meta in ctx.store.list(&names::basebackups_dir())? {
        match names::classify(&meta.key) {
            StoreKey::Sentinel { name } => {
                if name.segment.number().as_integer() < horizon.as_integer() {
                    plan.sentinels.push(meta.key);
                }
            }
            StoreKey::Partition { name, .. } => {
                if name.segment.number().as_integer() < horizon.as_integer() {
                    plan.partitions.push(meta.key);
                }
            }
            _ => warn_unknown(ctx, &meta.key),
        }
    }

    for meta in ctx.store.list(&names::wal_dir())? {
        match names::classify(&meta.key) {
            StoreKey::WalSegment { segment } | StoreKey::BackupLabel { segment } => {
                if segment.number().as_integer() < horizon.as_integer() {
                    plan.wal.push(meta.key);
                }
            }
            // History files carry no WAL position; keep them.
            StoreKey::TimelineHistory => {}
            _ => warn_unknown(ctx, &meta.key),
        }
    }

    Ok(plan)
}

/// Keep the `retain` most recent complete backups, deleting everything
/// strictly older than the oldest retained one. With `retain` or fewer
/// backups present nothing is marked.
pub fn plan_retain(ctx: &ArchiveContext, retain: usize) -> Result<DeletePlan> {
    if retain == 0 {
        return Err(ArchiveError::Config(
            "retain requires at least one backup to keep".into(),
        ));
    }

    let mut sentinels: Vec<BackupName> = Vec::new();
    for meta in ctx.store.list(&names::basebackups_dir())? {
        if let StoreKey::Sentinel { name } = names::classify(&meta.key) {
            sentinels.push(name);
        }
    }
    sentinels.sort();
    sentinels.reverse(); // newest first

    if sentinels.len() <= retain {
        info!(
            total = sentinels.len(),
            "retaining all existing base backups, nothing to delete"
        );
        return Ok(DeletePlan::default());
    }

    let oldest_retained = &sentinels[retain - 1];
    info!(
        total = sentinels.len(),
        deleting = sentinels.len() - retain,
        horizon = %oldest_retained,
        "deleting base backups older than the retention window"
    );
    plan_before(ctx, oldest_retained.segment.number())
}

/// Mark every key whose storage-version tag differs from the current one.
pub fn plan_old_versions(ctx: &ArchiveContext) -> Result<DeletePlan> {
    let mut plan = DeletePlan::default();
    for meta in ctx.store.list("")? {
        match names::key_version(&meta.key) {
            Some(version) if version != names::STORAGE_VERSION => plan.other.push(meta.key),
            _ => {}
        }
    }
    Ok(plan)
}

/// Mark every key under the prefix. Named provocatively for a reason.
pub fn plan_everything(ctx: &ArchiveContext) -> Result<DeletePlan> {
    let mut plan = DeletePlan::default();
    for meta in ctx.store.list("")? {
        match names::classify(&meta.key) {
            StoreKey::Sentinel { .. } => plan.sentinels.push(meta.key),
            StoreKey::Partition { .. } => plan.partitions.push(meta.key),
            StoreKey::WalSegment { .. }
            | StoreKey::BackupLabel { .. }
            | StoreKey::TimelineHistory => plan.wal.push(meta.key),
            StoreKey::Unknown => plan.other.push(meta.key),
        }
    }
    Ok(plan)
}

/// Execute (or describe) a plan. Dry-run is the default and always wins
/// when both flags are passed; deletion happens only with `confirm` alone.
/// Deletion is idempotent: absent keys are no-ops.
pub fn execute(ctx: &ArchiveContext, plan: &DeletePlan, confirm: bool, out: &mut dyn Write) -> Result<()> {
    if plan.is_empty() {
        writeln!(out, "nothing to delete")?;
        return Ok(());
    }

    if !confirm {
        for key in plan.ordered() {
            writeln!(out, "would delete: {}", ctx.url_for(key))?;
        }
        writeln!(out, "dry run: {} keys would be deleted (pass --confirm to delete)", plan.len())?;
        return Ok(());
    }

    for group in [&plan.sentinels, &plan.partitions, &plan.wal, &plan.other] {
        for page in group.chunks(DELETE_PAGE) {
            ctx.store.delete(page)?;
            for key in page {
                info!(key = %ctx.url_for(key), "deleted");
            }
        }
    }
    writeln!(out, "deleted {} keys", plan.len())?;
    Ok(())
}

fn warn_unknown(ctx: &ArchiveContext, key: &str) {
    // Unexpected keys can be harmless, or the result of a bug or
    // misconfiguration; either way they are not ours to delete.
    warn!(key = %ctx.url_for(key), "skipping non-qualifying key in delete sweep");
}
