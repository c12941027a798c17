//! On-store key layout, storage version 005.
//!
//! Every key under the prefix is produced and parsed here; nothing else in
//! the crate builds key strings. Keys that do not round-trip through the
//! parsers are classified [`StoreKey::Unknown`] and never touched by the
//! pruner.

use std::fmt;

use crate::error::{ArchiveError, Result};

/// Version tag embedded in every key path. Same-tag archives are
/// interoperable across software versions.
pub const STORAGE_VERSION: &str = "005";

const HEX: &[u8] = b"0123456789ABCDEF";

fn is_upper_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| HEX.contains(&b))
}

// ---------------------------------------------------------------------------
// WAL segment names
// ---------------------------------------------------------------------------

/// A 24-hex-character WAL segment name: 8 timeline + 8 log + 8 seg digits.
/// Lexicographic order within a timeline equals production order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName(String);

impl SegmentName {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() == 24 && is_upper_hex(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ArchiveError::Config(format!(
                "invalid WAL segment name '{raw}': expected 24 uppercase hex characters"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn timeline(&self) -> &str {
        &self.0[0..8]
    }

    /// The timeline-naive position, useful for conservative pruning: it
    /// always increases, even across a timeline divergence.
    pub fn number(&self) -> SegmentNumber {
        SegmentNumber {
            log: u32::from_str_radix(&self.0[8..16], 16).unwrap_or(0),
            seg: u32::from_str_radix(&self.0[16..24], 16).unwrap_or(0),
        }
    }

    /// The next segment on the same timeline. The seg field rolls over into
    /// the log field at 0xFF, matching how the database allocates names.
    pub fn next_larger(&self) -> Result<SegmentName> {
        let n = self.number();
        let (log, seg) = if n.seg == 0xFF {
            let log = n.log.checked_add(1).ok_or_else(|| {
                ArchiveError::Other(format!("WAL position overflow after {self}"))
            })?;
            (log, 0)
        } else {
            (n.log, n.seg + 1)
        };
        Ok(Self(format!("{}{log:08X}{seg:08X}", self.timeline())))
    }

    /// Iterator over the segment names following this one, in order.
    pub fn successors(&self) -> impl Iterator<Item = SegmentName> {
        let mut current = self.clone();
        std::iter::from_fn(move || match current.next_larger() {
            Ok(next) => {
                current = next.clone();
                Some(next)
            }
            Err(_) => None,
        })
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Log and seg fields of a WAL position, naive of timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SegmentNumber {
    pub log: u32,
    pub seg: u32,
}

impl SegmentNumber {
    pub fn as_integer(&self) -> u64 {
        ((self.log as u64) << 32) | self.seg as u64
    }
}

// ---------------------------------------------------------------------------
// Backup names
// ---------------------------------------------------------------------------

/// Identity of a base backup: the WAL segment and byte offset captured at
/// backup start, rendered `base_<SEGMENT>_<OFFSET>`.
///
/// The offset is the zero-padded 8-digit decimal string produced by the
/// database control query; both fields are fixed width, so lexicographic
/// order of rendered names equals temporal order within a timeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupName {
    pub segment: SegmentName,
    pub offset: String,
}

impl BackupName {
    pub fn new(segment: SegmentName, offset: &str) -> Result<Self> {
        if offset.len() == 8 && offset.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self {
                segment,
                offset: offset.to_string(),
            })
        } else {
            Err(ArchiveError::Config(format!(
                "invalid backup offset '{offset}': expected 8 decimal digits"
            )))
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.strip_prefix("base_").ok_or_else(|| {
            ArchiveError::Config(format!("invalid backup name '{raw}': missing 'base_' prefix"))
        })?;
        let (seg, offset) = rest.split_once('_').ok_or_else(|| {
            ArchiveError::Config(format!("invalid backup name '{raw}': missing offset"))
        })?;
        Self::new(SegmentName::parse(seg)?, offset)
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "base_{}_{}", self.segment, self.offset)
    }
}

// ---------------------------------------------------------------------------
// Key builders
// ---------------------------------------------------------------------------

pub fn basebackups_dir() -> String {
    format!("basebackups_{STORAGE_VERSION}/")
}

pub fn wal_dir() -> String {
    format!("wal_{STORAGE_VERSION}/")
}

pub fn backup_dir(name: &BackupName) -> String {
    format!("{}{name}/", basebackups_dir())
}

pub fn sentinel_key(name: &BackupName) -> String {
    format!("{}{name}_backup_stop_sentinel.json", basebackups_dir())
}

pub fn partition_dir(name: &BackupName) -> String {
    format!("{}tar_partitions/", backup_dir(name))
}

pub fn partition_key(name: &BackupName, index: u64) -> String {
    format!("{}part_{index}.tar.lzo", partition_dir(name))
}

/// WAL-directory key for any archivable file name: segments, backup label
/// files, and timeline history files all land here with an `.lzo` suffix.
pub fn wal_key(file_name: &str) -> String {
    format!("{}{file_name}.lzo", wal_dir())
}

// ---------------------------------------------------------------------------
// Key parsers
// ---------------------------------------------------------------------------

/// A classified key under the storage-version prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKey {
    Sentinel { name: BackupName },
    Partition { name: BackupName, index: u64 },
    WalSegment { segment: SegmentName },
    /// `<SEGMENT>.<OFFSET_HEX>.backup.lzo` label objects; pruned with their
    /// segment.
    BackupLabel { segment: SegmentName },
    /// `<8HEX>.history(.lzo)` timeline history; carries no position, never
    /// pruned.
    TimelineHistory,
    /// Anything else. Warned about, never deleted.
    Unknown,
}

/// Classify a key relative to the prefix. Only keys under the current
/// storage version match a typed variant.
pub fn classify(key: &str) -> StoreKey {
    if let Some(rest) = key.strip_prefix(&basebackups_dir()) {
        return classify_basebackup_key(rest);
    }
    if let Some(rest) = key.strip_prefix(&wal_dir()) {
        return classify_wal_key(rest);
    }
    StoreKey::Unknown
}

fn classify_basebackup_key(rest: &str) -> StoreKey {
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [leaf] => {
            if let Some(name) = leaf.strip_suffix("_backup_stop_sentinel.json") {
                if let Ok(name) = BackupName::parse(name) {
                    return StoreKey::Sentinel { name };
                }
            }
            StoreKey::Unknown
        }
        [backup, "tar_partitions", leaf] => {
            let Ok(name) = BackupName::parse(backup) else {
                return StoreKey::Unknown;
            };
            let Some(index) = leaf
                .strip_prefix("part_")
                .and_then(|s| s.strip_suffix(".tar.lzo"))
                .and_then(|s| s.parse().ok())
            else {
                return StoreKey::Unknown;
            };
            StoreKey::Partition { name, index }
        }
        _ => StoreKey::Unknown,
    }
}

fn classify_wal_key(rest: &str) -> StoreKey {
    if rest.contains('/') {
        return StoreKey::Unknown;
    }
    if let Some(stem) = rest.strip_suffix(".lzo") {
        if let Ok(segment) = SegmentName::parse(stem) {
            return StoreKey::WalSegment { segment };
        }
        // <SEGMENT>.<OFFSET_HEX>.backup label objects
        if let Some((seg, label)) = stem.split_once('.') {
            if let Ok(segment) = SegmentName::parse(seg) {
                if let Some(offset) = label.strip_suffix(".backup") {
                    if offset.len() == 8 && is_upper_hex(offset) {
                        return StoreKey::BackupLabel { segment };
                    }
                }
            }
        }
        if let Some(tli) = stem.strip_suffix(".history") {
            if tli.len() == 8 && is_upper_hex(tli) {
                return StoreKey::TimelineHistory;
            }
        }
        return StoreKey::Unknown;
    }
    if let Some(tli) = rest.strip_suffix(".history") {
        if tli.len() == 8 && is_upper_hex(tli) {
            return StoreKey::TimelineHistory;
        }
    }
    StoreKey::Unknown
}

/// Extract the storage-version tag from a key (`basebackups_004/…` → `004`).
pub fn key_version(key: &str) -> Option<&str> {
    let dir = key.split('/').next()?;
    let version = dir
        .strip_prefix("basebackups_")
        .or_else(|| dir.strip_prefix("wal_"))?;
    if version.len() == 3 && version.bytes().all(|b| b.is_ascii_digit()) {
        Some(version)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(s: &str) -> SegmentName {
        SegmentName::parse(s).unwrap()
    }

    #[test]
    fn segment_name_validation() {
        assert!(SegmentName::parse("0000000100000000000000AA").is_ok());
        assert!(SegmentName::parse("short").is_err());
        assert!(SegmentName::parse("0000000100000000000000ag").is_err());
        assert!(SegmentName::parse("0000000100000000000000aa").is_err());
    }

    #[test]
    fn segment_number_ordering() {
        let a = seg("0000000100000002000000FE").number();
        let b = seg("000000010000000300000000").number();
        assert!(a.as_integer() < b.as_integer());
        // Timeline is ignored in the number.
        let c = seg("0000000A00000002000000FE").number();
        assert_eq!(a.as_integer(), c.as_integer());
    }

    #[test]
    fn next_larger_increments_and_carries() {
        assert_eq!(
            seg("0000000100000000000000AA").next_larger().unwrap(),
            seg("0000000100000000000000AB")
        );
        assert_eq!(
            seg("0000000100000000000000FF").next_larger().unwrap(),
            seg("000000010000000100000000")
        );
    }

    #[test]
    fn successors_stream_is_consecutive() {
        let names: Vec<String> = seg("0000000100000000000000AA")
            .successors()
            .take(2)
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["0000000100000000000000AB", "0000000100000000000000AC"]
        );
    }

    #[test]
    fn backup_name_round_trip() {
        let name = BackupName::parse("base_0000000100000000000000A6_03626144").unwrap();
        assert_eq!(name.segment.as_str(), "0000000100000000000000A6");
        assert_eq!(name.offset, "03626144");
        assert_eq!(name.to_string(), "base_0000000100000000000000A6_03626144");
    }

    #[test]
    fn backup_name_rejects_bad_offsets() {
        assert!(BackupName::parse("base_0000000100000000000000A6_123").is_err());
        assert!(BackupName::parse("base_0000000100000000000000A6_0362614X").is_err());
        assert!(BackupName::parse("nope_0000000100000000000000A6_03626144").is_err());
    }

    #[test]
    fn backup_name_ordering_matches_position_order() {
        let a = BackupName::parse("base_0000000100000000000000A6_03626144").unwrap();
        let b = BackupName::parse("base_0000000100000000000000A7_00000000").unwrap();
        let c = BackupName::parse("base_0000000100000000000000A7_00000028").unwrap();
        assert!(a < b);
        assert!(b < c);
        // Latest resolution picks the lexicographic maximum.
        let latest = [&a, &c, &b].iter().max().copied().unwrap();
        assert_eq!(*latest, c);
    }

    #[test]
    fn key_builders() {
        let name = BackupName::parse("base_0000000100000000000000A6_00000040").unwrap();
        assert_eq!(
            sentinel_key(&name),
            "basebackups_005/base_0000000100000000000000A6_00000040_backup_stop_sentinel.json"
        );
        assert_eq!(
            partition_key(&name, 7),
            "basebackups_005/base_0000000100000000000000A6_00000040/tar_partitions/part_7.tar.lzo"
        );
        assert_eq!(
            wal_key("0000000100000000000000AA"),
            "wal_005/0000000100000000000000AA.lzo"
        );
    }

    #[test]
    fn classify_round_trips_builders() {
        let name = BackupName::parse("base_0000000100000000000000A6_00000040").unwrap();
        assert_eq!(
            classify(&sentinel_key(&name)),
            StoreKey::Sentinel { name: name.clone() }
        );
        assert_eq!(
            classify(&partition_key(&name, 3)),
            StoreKey::Partition {
                name: name.clone(),
                index: 3
            }
        );
        assert_eq!(
            classify(&wal_key("0000000100000000000000AA")),
            StoreKey::WalSegment {
                segment: seg("0000000100000000000000AA")
            }
        );
    }

    #[test]
    fn classify_wal_special_files() {
        assert_eq!(
            classify("wal_005/0000000100000000000000AA.00000028.backup.lzo"),
            StoreKey::BackupLabel {
                segment: seg("0000000100000000000000AA")
            }
        );
        assert_eq!(classify("wal_005/00000002.history.lzo"), StoreKey::TimelineHistory);
        assert_eq!(classify("wal_005/00000002.history"), StoreKey::TimelineHistory);
    }

    #[test]
    fn classify_rejects_stray_keys() {
        assert_eq!(classify("basebackups_005/garbage.txt"), StoreKey::Unknown);
        assert_eq!(
            classify("basebackups_005/base_0000000100000000000000A6_00000040/extra/part_0.tar.lzo"),
            StoreKey::Unknown
        );
        assert_eq!(classify("wal_005/not-a-segment.lzo"), StoreKey::Unknown);
        assert_eq!(classify("wal_004/0000000100000000000000AA.lzo"), StoreKey::Unknown);
        assert_eq!(classify("unrelated/key"), StoreKey::Unknown);
    }

    #[test]
    fn version_extraction() {
        assert_eq!(key_version("basebackups_004/whatever"), Some("004"));
        assert_eq!(key_version("wal_005/seg.lzo"), Some("005"));
        assert_eq!(key_version("wal_x/seg.lzo"), None);
        assert_eq!(key_version("unrelated/key"), None);
    }
}
