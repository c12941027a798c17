//! The backup manifest ("sentinel") and tablespace restore specification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// JSON manifest stored next to a backup's partition directory.
///
/// Its existence is the atomic marker that the backup is complete: every
/// partition object is written before the sentinel, and deletion removes
/// the sentinel first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSentinel {
    pub wal_segment_backup_start: String,
    pub wal_segment_offset_backup_start: String,
    pub wal_segment_backup_stop: String,
    pub wal_segment_offset_backup_stop: String,
    pub expanded_size_bytes: u64,
    pub partition_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<TablespaceSpec>,
}

/// Tablespace layout captured at backup time, or supplied by the operator
/// through `--restore-spec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TablespaceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_prefix: Option<String>,
    /// Tablespace oids in archive order.
    #[serde(default)]
    pub tablespaces: Vec<String>,
    /// Per-oid storage location and link path, keyed by oid.
    #[serde(flatten)]
    pub links: BTreeMap<String, TablespaceLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TablespaceLink {
    /// Directory the tablespace data lives in (the symlink target).
    pub loc: String,
    /// Link path relative to the cluster root, e.g. `pg_tblspc/16401`.
    pub link: String,
}

impl TablespaceSpec {
    pub fn is_empty(&self) -> bool {
        self.tablespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_json_round_trip() {
        let sentinel = BackupSentinel {
            wal_segment_backup_start: "0000000100000000000000A6".into(),
            wal_segment_offset_backup_start: "00000040".into(),
            wal_segment_backup_stop: "0000000100000000000000A8".into(),
            wal_segment_offset_backup_stop: "00000120".into(),
            expanded_size_bytes: 3 * 1048576,
            partition_count: 2,
            spec: None,
        };
        let encoded = serde_json::to_string(&sentinel).unwrap();
        assert!(encoded.contains("\"partition_count\":2"));
        assert!(!encoded.contains("spec"));
        let decoded: BackupSentinel = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, sentinel);
    }

    #[test]
    fn tablespace_spec_flattens_oid_entries() {
        let mut spec = TablespaceSpec {
            base_prefix: Some("/var/lib/pgsql/data".into()),
            tablespaces: vec!["16401".into()],
            links: BTreeMap::new(),
        };
        spec.links.insert(
            "16401".into(),
            TablespaceLink {
                loc: "/mnt/fast/ts1".into(),
                link: "pg_tblspc/16401".into(),
            },
        );

        let encoded = serde_json::to_value(&spec).unwrap();
        assert_eq!(encoded["16401"]["loc"], "/mnt/fast/ts1");
        assert_eq!(encoded["tablespaces"][0], "16401");

        let decoded: TablespaceSpec = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn operator_supplied_spec_parses() {
        let raw = r#"{
            "tablespaces": ["16401", "16402"],
            "16401": {"loc": "/mnt/a", "link": "pg_tblspc/16401"},
            "16402": {"loc": "/mnt/b", "link": "pg_tblspc/16402"}
        }"#;
        let spec: TablespaceSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.tablespaces.len(), 2);
        assert_eq!(spec.links["16402"].loc, "/mnt/b");
        assert!(spec.base_prefix.is_none());
    }
}
