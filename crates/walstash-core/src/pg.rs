//! Control interface to the database: starting and stopping a base backup.
//!
//! Backup coordination happens through `psql` with CSV output, the same
//! two statements the archive hooks rely on. The returned offset arrives
//! already zero-padded to 8 digits by the query itself.

use std::process::{Command, Stdio};

use crate::error::{ArchiveError, Result};
use crate::names::SegmentName;

/// WAL position captured at backup start or stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLocation {
    pub file_name: SegmentName,
    pub file_offset: String,
}

/// Runs control statements through `psql`.
///
/// The program is injectable so tests can substitute a stub.
#[derive(Debug, Clone)]
pub struct PgControl {
    program: String,
}

impl Default for PgControl {
    fn default() -> Self {
        Self {
            program: "psql".to_string(),
        }
    }
}

impl PgControl {
    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Start a hot backup, returning the starting WAL position.
    ///
    /// Fails with `Precondition` when the server refuses, e.g. because
    /// another base backup is already in progress.
    pub fn backup_start(&self, label: &str) -> Result<BackupLocation> {
        let sql = format!(
            "SELECT file_name, lpad(file_offset::text, 8, '0') AS file_offset \
             FROM pg_xlogfile_name_offset(pg_start_backup('{label}'))"
        );
        self.location_query(&sql, "could not start hot backup")
    }

    /// Stop the running hot backup, returning the stop WAL position.
    pub fn backup_stop(&self) -> Result<BackupLocation> {
        let sql = "SELECT file_name, lpad(file_offset::text, 8, '0') AS file_offset \
                   FROM pg_xlogfile_name_offset(pg_stop_backup())";
        self.location_query(sql, "could not stop hot backup")
    }

    fn location_query(&self, sql: &str, failure: &str) -> Result<BackupLocation> {
        let row = self.csv_query(sql, failure)?;
        let [file_name, file_offset] = row.as_slice() else {
            return Err(ArchiveError::Other(format!(
                "unexpected column count from control query: {row:?}"
            )));
        };
        Ok(BackupLocation {
            file_name: SegmentName::parse(file_name)?,
            file_offset: file_offset.clone(),
        })
    }

    /// Run one statement via `COPY ... TO STDOUT WITH CSV HEADER` and
    /// return the single data row.
    fn csv_query(&self, sql: &str, failure: &str) -> Result<Vec<String>> {
        let copy_sql = format!("COPY ({sql}) TO STDOUT WITH CSV HEADER;");

        // Backups can legitimately outlive any statement timeout.
        let mut pgoptions = std::env::var("PGOPTIONS").unwrap_or_default();
        pgoptions.push_str(" --statement-timeout=0");

        let output = Command::new(&self.program)
            .args(["-d", "postgres", "--no-password", "--no-psqlrc", "-c", &copy_sql])
            .env("PGOPTIONS", pgoptions.trim())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .output()
            .map_err(|e| {
                ArchiveError::Config(format!(
                    "could not run '{}': {e} (is it installed?)",
                    self.program
                ))
            })?;

        if !output.status.success() {
            return Err(ArchiveError::Precondition(format!(
                "{failure}: {} exited with {}",
                self.program,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let _header = lines.next().ok_or_else(|| {
            ArchiveError::Other("control query produced no header row".into())
        })?;
        let data = lines.next().ok_or_else(|| {
            ArchiveError::Other("control query produced no data row".into())
        })?;
        // Control values are hex digits and padded decimals; no quoting to
        // worry about.
        Ok(data.split(',').map(|s| s.trim().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Stub psql that prints a canned CSV response.
    fn stub(dir: &std::path::Path, body: &str, exit: i32) -> String {
        let path = dir.join("psql-stub");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nprintf '%s\\n' \"{body}\"\nexit {exit}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn backup_start_parses_position() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub(
            dir.path(),
            "file_name,file_offset\n0000000100000000000000A6,00000040",
            0,
        );
        let control = PgControl::with_program(&program);
        let loc = control.backup_start("test_label").unwrap();
        assert_eq!(loc.file_name.as_str(), "0000000100000000000000A6");
        assert_eq!(loc.file_offset, "00000040");
    }

    #[test]
    fn failing_psql_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub(dir.path(), "", 1);
        let control = PgControl::with_program(&program);
        let err = control.backup_stop().unwrap_err();
        assert!(matches!(err, ArchiveError::Precondition(_)), "got {err}");
    }

    #[test]
    fn missing_psql_is_a_config_error() {
        let control = PgControl::with_program("walstash-no-such-psql");
        let err = control.backup_start("l").unwrap_err();
        assert!(matches!(err, ArchiveError::Config(_)));
    }
}
