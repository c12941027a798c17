mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use walstash_core::backup::{self, FetchOptions, PushOptions};
use walstash_core::error::Result;
use walstash_core::pg::PgControl;
use walstash_core::worker::{BACKUP_POOL_SIZE, WAL_PREFETCH_COUNT, WAL_PUSH_POOL_SIZE};
use walstash_core::{prune, wal_transfer};

#[derive(Parser)]
#[command(
    name = "walstash",
    version,
    about = "Continuous PostgreSQL archiving: push and fetch WAL segments and base \
             backups against S3, Azure Blob Storage, Google Cloud Storage, or Swift",
    after_help = "\
Environment:
  Exactly one prefix: WALE_S3_PREFIX, WALE_WABS_PREFIX, WALE_GS_PREFIX,
                      WALE_SWIFT_PREFIX, or WALE_FILE_PREFIX
  Credentials:        AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY / AWS_REGION
                      (+ AWS_SECURITY_TOKEN, WALE_S3_ENDPOINT);
                      WABS_ACCOUNT_NAME + WABS_ACCESS_KEY or WABS_SAS_TOKEN;
                      GS_ACCESS_KEY_ID / GS_SECRET_ACCESS_KEY;
                      SWIFT_AUTHURL / SWIFT_TENANT / SWIFT_USER / SWIFT_PASSWORD
  Optional:           WALE_GPG_KEY_ID, WALE_LOG_DESTINATION (stderr)

Secrets are only ever read from the environment, never from arguments."
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log messages at warning severity or above
    #[arg(long, global = true)]
    terse: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a fresh base backup of a cluster directory
    BackupPush {
        /// Cluster data directory, such as /var/lib/postgresql/data
        data_dir: PathBuf,

        /// Limit cluster directory reads to this many bytes per second
        #[arg(long, value_name = "BYTES_PER_SEC")]
        cluster_read_rate_limit: Option<u64>,

        /// Maximum concurrent partition uploads
        #[arg(long, short = 'p', default_value_t = BACKUP_POOL_SIZE)]
        pool_size: usize,

        /// GPG key ID to encrypt to (also via WALE_GPG_KEY_ID)
        #[arg(long)]
        gpg_key_id: Option<String>,
    },

    /// Fetch a base backup into a cluster directory
    BackupFetch {
        /// Destination cluster data directory
        data_dir: PathBuf,

        /// Backup name, or LATEST for the most recent complete backup
        backup_name: String,

        /// Restore without verifying tablespace symlinks
        #[arg(long)]
        blind_restore: bool,

        /// JSON restore specification for tablespace layout
        #[arg(long, value_name = "PATH")]
        restore_spec: Option<PathBuf>,

        /// Maximum concurrent partition downloads
        #[arg(long, short = 'p', default_value_t = BACKUP_POOL_SIZE)]
        pool_size: usize,
    },

    /// List complete base backups as CSV
    BackupList {
        /// Restrict to one backup name, or LATEST
        query: Option<String>,

        /// Load each backup's manifest for size and stop-position columns
        #[arg(long)]
        detail: bool,
    },

    /// Push a WAL file (archive_command hook)
    WalPush {
        /// Path to the WAL file to upload
        segment_path: PathBuf,

        /// Also drain up to this many ready segments in one invocation
        #[arg(long, short = 'p', default_value_t = WAL_PUSH_POOL_SIZE)]
        pool_size: usize,

        /// GPG key ID to encrypt to (also via WALE_GPG_KEY_ID)
        #[arg(long)]
        gpg_key_id: Option<String>,
    },

    /// Fetch a WAL file (restore_command hook)
    WalFetch {
        /// WAL file name to download
        segment_name: String,

        /// Path to download the WAL file to
        destination: PathBuf,

        /// Number of following segments to prefetch speculatively
        #[arg(long, short = 'p', default_value_t = WAL_PREFETCH_COUNT)]
        prefetch: usize,
    },

    /// Prefetch one WAL segment (spawned internally by wal-fetch)
    WalPrefetch {
        /// Directory that holds the .walstash prefetch tree
        base_directory: PathBuf,

        /// Segment name to download
        segment: String,
    },

    /// Delete archived data. A dry run unless --confirm is passed
    Delete {
        /// Only print what would be deleted
        #[arg(long, short = 'n')]
        dry_run: bool,

        /// Actually delete data; overridden by --dry-run
        #[arg(long)]
        confirm: bool,

        #[command(subcommand)]
        target: DeleteTarget,
    },

    /// Print the version
    Version,
}

#[derive(Subcommand)]
enum DeleteTarget {
    /// Delete backups and WAL strictly before a backup or segment name.
    /// The named backup itself is kept
    Before {
        /// Base backup name or WAL segment name
        name: String,
    },

    /// Keep the N most recent backups, delete everything older
    Retain {
        /// Number of base backups to keep
        count: usize,
    },

    /// Delete data left behind by obsolete storage-layout versions
    OldVersions,

    /// Delete every key under the prefix
    Everything,
}

fn init_logging(verbose: u8, terse: bool) {
    let level = if terse {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if let Ok(dest) = std::env::var("WALE_LOG_DESTINATION") {
        if dest != "stderr" {
            eprintln!("walstash: log destination '{dest}' is not supported, using stderr");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.terse);

    std::process::exit(match run(cli.command) {
        Ok(()) => 0,
        Err(e) => {
            if e.is_not_found() {
                // wal-fetch end-of-archive: expected during recovery, not
                // an operator-facing failure.
                tracing::info!("object not present in archive: {e}");
            } else {
                tracing::error!("{e}");
            }
            e.exit_code()
        }
    });
}

fn run(command: Commands) -> Result<()> {
    if let Commands::Version = command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    match command {
        Commands::BackupPush {
            data_dir,
            cluster_read_rate_limit,
            pool_size,
            gpg_key_id,
        } => {
            let ctx = config::context_from_env(gpg_key_id)?;
            let opts = PushOptions {
                pool_size,
                rate_limit: cluster_read_rate_limit,
                ..PushOptions::default()
            };
            backup::backup_push(&ctx, &PgControl::default(), &data_dir, &opts)?;
            Ok(())
        }
        Commands::BackupFetch {
            data_dir,
            backup_name,
            blind_restore,
            restore_spec,
            pool_size,
        } => {
            let ctx = config::context_from_env(None)?;
            let opts = FetchOptions {
                pool_size,
                blind_restore,
                restore_spec,
            };
            backup::backup_fetch(&ctx, &data_dir, &backup_name, &opts)
        }
        Commands::BackupList { query, detail } => {
            let ctx = config::context_from_env(None)?;
            backup::backup_list(&ctx, query.as_deref(), detail, &mut std::io::stdout())
        }
        Commands::WalPush {
            segment_path,
            pool_size,
            gpg_key_id,
        } => {
            let ctx = config::context_from_env(gpg_key_id)?;
            wal_transfer::wal_push(&ctx, &segment_path, pool_size)
        }
        Commands::WalFetch {
            segment_name,
            destination,
            prefetch,
        } => {
            let ctx = config::context_from_env(None)?;
            wal_transfer::wal_fetch(&ctx, &segment_name, &destination, prefetch)
        }
        Commands::WalPrefetch {
            base_directory,
            segment,
        } => {
            let ctx = config::context_from_env(None)?;
            wal_transfer::wal_prefetch(&ctx, &base_directory, &segment)
        }
        Commands::Delete {
            dry_run,
            confirm,
            target,
        } => {
            let ctx = config::context_from_env(None)?;
            // Optimize for not deleting data: any --dry-run wins.
            let confirm_really = confirm && !dry_run;
            let plan = match target {
                DeleteTarget::Before { name } => {
                    prune::plan_before(&ctx, prune::parse_horizon(&name)?)?
                }
                DeleteTarget::Retain { count } => prune::plan_retain(&ctx, count)?,
                DeleteTarget::OldVersions => prune::plan_old_versions(&ctx)?,
                DeleteTarget::Everything => prune::plan_everything(&ctx)?,
            };
            prune::execute(&ctx, &plan, confirm_really, &mut std::io::stdout())
        }
        Commands::Version => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn delete_subcommands_parse() {
        let cli = Cli::parse_from([
            "walstash",
            "delete",
            "--confirm",
            "before",
            "base_0000000100000000000000A6_00000040",
        ]);
        match cli.command {
            Commands::Delete {
                confirm, dry_run, ..
            } => {
                assert!(confirm);
                assert!(!dry_run);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn pool_size_defaults_follow_operation() {
        let cli = Cli::parse_from(["walstash", "wal-push", "/wal/000000010000000000000001"]);
        match cli.command {
            Commands::WalPush { pool_size, .. } => assert_eq!(pool_size, WAL_PUSH_POOL_SIZE),
            _ => panic!("wrong command"),
        }

        let cli = Cli::parse_from(["walstash", "backup-push", "/data"]);
        match cli.command {
            Commands::BackupPush { pool_size, .. } => assert_eq!(pool_size, BACKUP_POOL_SIZE),
            _ => panic!("wrong command"),
        }
    }
}
