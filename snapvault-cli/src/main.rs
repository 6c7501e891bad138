/*!
Snapvault CLI - snapshot retention and replication across a local directory
and an S3 bucket.

Every setting can come from a flag, an environment variable or a JSON config
file, in that order of precedence.
*/

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use snapvault_core::observability::{gather_metrics, init_observability, LogFormat};
use snapvault_core::storage::SnapshotStore;
use snapvault_core::{
    AppConfig, CleanupReport, CompressionAlgorithm, IngestOptions, LocalSnapshotStore, Mode,
    S3Config, Scope, SnapshotEngine, StatusRow, StorageUri,
};
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

type Engine = SnapshotEngine<LocalSnapshotStore, Box<dyn SnapshotStore>>;

#[derive(Parser, Debug)]
#[command(name = "snapvault")]
#[command(about = "Snapshot retention and replication across local disk and S3")]
#[command(version)]
struct Cli {
    /// Log level or filter directive
    #[arg(long, global = true, env = "SNAPVAULT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format (console or json)
    #[arg(long, global = true, env = "SNAPVAULT_LOG_FORMAT", default_value = "console")]
    log_format: LogFormat,

    /// JSON configuration file
    #[arg(long, global = true, env = "SNAPVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Write Prometheus metrics to this file when the command finishes
    #[arg(long, global = true, env = "SNAPVAULT_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct StorageArgs {
    /// Local snapshot directory
    #[arg(long, global = true, env = "SNAPVAULT_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,

    /// S3 bucket; omit to run local-only
    #[arg(long, global = true, env = "AWS_S3_BUCKET")]
    bucket: Option<String>,

    /// AWS region
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, global = true, env = "SNAPVAULT_S3_PREFIX")]
    prefix: Option<String>,

    /// Endpoint for S3-compatible stores
    #[arg(long, global = true, env = "AWS_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    /// Compression for new snapshots (none, gzip, bzip2, lz4, zstd)
    #[arg(long, global = true, env = "SNAPVAULT_COMPRESSION")]
    compression: Option<CompressionAlgorithm>,
}

#[derive(Args, Debug, Default)]
struct PolicyArgs {
    /// Keep the newest N snapshots
    #[arg(long, global = true, env = "SNAPVAULT_KEEP_LAST")]
    keep_last: Option<usize>,

    /// Keep snapshots younger than N hours
    #[arg(long, global = true, env = "SNAPVAULT_KEEP_HOURS")]
    keep_hours: Option<u32>,

    /// Keep snapshots younger than N days
    #[arg(long, global = true, env = "SNAPVAULT_KEEP_DAYS")]
    keep_days: Option<u32>,

    /// Keep snapshots younger than N weeks
    #[arg(long, global = true, env = "SNAPVAULT_KEEP_WEEKS")]
    keep_weeks: Option<u32>,

    /// Keep snapshots younger than N 30-day months
    #[arg(long, global = true, env = "SNAPVAULT_KEEP_MONTHS")]
    keep_months: Option<u32>,

    /// Keep snapshots younger than N 365-day years
    #[arg(long, global = true, env = "SNAPVAULT_KEEP_YEARS")]
    keep_years: Option<u32>,
}

#[derive(Args, Debug, Clone, Copy)]
struct ScopeArgs {
    /// Only the local directory
    #[arg(long, conflicts_with = "remote")]
    local: bool,

    /// Only the remote bucket
    #[arg(long)]
    remote: bool,

    /// Evaluate each store on its own listing instead of one merged view
    #[arg(long)]
    separate: bool,
}

impl ScopeArgs {
    fn scope(self) -> Scope {
        match (self.local, self.remote) {
            (true, _) => Scope::Local,
            (_, true) => Scope::Remote,
            _ => Scope::Both,
        }
    }

    fn mode(self) -> Mode {
        if self.separate {
            Mode::Separate
        } else {
            Mode::Unified
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List snapshots with their retention status
    List {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Delete snapshots the retention policy no longer keeps
    Cleanup {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Compress a raw snapshot into the local store and replicate it
    Push {
        /// Raw snapshot file produced by the backup tool
        file: PathBuf,

        /// Snapshot name; defaults to a timestamped name
        #[arg(long)]
        name: Option<String>,

        /// Keep the snapshot local only
        #[arg(long)]
        no_upload: bool,

        /// Remove the local copy after a successful upload
        #[arg(long)]
        remove_local: bool,

        /// Skip retention cleanup afterwards
        #[arg(long)]
        no_retention: bool,
    },
    /// Upload kept local snapshots that are missing remotely
    Sync,
    /// Restore a snapshot by name, path or s3:// URI
    Restore {
        source: String,

        /// Directory for the restored .db file
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Modified")]
    modified: String,
    #[tabled(rename = "Retention")]
    retention: String,
}

impl From<&StatusRow> for SnapshotRow {
    fn from(row: &StatusRow) -> Self {
        Self {
            name: row.name.clone(),
            location: row.location.to_string(),
            size: format_size(row.size),
            modified: format_timestamp(row.modified_at),
            retention: if row.keep { "keep" } else { "delete" }.to_string(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_observability(cli.log_format, &cli.log_level)?;

    let mut config = build_config(&cli)?;
    let result = run(&cli, &mut config);

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

fn run(cli: &Cli, config: &mut AppConfig) -> anyhow::Result<()> {
    match &cli.command {
        Commands::List { scope, format } => {
            let engine = build_engine(config, true)?;
            list_snapshots(&engine, *scope, *format)
        }
        Commands::Cleanup { scope, dry_run } => {
            let engine = build_engine(config, false)?;
            let report = engine.cleanup(scope.scope(), scope.mode(), *dry_run)?;
            print_cleanup(&report);
            if report.has_failures() {
                bail!("cleanup finished with deletion failures");
            }
            Ok(())
        }
        Commands::Push {
            file,
            name,
            no_upload,
            remove_local,
            no_retention,
        } => {
            let engine = build_engine(config, false)?;
            let options = IngestOptions {
                name: name.clone(),
                compression: None,
                upload: !no_upload,
                remove_local: *remove_local,
                apply_retention: !no_retention,
            };
            let report = engine.ingest(file, options)?;
            println!("Stored {}", report.name);
            if report.uploaded {
                println!("Uploaded to {}", remote_description(&engine));
            } else if let Some(e) = &report.upload_error {
                println!("Upload failed, snapshot kept locally: {e}");
            }
            if let Some(cleanup) = &report.cleanup {
                print_cleanup(cleanup);
            }
            Ok(())
        }
        Commands::Sync => {
            let engine = build_engine(config, false)?;
            let report = engine.sync_missing()?;
            if report.is_skipped() {
                println!("Remote store unavailable; gap detection skipped");
                return Ok(());
            }
            println!(
                "{} missing, {} uploaded, {} failed",
                report.scan.len(),
                report.uploaded.len(),
                report.failed.len()
            );
            for (name, e) in &report.failed {
                println!("  {name}: {e}");
            }
            if !report.failed.is_empty() {
                bail!("{} uploads failed", report.failed.len());
            }
            Ok(())
        }
        Commands::Restore { source, output_dir } => {
            retarget_remote(config, &StorageUri::parse(source)?)?;
            let engine = build_engine(config, false)?;
            let restored = engine.restore(source, output_dir)?;
            println!("Restored {}", restored.display());
            Ok(())
        }
    }
}

/// Merge the config file, environment and flags into one validated config
fn build_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };

    let storage = &cli.storage;
    if let Some(dir) = &storage.snapshot_dir {
        config.local.snapshot_dir = dir.clone();
    }
    if let Some(compression) = storage.compression {
        config.compression = compression;
    }
    if let Some(bucket) = &storage.bucket {
        let remote = config.remote.get_or_insert_with(|| S3Config::new(bucket.clone()));
        remote.bucket = bucket.clone();
    }
    if let Some(remote) = config.remote.as_mut() {
        if let Some(region) = &storage.region {
            remote.region = Some(region.clone());
        }
        if let Some(prefix) = &storage.prefix {
            remote.prefix = prefix.clone();
        }
        if let Some(endpoint) = &storage.endpoint_url {
            remote.endpoint_url = Some(endpoint.clone());
        }
    }

    let policy = &cli.policy;
    let overrides = [
        (policy.keep_hours, &mut config.policy.keep_hours),
        (policy.keep_days, &mut config.policy.keep_days),
        (policy.keep_weeks, &mut config.policy.keep_weeks),
        (policy.keep_months, &mut config.policy.keep_months),
        (policy.keep_years, &mut config.policy.keep_years),
    ];
    for (value, field) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }
    if let Some(keep_last) = policy.keep_last {
        config.policy.keep_last = keep_last;
    }

    config.validate()?;
    Ok(config)
}

/// Point the remote tier at the bucket and prefix of an `s3://` URI
fn retarget_remote(config: &mut AppConfig, uri: &StorageUri) -> anyhow::Result<()> {
    let StorageUri::Remote { bucket, .. } = uri else {
        return Ok(());
    };
    let remote = config
        .remote
        .get_or_insert_with(|| S3Config::new(bucket.clone()));
    remote.bucket = bucket.clone();
    remote.prefix = uri.key_prefix().unwrap_or_default().to_string();
    remote.validate()?;
    Ok(())
}

/// Wire up both stores; read-only commands fall back to local-only when the
/// remote cannot be reached
fn build_engine(config: &AppConfig, read_only: bool) -> anyhow::Result<Engine> {
    let remote = match &config.remote {
        Some(s3) => match connect_remote(s3) {
            Ok(store) => Some(store),
            Err(e) if read_only => {
                warn!(bucket = %s3.bucket, error = %e, "Remote store unavailable; showing local snapshots only");
                None
            }
            Err(e) => return Err(e),
        },
        None => {
            info!("No bucket configured; running local-only");
            None
        }
    };

    Ok(SnapshotEngine::new(
        LocalSnapshotStore::new(&config.local.snapshot_dir),
        remote,
        config.policy,
    )
    .with_compression(config.compression))
}

#[cfg(feature = "s3")]
fn connect_remote(config: &S3Config) -> anyhow::Result<Box<dyn SnapshotStore>> {
    let store = snapvault_core::S3SnapshotStore::new(config)
        .with_context(|| format!("connecting to s3://{}", config.bucket))?;
    Ok(Box::new(store))
}

#[cfg(not(feature = "s3"))]
fn connect_remote(config: &S3Config) -> anyhow::Result<Box<dyn SnapshotStore>> {
    bail!(
        "bucket '{}' configured but this build has no S3 support",
        config.bucket
    )
}

fn remote_description(engine: &Engine) -> String {
    engine
        .remote()
        .map(|remote| remote.describe())
        .unwrap_or_else(|| "remote store".to_string())
}

fn list_snapshots(engine: &Engine, scope: ScopeArgs, format: OutputFormat) -> anyhow::Result<()> {
    let rows = engine.status(scope.scope(), scope.mode())?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table if rows.is_empty() => println!("No snapshots found"),
        OutputFormat::Table => {
            let table = Table::new(rows.iter().map(SnapshotRow::from));
            println!("{table}");
            let kept = rows.iter().filter(|row| row.keep).count();
            println!(
                "{} snapshots, {} kept, {} to delete ({} mode)",
                rows.len(),
                kept,
                rows.len() - kept,
                scope.mode()
            );
        }
    }
    Ok(())
}

fn print_cleanup(report: &CleanupReport) {
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    for store in report.stores() {
        println!(
            "{}: kept {}, {} {}",
            store.location,
            store.kept.len(),
            verb.to_lowercase(),
            store.deleted.len()
        );
        for name in &store.deleted {
            println!("  {verb} {name}");
        }
        for name in &store.failed {
            println!("  Kept after failed delete: {name}");
        }
        if let Some(e) = &store.error {
            println!("  Deletion failed: {e}");
        }
    }
}

fn write_metrics(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, gather_metrics()?)?;
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "unknown".to_string(),
    }
}
