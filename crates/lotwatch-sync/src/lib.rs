//! Consolidation run orchestration: discovery, parallel parsing, the event table fold, and artifact export.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use lotwatch_adapters::{
    classify_file_name, parse_snapshot, ParsedSnapshot, SnapshotError, SnapshotFile, SnapshotFormat,
    SnapshotName, TextEncoding,
};
use lotwatch_core::{CatalogMetadata, Diagnosed, Diagnostic, EventRow, ListingId, PriceKind, RawSnapshotRow};
use lotwatch_storage::{encode_catalog, encode_events_parquet, ArtifactStore, StoredArtifact};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-sync";

pub const CONSOLIDATED_ARTIFACT: &str = "consolidated.parquet";
pub const CATALOG_ARTIFACT: &str = "catalog.json";
pub const MANIFEST_ARTIFACT: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub snapshot_dir: PathBuf,
    pub format: SnapshotFormat,
    /// Snapshots observed before this date are left out of the run.
    pub min_date: Option<NaiveDate>,
    pub artifacts_dir: PathBuf,
    /// Parser threads; 0 means one per core.
    pub parse_workers: usize,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = SnapshotFormat::default();
        Self {
            snapshot_dir: std::env::var("LOTWATCH_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            format: SnapshotFormat {
                prefix: std::env::var("LOTWATCH_SNAPSHOT_PREFIX").unwrap_or(defaults.prefix),
                extension: std::env::var("LOTWATCH_SNAPSHOT_EXTENSION").unwrap_or(defaults.extension),
                delimiter: std::env::var("LOTWATCH_SNAPSHOT_DELIMITER")
                    .ok()
                    .and_then(|v| parse_delimiter(&v))
                    .unwrap_or(defaults.delimiter),
                encoding: std::env::var("LOTWATCH_SNAPSHOT_ENCODING")
                    .ok()
                    .and_then(|v| TextEncoding::parse(&v))
                    .unwrap_or(defaults.encoding),
            },
            min_date: std::env::var("LOTWATCH_MIN_DATE")
                .ok()
                .and_then(|v| match NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d") {
                    Ok(date) => Some(date),
                    Err(err) => {
                        warn!(value = %v, error = %err, "ignoring LOTWATCH_MIN_DATE");
                        None
                    }
                }),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            parse_workers: std::env::var("LOTWATCH_PARSE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            workspace_root: std::env::var("LOTWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// A single-byte ASCII delimiter; anything else is rejected.
pub fn parse_delimiter(value: &str) -> Option<u8> {
    match value.as_bytes() {
        [byte] if byte.is_ascii() => Some(*byte),
        _ => None,
    }
}

/// List the snapshot files in `dir` that fall on or after `min_date`, ordered by (date, path).
///
/// Names that do not look like snapshots are skipped silently. A snapshot-shaped name whose
/// date token is not a calendar date is reported as a diagnostic.
pub fn discover_snapshots(
    dir: &Path,
    format: &SnapshotFormat,
    min_date: Option<NaiveDate>,
) -> Result<Diagnosed<Vec<SnapshotFile>>> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading snapshot directory {}", dir.display()))?;

    let mut files = Vec::new();
    let mut diagnostics = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        match classify_file_name(&name, format) {
            SnapshotName::Skip => {}
            SnapshotName::InvalidDate(token) => {
                let err = SnapshotError::InvalidDate { name, token };
                warn!(path = %path.display(), error = %err, "excluding snapshot");
                diagnostics.push(err.to_diagnostic(&path));
            }
            SnapshotName::Dated(observed_on) => {
                if min_date.is_some_and(|cutoff| observed_on < cutoff) {
                    continue;
                }
                files.push(SnapshotFile { observed_on, path });
            }
        }
    }
    files.sort();
    diagnostics.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Diagnosed::with_diagnostics(files, diagnostics))
}

/// Parse every file on a rayon pool. Results come back in input order; failures become diagnostics.
pub fn parse_snapshots(
    files: &[SnapshotFile],
    format: &SnapshotFormat,
    workers: usize,
) -> Diagnosed<Vec<ParsedSnapshot>> {
    if files.is_empty() {
        return Diagnosed::clean(Vec::new());
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build();
    let results: Vec<Result<ParsedSnapshot, SnapshotError>> = match pool {
        Ok(pool) => pool.install(|| files.par_iter().map(|f| parse_snapshot(f, format)).collect()),
        Err(err) => {
            warn!(error = %err, "parser pool unavailable; parsing sequentially");
            files.iter().map(|f| parse_snapshot(f, format)).collect()
        }
    };

    let mut parsed = Vec::with_capacity(results.len());
    let mut diagnostics = Vec::new();
    for (file, result) in files.iter().zip(results) {
        match result {
            Ok(snapshot) => parsed.push(snapshot),
            Err(err) => {
                warn!(path = %file.path.display(), error = %err, "excluding snapshot");
                diagnostics.push(err.to_diagnostic(&file.path));
            }
        }
    }
    Diagnosed::with_diagnostics(parsed, diagnostics)
}

/// Integer value of a numeric cell; decimals truncate toward zero and anything else is 0.
pub fn coerce_int(value: Option<&str>) -> i64 {
    let Some(text) = value.map(str::trim).filter(|t| !t.is_empty()) else {
        return 0;
    };
    if let Ok(n) = text.parse::<i64>() {
        return n;
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() && f.abs() < i64::MAX as f64 => f.trunc() as i64,
        _ => 0,
    }
}

/// Numeric price and its provenance. Sold markers and unreadable prices both map to 0.
pub fn parse_price(value: Option<&str>) -> (i64, PriceKind) {
    let Some(text) = value.map(str::trim).filter(|t| !t.is_empty()) else {
        return (0, PriceKind::Missing);
    };
    if text.eq_ignore_ascii_case("solgt") {
        return (0, PriceKind::Sold);
    }
    let is_number = text.parse::<i64>().is_ok() || text.parse::<f64>().is_ok_and(f64::is_finite);
    if is_number {
        (coerce_int(Some(text)).max(0), PriceKind::Asking)
    } else {
        (0, PriceKind::Unparsed)
    }
}

/// Type one raw row; `None` when the identifier has no digits.
pub fn fold_raw_row(row: RawSnapshotRow, observation_date: NaiveDate) -> Option<EventRow> {
    let listing_id = ListingId::normalize(row.raw_id.as_deref()?)?;
    let (price_numeric, price_kind) = parse_price(row.price.as_deref());
    Some(EventRow {
        listing_id,
        observation_date,
        year: coerce_int(row.year.as_deref()),
        mileage: coerce_int(row.mileage.as_deref()),
        range_km: coerce_int(row.range.as_deref()),
        manufacturer: row.manufacturer,
        model: row.model,
        heading: row.heading,
        fuel: row.fuel,
        drivetrain: row.drivetrain,
        seller: row.seller,
        price_numeric,
        price_kind,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    pub snapshots: usize,
    pub raw_rows: usize,
    /// Rows whose identifier carried no digits.
    pub dropped_rows: usize,
    /// Rows superseded by a later row for the same (listing, date).
    pub superseded_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedTable {
    pub events: Vec<EventRow>,
    pub stats: ConsolidationStats,
}

/// Fold parsed snapshots into the event table, sorted by (observation_date, listing_id).
///
/// Snapshots are ordered by (date, path) first, so the output does not depend on the order
/// they arrive in. Within one (listing, date) the last written row wins.
pub fn consolidate(mut snapshots: Vec<ParsedSnapshot>) -> ConsolidatedTable {
    snapshots.sort_by(|a, b| (a.observed_on, &a.path).cmp(&(b.observed_on, &b.path)));

    let mut stats = ConsolidationStats {
        snapshots: snapshots.len(),
        ..ConsolidationStats::default()
    };
    let mut events = Vec::new();
    for snapshot in snapshots {
        stats.raw_rows += snapshot.rows.len();
        for row in snapshot.rows {
            match fold_raw_row(row, snapshot.observed_on) {
                Some(event) => events.push(event),
                None => stats.dropped_rows += 1,
            }
        }
    }

    events.sort_by(|a, b| a.table_key().cmp(&b.table_key()));
    let before = events.len();
    // `later` follows `kept` in write order; swapping keeps the last write in the surviving slot.
    events.dedup_by(|later, kept| {
        if later.table_key() == kept.table_key() {
            std::mem::swap(later, kept);
            true
        } else {
            false
        }
    });
    stats.superseded_rows = before - events.len();

    ConsolidatedTable { events, stats }
}

/// Discover, parse and consolidate every snapshot the configuration selects.
pub fn consolidate_directory(config: &SyncConfig) -> Result<Diagnosed<ConsolidatedTable>> {
    let discovered = discover_snapshots(&config.snapshot_dir, &config.format, config.min_date)?;
    Ok(discovered
        .and_then(|files| parse_snapshots(&files, &config.format, config.parse_workers))
        .map(consolidate))
}

/// Filter domains and numeric ranges of an event table. An empty table gives the empty catalog.
pub fn summarize_catalog(events: &[EventRow]) -> CatalogMetadata {
    if events.is_empty() {
        return CatalogMetadata::default();
    }

    let mut manufacturers = BTreeSet::new();
    let mut models: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut fuels = BTreeSet::new();
    let mut drivetrains = BTreeSet::new();
    for event in events {
        if let Some(manufacturer) = &event.manufacturer {
            manufacturers.insert(manufacturer.clone());
            if let Some(model) = &event.model {
                models
                    .entry(manufacturer.clone())
                    .or_default()
                    .insert(model.clone());
            }
        }
        if let Some(fuel) = &event.fuel {
            fuels.insert(fuel.clone());
        }
        if let Some(drivetrain) = &event.drivetrain {
            drivetrains.insert(drivetrain.clone());
        }
    }

    let years = events.iter().map(|e| e.year);
    let mileages = events.iter().map(|e| e.mileage);
    CatalogMetadata {
        manufacturers: manufacturers.into_iter().collect(),
        models_by_manufacturer: models
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect(),
        fuel_options: fuels.into_iter().collect(),
        drivetrain_options: drivetrains.into_iter().collect(),
        year_min: years.clone().min().unwrap_or(0),
        year_max: years.max().unwrap_or(0),
        mileage_min: mileages.clone().min().unwrap_or(0),
        mileage_max: mileages.max().unwrap_or(0),
        latest_date: events.iter().map(|e| e.observation_date).max(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl ManifestFile {
    fn from_stored(name: &str, stored: &StoredArtifact) -> Self {
        Self {
            name: name.to_string(),
            path: stored.relative_path.display().to_string(),
            sha256: stored.content_hash.clone(),
            bytes: stored.byte_size as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_dir: String,
    pub min_date: Option<NaiveDate>,
    pub stats: ConsolidationStats,
    pub event_rows: usize,
    pub listings: usize,
    pub latest_date: Option<NaiveDate>,
    pub diagnostics: Vec<Diagnostic>,
    pub consolidated_path: String,
    pub catalog_path: String,
    pub manifest_path: String,
    pub report_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    artifact_store: ArtifactStore,
    report_store: ArtifactStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let report_store = ArtifactStore::new(config.workspace_root.join("reports"));
        Self {
            config,
            artifact_store,
            report_store,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Rebuild every artifact from the full snapshot history.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("consolidation_run", %run_id, snapshot_dir = %self.config.snapshot_dir.display());
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let config = self.config.clone();
        let consolidated = tokio::task::spawn_blocking(move || consolidate_directory(&config))
            .await
            .context("joining snapshot parser task")??;
        let Diagnosed {
            value: table,
            diagnostics,
        } = consolidated;

        let catalog = summarize_catalog(&table.events);
        let listings = table
            .events
            .iter()
            .map(|e| &e.listing_id)
            .collect::<BTreeSet<_>>()
            .len();

        let parquet = encode_events_parquet(&table.events)?;
        let consolidated_artifact = self
            .artifact_store
            .replace_bytes(CONSOLIDATED_ARTIFACT, &parquet)
            .await?;
        let catalog_artifact = self
            .artifact_store
            .replace_bytes(CATALOG_ARTIFACT, &encode_catalog(&catalog)?)
            .await?;

        let manifest = ArtifactManifest {
            schema_version: 1,
            files: vec![
                ManifestFile::from_stored("consolidated", &consolidated_artifact),
                ManifestFile::from_stored("catalog", &catalog_artifact),
            ],
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).context("serializing artifact manifest")?;
        let manifest_artifact = self
            .artifact_store
            .replace_bytes(MANIFEST_ARTIFACT, &manifest_bytes)
            .await?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            snapshot_dir: self.config.snapshot_dir.display().to_string(),
            min_date: self.config.min_date,
            event_rows: table.events.len(),
            stats: table.stats,
            listings,
            latest_date: catalog.latest_date,
            diagnostics,
            consolidated_path: consolidated_artifact.absolute_path.display().to_string(),
            catalog_path: catalog_artifact.absolute_path.display().to_string(),
            manifest_path: manifest_artifact.absolute_path.display().to_string(),
            report_path: self
                .report_store
                .path_of(Path::new(&run_id.to_string()).join("run.json"))
                .display()
                .to_string(),
        };
        self.write_report(&mut summary).await?;

        info!(
            events = summary.event_rows,
            listings = summary.listings,
            dropped_rows = summary.stats.dropped_rows,
            excluded_files = summary.diagnostics.len(),
            "consolidation run complete"
        );
        Ok(summary)
    }

    async fn write_report(&self, summary: &mut RunSummary) -> Result<()> {
        summary.finished_at = Utc::now();
        let relative = Path::new(&summary.run_id.to_string()).join("run.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run report")?;
        let stored = self.report_store.replace_bytes(&relative, &bytes).await?;
        summary.report_path = stored.absolute_path.display().to_string();
        Ok(())
    }
}

pub async fn run_consolidation_from_env() -> Result<RunSummary> {
    SyncPipeline::new(SyncConfig::from_env()).run_once().await
}

/// Today's date in local time, the default upper bound for queries and catalog fallbacks.
pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}
