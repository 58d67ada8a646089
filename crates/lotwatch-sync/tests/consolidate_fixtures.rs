use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use lotwatch_adapters::{SnapshotFormat, TextEncoding};
use lotwatch_core::{CatalogMetadata, DiagnosticKind, PriceKind};
use lotwatch_storage::{load_catalog, read_events_parquet, ArtifactStore};
use lotwatch_sync::{ArtifactManifest, SyncConfig, SyncPipeline};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn fixture_config(out: &Path, min_date: Option<NaiveDate>) -> SyncConfig {
    SyncConfig {
        snapshot_dir: workspace_root().join("fixtures/snapshots"),
        format: SnapshotFormat {
            encoding: TextEncoding::Utf8,
            ..SnapshotFormat::default()
        },
        min_date,
        artifacts_dir: out.join("artifacts"),
        parse_workers: 2,
        workspace_root: out.to_path_buf(),
    }
}

#[tokio::test]
async fn fixture_history_consolidates_into_artifacts() {
    let out = tempfile::tempdir().unwrap();
    let pipeline = SyncPipeline::new(fixture_config(out.path(), None));
    let summary = pipeline.run_once().await.expect("consolidation run");

    assert_eq!(summary.stats.snapshots, 3);
    assert_eq!(summary.stats.raw_rows, 12);
    assert_eq!(summary.stats.dropped_rows, 1);
    assert_eq!(summary.stats.superseded_rows, 1);
    assert_eq!(summary.event_rows, 10);
    assert_eq!(summary.listings, 5);
    assert_eq!(summary.latest_date, Some(date(2025, 7, 20)));
    assert_eq!(summary.diagnostics.len(), 1);
    assert_eq!(summary.diagnostics[0].kind, DiagnosticKind::InvalidFileDate);
    assert!(summary.diagnostics[0].path.ends_with("biler_alle_31-02-2025.csv"));

    let events = read_events_parquet(Path::new(&summary.consolidated_path)).unwrap();
    assert_eq!(events.len(), 10);
    let keys = events
        .iter()
        .map(|e| (e.observation_date.to_string(), e.listing_id.to_string()))
        .collect::<Vec<_>>();
    let mut sorted = keys.clone();
    sorted.sort_by(|a, b| (&a.0, a.1.len(), &a.1).cmp(&(&b.0, b.1.len(), &b.1)));
    assert_eq!(keys, sorted);

    let first = &events[0];
    assert_eq!(first.listing_id.as_str(), "100");
    assert_eq!(first.heading.as_deref(), Some("Tesla Model 3 Long Range AWD"));
    assert_eq!(first.model.as_deref(), Some("Model 3"));
    assert_eq!(first.range_km, 560);

    let unpriced = events
        .iter()
        .find(|e| e.listing_id.as_str() == "300")
        .unwrap();
    assert_eq!(unpriced.fuel, None);
    assert_eq!((unpriced.price_numeric, unpriced.price_kind), (0, PriceKind::Unparsed));

    let repriced = events
        .iter()
        .find(|e| e.listing_id.as_str() == "200" && e.observation_date == date(2025, 7, 10))
        .unwrap();
    assert_eq!(repriced.price_numeric, 330_000);
    assert_eq!(repriced.heading.as_deref(), Some("Volvo XC40 Recharge - prisjustert"));

    let sold = events
        .iter()
        .filter(|e| e.observation_date == date(2025, 7, 20) && e.is_sold())
        .map(|e| (e.listing_id.to_string(), e.price_kind))
        .collect::<Vec<_>>();
    assert_eq!(
        sold,
        vec![
            ("100".to_string(), PriceKind::Sold),
            ("400".to_string(), PriceKind::Sold)
        ]
    );

    let catalog: CatalogMetadata = load_catalog(Path::new(&summary.catalog_path)).unwrap();
    assert_eq!(catalog.manufacturers, vec!["Tesla", "Volvo"]);
    assert_eq!(catalog.models_for("Tesla"), ["Model 3", "Model Y"]);
    assert_eq!(catalog.models_for("Volvo"), ["V60", "XC40"]);
    assert_eq!(catalog.fuel_options, vec!["Diesel", "Elektrisk"]);
    assert_eq!(catalog.drivetrain_options, vec!["Firehjulsdrift", "Forhjulsdrift"]);
    assert_eq!((catalog.year_min, catalog.year_max), (2017, 2023));
    assert_eq!((catalog.mileage_min, catalog.mileage_max), (8_000, 120_000));
    assert_eq!(catalog.latest_date, Some(date(2025, 7, 20)));

    let manifest: ArtifactManifest =
        serde_json::from_slice(&std::fs::read(&summary.manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.files.len(), 2);
    for file in &manifest.files {
        let bytes = std::fs::read(out.path().join("artifacts").join(&file.path)).unwrap();
        assert_eq!(file.sha256, ArtifactStore::sha256_hex(&bytes));
        assert_eq!(file.bytes, bytes.len() as u64);
    }

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&summary.report_path).unwrap()).unwrap();
    assert_eq!(report["event_rows"], 10);
    assert_eq!(report["diagnostics"][0]["kind"], "invalid_file_date");
    assert!(Path::new(&summary.report_path).starts_with(out.path().join("reports")));
}

#[tokio::test]
async fn reruns_are_byte_identical_and_cutoff_limits_history() {
    let out = tempfile::tempdir().unwrap();
    let pipeline = SyncPipeline::new(fixture_config(out.path(), None));
    let first = pipeline.run_once().await.unwrap();
    let first_bytes = std::fs::read(&first.consolidated_path).unwrap();
    let second = pipeline.run_once().await.unwrap();
    assert_eq!(std::fs::read(&second.consolidated_path).unwrap(), first_bytes);
    assert_ne!(first.run_id, second.run_id);

    let cut = tempfile::tempdir().unwrap();
    let summary = SyncPipeline::new(fixture_config(cut.path(), Some(date(2025, 7, 10))))
        .run_once()
        .await
        .unwrap();
    assert_eq!(summary.stats.snapshots, 2);
    assert_eq!(summary.event_rows, 7);
    let events = read_events_parquet(Path::new(&summary.consolidated_path)).unwrap();
    assert!(events.iter().all(|e| e.observation_date >= date(2025, 7, 10)));
}

#[tokio::test]
async fn empty_snapshot_directory_yields_empty_artifacts() {
    let out = tempfile::tempdir().unwrap();
    let snapshots = out.path().join("snapshots");
    std::fs::create_dir(&snapshots).unwrap();
    let config = SyncConfig {
        snapshot_dir: snapshots,
        ..fixture_config(out.path(), None)
    };
    let summary = SyncPipeline::new(config).run_once().await.unwrap();
    assert_eq!(summary.event_rows, 0);
    assert!(summary.diagnostics.is_empty());
    assert!(read_events_parquet(Path::new(&summary.consolidated_path))
        .unwrap()
        .is_empty());
    let catalog = load_catalog(Path::new(&summary.catalog_path)).unwrap();
    assert_eq!(catalog, CatalogMetadata::default());
}
