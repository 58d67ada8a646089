//! Artifact storage for lotwatch: write-then-swap files, the parquet event table, and the catalog document.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use arrow_array::{Array, Date32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Datelike, NaiveDate};
use lotwatch_core::{CatalogMetadata, EventRow, ListingId, PriceKind};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-storage";

pub const EVENT_SCHEMA_VERSION: &str = "1";
const SCHEMA_VERSION_KEY: &str = "lotwatch.event_schema_version";
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// An earlier artifact at the same path was swapped out.
    pub replaced: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Replace the artifact at `relative` with `bytes`.
    ///
    /// The bytes go to a temp file in the destination directory which is then renamed
    /// over the target, so readers observe either the previous artifact or the new one.
    pub async fn replace_bytes(
        &self,
        relative: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = relative.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let span = info_span!("artifact_replace", path = %absolute_path.display(), bytes = bytes.len());
        self.swap_in(relative_path, absolute_path, bytes)
            .instrument(span)
            .await
    }

    async fn swap_in(
        &self,
        relative_path: PathBuf,
        absolute_path: PathBuf,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let parent = absolute_path
            .parent()
            .ok_or_else(|| anyhow!("artifact path {} has no parent", absolute_path.display()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let replaced = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp artifact file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            replaced,
        })
    }
}

pub fn event_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("listing_id", DataType::Utf8, false),
        ArrowField::new("observation_date", DataType::Date32, false),
        ArrowField::new("manufacturer", DataType::Utf8, true),
        ArrowField::new("model", DataType::Utf8, true),
        ArrowField::new("heading", DataType::Utf8, true),
        ArrowField::new("year", DataType::Int64, false),
        ArrowField::new("mileage", DataType::Int64, false),
        ArrowField::new("fuel", DataType::Utf8, true),
        ArrowField::new("drivetrain", DataType::Utf8, true),
        ArrowField::new("range_km", DataType::Int64, false),
        ArrowField::new("seller", DataType::Utf8, true),
        ArrowField::new("price_numeric", DataType::Int64, false),
        ArrowField::new("price_kind", DataType::Utf8, false),
    ]))
}

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

fn optional_strings<'a>(
    events: &'a [EventRow],
    pick: impl Fn(&'a EventRow) -> &'a Option<String>,
) -> StringArray {
    StringArray::from(events.iter().map(|e| pick(e).as_deref()).collect::<Vec<_>>())
}

fn events_record_batch(events: &[EventRow]) -> anyhow::Result<RecordBatch> {
    let listing_ids = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.listing_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let dates = Date32Array::from(
        events
            .iter()
            .map(|e| date_to_days(e.observation_date))
            .collect::<Vec<_>>(),
    );
    let years = Int64Array::from(events.iter().map(|e| e.year).collect::<Vec<_>>());
    let mileages = Int64Array::from(events.iter().map(|e| e.mileage).collect::<Vec<_>>());
    let ranges = Int64Array::from(events.iter().map(|e| e.range_km).collect::<Vec<_>>());
    let prices = Int64Array::from(events.iter().map(|e| e.price_numeric).collect::<Vec<_>>());
    let price_kinds = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.price_kind.as_str()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        event_schema(),
        vec![
            Arc::new(listing_ids),
            Arc::new(dates),
            Arc::new(optional_strings(events, |e| &e.manufacturer)),
            Arc::new(optional_strings(events, |e| &e.model)),
            Arc::new(optional_strings(events, |e| &e.heading)),
            Arc::new(years),
            Arc::new(mileages),
            Arc::new(optional_strings(events, |e| &e.fuel)),
            Arc::new(optional_strings(events, |e| &e.drivetrain)),
            Arc::new(ranges),
            Arc::new(optional_strings(events, |e| &e.seller)),
            Arc::new(prices),
            Arc::new(price_kinds),
        ],
    )
    .context("building event record batch")
}

/// Encode the consolidated event table as parquet bytes.
///
/// The encoding is a pure function of `events`: equal tables give equal bytes.
pub fn encode_events_parquet(events: &[EventRow]) -> anyhow::Result<Vec<u8>> {
    let batch = events_record_batch(events)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![KeyValue::new(
            SCHEMA_VERSION_KEY.to_string(),
            EVENT_SCHEMA_VERSION.to_string(),
        )]))
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing event record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("event table is missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("event table column {name} has an unexpected type"))
}

fn optional_value(array: &StringArray, idx: usize) -> Option<String> {
    if array.is_null(idx) {
        None
    } else {
        Some(array.value(idx).to_string())
    }
}

fn batch_to_events(batch: &RecordBatch, out: &mut Vec<EventRow>) -> anyhow::Result<()> {
    let listing_ids = column::<StringArray>(batch, "listing_id")?;
    let dates = column::<Date32Array>(batch, "observation_date")?;
    let manufacturers = column::<StringArray>(batch, "manufacturer")?;
    let models = column::<StringArray>(batch, "model")?;
    let headings = column::<StringArray>(batch, "heading")?;
    let years = column::<Int64Array>(batch, "year")?;
    let mileages = column::<Int64Array>(batch, "mileage")?;
    let fuels = column::<StringArray>(batch, "fuel")?;
    let drivetrains = column::<StringArray>(batch, "drivetrain")?;
    let ranges = column::<Int64Array>(batch, "range_km")?;
    let sellers = column::<StringArray>(batch, "seller")?;
    let prices = column::<Int64Array>(batch, "price_numeric")?;
    let price_kinds = column::<StringArray>(batch, "price_kind")?;

    for idx in 0..batch.num_rows() {
        let listing_id = ListingId::normalize(listing_ids.value(idx))
            .ok_or_else(|| anyhow!("row {idx} has an empty listing_id"))?;
        let observation_date = days_to_date(dates.value(idx))
            .ok_or_else(|| anyhow!("row {idx} has an out-of-range observation_date"))?;
        out.push(EventRow {
            listing_id,
            observation_date,
            manufacturer: optional_value(manufacturers, idx),
            model: optional_value(models, idx),
            heading: optional_value(headings, idx),
            year: years.value(idx),
            mileage: mileages.value(idx),
            fuel: optional_value(fuels, idx),
            drivetrain: optional_value(drivetrains, idx),
            range_km: ranges.value(idx),
            seller: optional_value(sellers, idx),
            price_numeric: prices.value(idx),
            price_kind: PriceKind::parse(price_kinds.value(idx)).unwrap_or_default(),
        });
    }
    Ok(())
}

/// Read a consolidated event table back from parquet.
pub fn read_events_parquet(path: &Path) -> anyhow::Result<Vec<EventRow>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let mut events = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        batch_to_events(&batch, &mut events)
            .with_context(|| format!("decoding event rows {}", path.display()))?;
    }
    Ok(events)
}

pub fn encode_catalog(catalog: &CatalogMetadata) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec_pretty(catalog).context("serializing catalog metadata")
}

pub fn load_catalog(path: &Path) -> anyhow::Result<CatalogMetadata> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load the catalog artifact, or [`CatalogMetadata::fallback`] when it is absent or unreadable.
pub fn load_catalog_or_fallback(path: &Path, today: NaiveDate) -> CatalogMetadata {
    match load_catalog(path) {
        Ok(catalog) => catalog,
        Err(err) => {
            warn!(path = %path.display(), error = %format!("{err:#}"), "catalog unavailable; using fallback");
            CatalogMetadata::fallback(today)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(id: &str, day: u32, price: i64, kind: PriceKind) -> EventRow {
        EventRow {
            listing_id: ListingId::normalize(id).unwrap(),
            observation_date: NaiveDate::from_ymd_opt(2025, 7, day).unwrap(),
            manufacturer: Some("Tesla".into()),
            model: Some("Model 3".into()),
            heading: None,
            year: 2020,
            mileage: 45_000,
            fuel: Some("Elektrisk".into()),
            drivetrain: None,
            range_km: 560,
            seller: Some("Forhandler".into()),
            price_numeric: price,
            price_kind: kind,
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn replace_swaps_previous_artifact_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .replace_bytes("consolidated.parquet", b"first")
            .await
            .expect("first write");
        let second = store
            .replace_bytes("consolidated.parquet", b"second version")
            .await
            .expect("second write");

        assert!(!first.replaced);
        assert!(second.replaced);
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(
            std::fs::read(&second.absolute_path).unwrap(),
            b"second version".to_vec()
        );
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn parquet_table_reads_back_with_nulls_and_price_kinds() {
        let events = vec![
            event("100", 1, 100_000, PriceKind::Asking),
            event("100", 20, 0, PriceKind::Sold),
            event("300", 1, 0, PriceKind::Unparsed),
        ];
        let bytes = encode_events_parquet(&events).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("consolidated.parquet");
        std::fs::write(&path, &bytes).unwrap();

        let read = read_events_parquet(&path).unwrap();
        assert_eq!(read, events);
    }

    #[test]
    fn parquet_encoding_is_deterministic_and_handles_empty_tables() {
        let events = vec![event("7", 3, 1, PriceKind::Asking)];
        assert_eq!(
            encode_events_parquet(&events).unwrap(),
            encode_events_parquet(&events).unwrap()
        );

        let empty = encode_events_parquet(&[]).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        std::fs::write(&path, &empty).unwrap();
        assert!(read_events_parquet(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_catalog_falls_back_to_documented_defaults() {
        let dir = tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let catalog = load_catalog_or_fallback(&dir.path().join("catalog.json"), today);
        assert_eq!(catalog, CatalogMetadata::fallback(today));
        assert_eq!(catalog.year_max, 2026);
        assert_eq!(catalog.mileage_max, 300_000);
    }
}
