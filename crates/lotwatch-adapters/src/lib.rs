//! Snapshot file adapters: file-name dating, text decoding, and the versioned column adapter map.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use lotwatch_core::{Diagnostic, DiagnosticKind, RawSnapshotRow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "lotwatch-adapters";

static DATE_IN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2}-\d{2}-\d{4})").expect("date pattern is valid"));

/// Text encoding of snapshot files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TextEncoding {
    /// UTF-16 honouring a byte-order mark, little endian when there is none.
    #[default]
    Utf16,
    Utf8,
}

impl TextEncoding {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-16" | "utf16" | "utf-16le" => Some(TextEncoding::Utf16),
            "utf-8" | "utf8" => Some(TextEncoding::Utf8),
            _ => None,
        }
    }
}

/// How snapshot files are named and laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFormat {
    pub prefix: String,
    pub extension: String,
    pub delimiter: u8,
    pub encoding: TextEncoding,
}

impl Default for SnapshotFormat {
    fn default() -> Self {
        Self {
            prefix: "biler_alle_".to_string(),
            extension: "csv".to_string(),
            delimiter: b';',
            encoding: TextEncoding::Utf16,
        }
    }
}

/// Outcome of matching a file name against the snapshot naming pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotName {
    /// Not a snapshot file; excluded without a diagnostic.
    Skip,
    /// Looks like a snapshot but the embedded `DD-MM-YYYY` token is not a date.
    InvalidDate(String),
    Dated(NaiveDate),
}

pub fn classify_file_name(file_name: &str, format: &SnapshotFormat) -> SnapshotName {
    let ext = format.extension.trim_start_matches('.');
    let has_ext = Path::new(file_name)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext));
    if !file_name.starts_with(&format.prefix) || !has_ext {
        return SnapshotName::Skip;
    }
    let Some(token) = DATE_IN_NAME.captures(file_name).and_then(|c| c.get(1)) else {
        return SnapshotName::Skip;
    };
    match NaiveDate::parse_from_str(token.as_str(), "%d-%m-%Y") {
        Ok(date) => SnapshotName::Dated(date),
        Err(_) => SnapshotName::InvalidDate(token.as_str().to_string()),
    }
}

/// A candidate snapshot whose observation date has been read from its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotFile {
    pub observed_on: NaiveDate,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot name {name} carries invalid date token {token}")]
    InvalidDate { name: String, token: String },
    #[error("reading snapshot {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding snapshot {path}: {reason}")]
    Undecodable { path: PathBuf, reason: String },
    #[error("snapshot {path} has no header row")]
    MissingHeader { path: PathBuf },
    #[error("reading delimited records from {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl SnapshotError {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            SnapshotError::InvalidDate { .. } => DiagnosticKind::InvalidFileDate,
            SnapshotError::Unreadable { .. } => DiagnosticKind::Unreadable,
            SnapshotError::Undecodable { .. } => DiagnosticKind::Undecodable,
            SnapshotError::MissingHeader { .. } | SnapshotError::Malformed { .. } => {
                DiagnosticKind::Malformed
            }
        }
    }

    pub fn to_diagnostic(&self, path: &Path) -> Diagnostic {
        Diagnostic::new(path, self.kind(), self.to_string())
    }
}

/// Semantic columns every era of the snapshot schema maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalColumn {
    Id,
    Brand,
    Model,
    Heading,
    Year,
    Mileage,
    Fuel,
    Drivetrain,
    Range,
    Seller,
    Price,
}

/// Estimated schema era of a snapshot, detected from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "v0-bare")]
    V0Bare,
    #[serde(rename = "v1-info-model")]
    V1InfoModel,
    #[serde(rename = "v2-headed")]
    V2Headed,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V0Bare => "v0-bare",
            SchemaVersion::V1InfoModel => "v1-info-model",
            SchemaVersion::V2Headed => "v2-headed",
        }
    }
}

/// Maps one schema era's header names onto [`CanonicalColumn`]s.
pub trait SchemaAdapter: Send + Sync {
    fn version(&self) -> SchemaVersion;
    /// Whether a normalized header (trimmed, lowercase) belongs to this era.
    fn matches(&self, header: &[String]) -> bool;
    fn canonical_column(&self, normalized_name: &str) -> Option<CanonicalColumn>;
}

const COMMON_COLUMNS: &[(&str, CanonicalColumn)] = &[
    ("finnkode", CanonicalColumn::Id),
    ("bilmerke", CanonicalColumn::Brand),
    ("årstall", CanonicalColumn::Year),
    ("kjørelengde", CanonicalColumn::Mileage),
    ("drivstoff", CanonicalColumn::Fuel),
    ("hjuldrift", CanonicalColumn::Drivetrain),
    ("selger", CanonicalColumn::Seller),
    ("pris", CanonicalColumn::Price),
];

#[derive(Debug)]
struct ColumnRenameAdapter {
    version: SchemaVersion,
    /// Header name whose presence identifies the era; `None` matches any header.
    signature: Option<&'static str>,
    renames: &'static [(&'static str, CanonicalColumn)],
}

impl SchemaAdapter for ColumnRenameAdapter {
    fn version(&self) -> SchemaVersion {
        self.version
    }

    fn matches(&self, header: &[String]) -> bool {
        match self.signature {
            Some(signature) => header.iter().any(|name| name == signature),
            None => true,
        }
    }

    fn canonical_column(&self, normalized_name: &str) -> Option<CanonicalColumn> {
        self.renames
            .iter()
            .chain(COMMON_COLUMNS)
            .find(|(name, _)| *name == normalized_name)
            .map(|(_, column)| *column)
    }
}

// Checked in order; the last entry is the catch-all.
static SCHEMA_ADAPTERS: [ColumnRenameAdapter; 3] = [
    ColumnRenameAdapter {
        version: SchemaVersion::V1InfoModel,
        signature: Some("info"),
        renames: &[
            ("modell", CanonicalColumn::Heading),
            ("info", CanonicalColumn::Model),
            ("rekkevidde", CanonicalColumn::Range),
        ],
    },
    ColumnRenameAdapter {
        version: SchemaVersion::V2Headed,
        signature: Some("overskrift"),
        renames: &[
            ("overskrift", CanonicalColumn::Heading),
            ("modell", CanonicalColumn::Model),
            ("rekkevidde", CanonicalColumn::Range),
            ("rekkevidde_str", CanonicalColumn::Range),
        ],
    },
    ColumnRenameAdapter {
        version: SchemaVersion::V0Bare,
        signature: None,
        renames: &[
            ("modell", CanonicalColumn::Heading),
            ("rekkevidde", CanonicalColumn::Range),
            ("rekkevidde_str", CanonicalColumn::Range),
        ],
    },
];

pub fn normalize_header_name(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}

pub fn adapter_for_header(header: &[String]) -> &'static dyn SchemaAdapter {
    SCHEMA_ADAPTERS
        .iter()
        .find(|adapter| adapter.matches(header))
        .unwrap_or(&SCHEMA_ADAPTERS[SCHEMA_ADAPTERS.len() - 1])
}

pub fn adapter_for_version(version: SchemaVersion) -> &'static dyn SchemaAdapter {
    SCHEMA_ADAPTERS
        .iter()
        .find(|adapter| adapter.version == version)
        .unwrap_or(&SCHEMA_ADAPTERS[SCHEMA_ADAPTERS.len() - 1])
}

/// Column positions resolved for one snapshot; the first header mapping to a column wins.
#[derive(Debug, Clone, Default)]
struct ColumnIndex {
    positions: HashMap<CanonicalColumn, usize>,
}

impl ColumnIndex {
    fn resolve(adapter: &dyn SchemaAdapter, header: &[String]) -> Self {
        let mut positions = HashMap::new();
        for (idx, name) in header.iter().enumerate() {
            if let Some(column) = adapter.canonical_column(name) {
                positions.entry(column).or_insert(idx);
            }
        }
        Self { positions }
    }

    fn cell(&self, record: &csv::StringRecord, column: CanonicalColumn) -> Option<String> {
        let idx = *self.positions.get(&column)?;
        record.get(idx).and_then(text_or_none)
    }

    fn has(&self, column: CanonicalColumn) -> bool {
        self.positions.contains_key(&column)
    }
}

/// All rows read from one snapshot, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSnapshot {
    pub path: PathBuf,
    pub observed_on: NaiveDate,
    pub schema: SchemaVersion,
    pub rows: Vec<RawSnapshotRow>,
}

/// Exported spreadsheets write missing cells as one of these. Matched exactly; `"Null value"`
/// or `"NONE"` are real text.
const NULL_TOKENS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN", "<NA>", "N/A",
    "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Trimmed text, or `None` for blank cells and the null spellings above.
pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || NULL_TOKENS.contains(&trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Manufacturer is the first whitespace-delimited token of the brand string.
pub fn manufacturer_from_brand(brand: &str) -> Option<String> {
    brand.split_whitespace().next().map(ToString::to_string)
}

/// Some snapshots put a range/mileage string in the fuel column; those values are dropped.
pub fn fuel_or_none(fuel: String) -> Option<String> {
    let lower = fuel.to_lowercase();
    if lower.contains("km") || lower.contains("rekkevidde") {
        None
    } else {
        Some(fuel)
    }
}

pub fn decode_text(bytes: &[u8], encoding: TextEncoding) -> Result<String, String> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(rest.to_vec()).map_err(|e| e.to_string());
    }
    match encoding {
        TextEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string()),
        TextEncoding::Utf16 => {
            let (body, big_endian) = match bytes {
                [0xFE, 0xFF, rest @ ..] => (rest, true),
                [0xFF, 0xFE, rest @ ..] => (rest, false),
                _ => (bytes, false),
            };
            if body.len() % 2 != 0 {
                return Err(format!("odd byte length {} for UTF-16 text", body.len()));
            }
            let units = body.chunks_exact(2).map(|pair| {
                if big_endian {
                    u16::from_be_bytes([pair[0], pair[1]])
                } else {
                    u16::from_le_bytes([pair[0], pair[1]])
                }
            });
            char::decode_utf16(units)
                .collect::<Result<String, _>>()
                .map_err(|e| e.to_string())
        }
    }
}

/// Parse already-decoded snapshot text.
pub fn parse_snapshot_text(
    path: &Path,
    observed_on: NaiveDate,
    text: &str,
    delimiter: u8,
) -> Result<ParsedSnapshot, SnapshotError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let header = reader
        .headers()
        .map_err(|source| SnapshotError::Malformed {
            path: path.to_path_buf(),
            source,
        })?
        .iter()
        .map(normalize_header_name)
        .collect::<Vec<_>>();
    if header.iter().all(String::is_empty) {
        return Err(SnapshotError::MissingHeader {
            path: path.to_path_buf(),
        });
    }

    let adapter = adapter_for_header(&header);
    let columns = ColumnIndex::resolve(adapter, &header);
    if !columns.has(CanonicalColumn::Id) {
        debug!(path = %path.display(), "snapshot has no identifier column; every row will be dropped");
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| SnapshotError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        let brand = columns.cell(&record, CanonicalColumn::Brand);
        rows.push(RawSnapshotRow {
            raw_id: columns.cell(&record, CanonicalColumn::Id),
            manufacturer: brand.as_deref().and_then(manufacturer_from_brand),
            model: columns.cell(&record, CanonicalColumn::Model),
            heading: columns.cell(&record, CanonicalColumn::Heading),
            year: columns.cell(&record, CanonicalColumn::Year),
            mileage: columns.cell(&record, CanonicalColumn::Mileage),
            fuel: columns.cell(&record, CanonicalColumn::Fuel).and_then(fuel_or_none),
            drivetrain: columns.cell(&record, CanonicalColumn::Drivetrain),
            range: columns.cell(&record, CanonicalColumn::Range),
            seller: columns.cell(&record, CanonicalColumn::Seller),
            price: columns.cell(&record, CanonicalColumn::Price),
        });
    }

    debug!(
        path = %path.display(),
        schema = adapter.version().as_str(),
        rows = rows.len(),
        "parsed snapshot"
    );
    Ok(ParsedSnapshot {
        path: path.to_path_buf(),
        observed_on,
        schema: adapter.version(),
        rows,
    })
}

/// Read, decode and parse one snapshot file.
pub fn parse_snapshot(file: &SnapshotFile, format: &SnapshotFormat) -> Result<ParsedSnapshot, SnapshotError> {
    let bytes = fs::read(&file.path).map_err(|source| SnapshotError::Unreadable {
        path: file.path.clone(),
        source,
    })?;
    let text = decode_text(&bytes, format.encoding).map_err(|reason| SnapshotError::Undecodable {
        path: file.path.clone(),
        reason,
    })?;
    parse_snapshot_text(&file.path, file.observed_on, &text, format.delimiter)
}
