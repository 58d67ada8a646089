//! Core domain model for lotwatch: snapshot rows, consolidated events and the derived views.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lotwatch-core";

/// Normalized listing identifier: ASCII digits only, no leading zeros, never empty.
///
/// Ordering is numeric, i.e. a shorter identifier sorts before a longer one and
/// identifiers of equal length compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    /// Keep the digits of `raw`, strip leading zeros, and reject an empty result.
    pub fn normalize(raw: &str) -> Option<Self> {
        let digits = raw.chars().filter(char::is_ascii_digit).collect::<String>();
        let trimmed = digits.trim_start_matches('0');
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ListingId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ListingId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why an event's `price_numeric` holds the value it does.
///
/// Aggregations treat `price_numeric == 0` as sold regardless of this flag; the
/// flag exists so consumers can tell a sold marker from a price nobody could read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    Asking,
    Sold,
    #[default]
    Unparsed,
    Missing,
}

impl PriceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceKind::Asking => "asking",
            PriceKind::Sold => "sold",
            PriceKind::Unparsed => "unparsed",
            PriceKind::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asking" => Some(PriceKind::Asking),
            "sold" => Some(PriceKind::Sold),
            "unparsed" => Some(PriceKind::Unparsed),
            "missing" => Some(PriceKind::Missing),
            _ => None,
        }
    }
}

/// One listing as captured in a single snapshot file, after column renaming.
///
/// `None` is the null marker for a column the snapshot's schema lacks or a blank cell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawSnapshotRow {
    pub raw_id: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub heading: Option<String>,
    pub year: Option<String>,
    pub mileage: Option<String>,
    pub fuel: Option<String>,
    pub drivetrain: Option<String>,
    pub range: Option<String>,
    pub seller: Option<String>,
    pub price: Option<String>,
}

/// Canonical, typed (listing, observation date) fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub listing_id: ListingId,
    pub observation_date: NaiveDate,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub heading: Option<String>,
    pub year: i64,
    pub mileage: i64,
    pub fuel: Option<String>,
    pub drivetrain: Option<String>,
    pub range_km: i64,
    pub seller: Option<String>,
    pub price_numeric: i64,
    pub price_kind: PriceKind,
}

impl EventRow {
    /// Sort key of the consolidated table.
    pub fn table_key(&self) -> (NaiveDate, &ListingId) {
        (self.observation_date, &self.listing_id)
    }

    pub fn is_sold(&self) -> bool {
        self.price_numeric == 0
    }
}

/// Reduction of one listing's events over its observed lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub listing_id: ListingId,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub dwell_days: i64,
    pub price_start: i64,
    pub price_last: i64,
    pub price_delta: i64,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub heading: Option<String>,
    pub year: i64,
    pub mileage: i64,
    pub fuel: Option<String>,
    pub drivetrain: Option<String>,
    pub range_km: i64,
    pub seller: Option<String>,
}

/// Cross-sectional market statistics for one observation date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub observation_date: NaiveDate,
    pub total_count: usize,
    pub sold_count: usize,
    pub median_unsold_price: Option<f64>,
}

pub const FALLBACK_YEAR_MIN: i64 = 2000;
pub const FALLBACK_MILEAGE_MIN: i64 = 0;
pub const FALLBACK_MILEAGE_MAX: i64 = 300_000;

fn fallback_year_min() -> i64 {
    FALLBACK_YEAR_MIN
}

fn fallback_year_max() -> i64 {
    i64::from(Local::now().year())
}

fn fallback_mileage_min() -> i64 {
    FALLBACK_MILEAGE_MIN
}

fn fallback_mileage_max() -> i64 {
    FALLBACK_MILEAGE_MAX
}

/// Filter domains and numeric ranges derived from a consolidated dataset.
///
/// `Default` is the summary of an empty dataset (no enumerations, zero bounds,
/// no latest date). Keys missing from a loaded document take the values of
/// [`CatalogMetadata::fallback`]; the legacy key names are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogMetadata {
    #[serde(default, alias = "produsenter")]
    pub manufacturers: Vec<String>,
    #[serde(default, alias = "models_by_prod")]
    pub models_by_manufacturer: BTreeMap<String, Vec<String>>,
    #[serde(default, alias = "drivstoff_opts")]
    pub fuel_options: Vec<String>,
    #[serde(default, alias = "hjuldrift_opts")]
    pub drivetrain_options: Vec<String>,
    #[serde(default = "fallback_year_min")]
    pub year_min: i64,
    #[serde(default = "fallback_year_max")]
    pub year_max: i64,
    #[serde(default = "fallback_mileage_min", alias = "km_min")]
    pub mileage_min: i64,
    #[serde(default = "fallback_mileage_max", alias = "km_max")]
    pub mileage_max: i64,
    #[serde(default, alias = "latest_dt")]
    pub latest_date: Option<NaiveDate>,
}

impl CatalogMetadata {
    /// Catalog used when no catalog artifact can be loaded.
    pub fn fallback(today: NaiveDate) -> Self {
        Self {
            manufacturers: Vec::new(),
            models_by_manufacturer: BTreeMap::new(),
            fuel_options: Vec::new(),
            drivetrain_options: Vec::new(),
            year_min: FALLBACK_YEAR_MIN,
            year_max: i64::from(today.year()),
            mileage_min: FALLBACK_MILEAGE_MIN,
            mileage_max: FALLBACK_MILEAGE_MAX,
            latest_date: Some(today),
        }
    }

    pub fn models_for(&self, manufacturer: &str) -> &[String] {
        self.models_by_manufacturer
            .get(manufacturer)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The file name carries a date-shaped token that is not a calendar date.
    InvalidFileDate,
    Unreadable,
    /// The bytes could not be decoded with the configured text encoding.
    Undecodable,
    /// The delimited structure could not be read (missing header, broken record).
    Malformed,
}

/// A recovered, file-level failure surfaced beside a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(path: impl Into<PathBuf>, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

/// A stage result together with the diagnostics accumulated while producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosed<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Diagnosed<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(value: T, diagnostics: Vec<Diagnostic>) -> Self {
        Self { value, diagnostics }
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Diagnosed<U> {
        Diagnosed {
            value: f(self.value),
            diagnostics: self.diagnostics,
        }
    }

    /// Run the next stage and append its diagnostics after ours.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Diagnosed<U>) -> Diagnosed<U> {
        let mut next = f(self.value);
        let mut diagnostics = self.diagnostics;
        diagnostics.append(&mut next.diagnostics);
        Diagnosed {
            value: next.value,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("00123-x", Some("123"))]
    #[case("123", Some("123"))]
    #[case(" 4 5 6 ", Some("456"))]
    #[case("FK-0009876", Some("9876"))]
    #[case("", None)]
    #[case("abc", None)]
    #[case("000", None)]
    fn listing_id_normalization(#[case] raw: &str, #[case] expected: Option<&str>) {
        let normalized = ListingId::normalize(raw);
        assert_eq!(normalized.as_ref().map(ListingId::as_str), expected);
    }

    #[test]
    fn listing_ids_order_numerically() {
        let mut ids = ["1000", "99", "123", "124"]
            .iter()
            .filter_map(|raw| ListingId::normalize(raw))
            .collect::<Vec<_>>();
        ids.sort();
        let ordered = ids.iter().map(ListingId::as_str).collect::<Vec<_>>();
        assert_eq!(ordered, vec!["99", "123", "124", "1000"]);
    }

    #[test]
    fn catalog_accepts_legacy_keys_and_fills_missing_with_fallback() {
        let doc = r#"{
            "produsenter": ["Tesla", "Volvo"],
            "models_by_prod": {"Tesla": ["Model 3", "Model Y"]},
            "drivstoff_opts": ["Elektrisk"],
            "km_min": 10,
            "latest_dt": "2025-07-20"
        }"#;
        let catalog: CatalogMetadata = serde_json::from_str(doc).unwrap();
        assert_eq!(catalog.manufacturers, vec!["Tesla", "Volvo"]);
        assert_eq!(catalog.models_for("Tesla"), ["Model 3", "Model Y"]);
        assert!(catalog.models_for("Volvo").is_empty());
        assert_eq!(catalog.fuel_options, vec!["Elektrisk"]);
        assert!(catalog.drivetrain_options.is_empty());
        assert_eq!(catalog.mileage_min, 10);
        assert_eq!(catalog.mileage_max, FALLBACK_MILEAGE_MAX);
        assert_eq!(catalog.year_min, FALLBACK_YEAR_MIN);
        assert_eq!(catalog.latest_date, NaiveDate::from_ymd_opt(2025, 7, 20));
    }

    #[test]
    fn empty_catalog_serializes_with_fixed_keys() {
        let value = serde_json::to_value(CatalogMetadata::default()).unwrap();
        let keys = value.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                "drivetrain_options",
                "fuel_options",
                "latest_date",
                "manufacturers",
                "mileage_max",
                "mileage_min",
                "models_by_manufacturer",
                "year_max",
                "year_min",
            ]
        );
        assert!(value["latest_date"].is_null());
    }

    #[test]
    fn diagnosed_chains_accumulate_in_order() {
        let first = Diagnosed::with_diagnostics(
            2,
            vec![Diagnostic::new("a.csv", DiagnosticKind::Unreadable, "gone")],
        );
        let chained = first.and_then(|n| {
            Diagnosed::with_diagnostics(
                n * 10,
                vec![Diagnostic::new("b.csv", DiagnosticKind::Malformed, "no header")],
            )
        });
        assert_eq!(chained.value, 20);
        let paths = chained
            .diagnostics
            .iter()
            .map(|d| d.path.display().to_string())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["a.csv", "b.csv"]);
        assert!(!chained.is_clean());
    }
}
