//! Query-side views over the consolidated event table: filters, lifecycle and daily reductions, display tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use lotwatch_core::{CatalogMetadata, DailyStat, EventRow, LifecycleRecord, ListingId};
use lotwatch_storage::read_events_parquet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "lotwatch-query";

/// Addressable columns of the event and lifecycle tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Manufacturer,
    Model,
    Heading,
    Fuel,
    Drivetrain,
    Seller,
    Year,
    Mileage,
    Range,
    /// Asking price on events; the last observed price on lifecycle records.
    Price,
    PriceDelta,
    DwellDays,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Manufacturer => "manufacturer",
            Field::Model => "model",
            Field::Heading => "heading",
            Field::Fuel => "fuel",
            Field::Drivetrain => "drivetrain",
            Field::Seller => "seller",
            Field::Year => "year",
            Field::Mileage => "mileage",
            Field::Range => "range",
            Field::Price => "price",
            Field::PriceDelta => "price_delta",
            Field::DwellDays => "dwell_days",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::Year | Field::Mileage | Field::Range | Field::Price | Field::PriceDelta | Field::DwellDays
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Number(i64),
    Null,
}

impl<'a> From<&'a Option<String>> for FieldValue<'a> {
    fn from(value: &'a Option<String>) -> Self {
        value.as_deref().map_or(FieldValue::Null, FieldValue::Text)
    }
}

/// A table row the filter engine can evaluate predicates against.
pub trait Filterable {
    const TABLE: &'static str;
    const FIELDS: &'static [Field];

    /// Only called with members of [`Filterable::FIELDS`].
    fn value(&self, field: Field) -> FieldValue<'_>;
}

impl Filterable for EventRow {
    const TABLE: &'static str = "events";
    const FIELDS: &'static [Field] = &[
        Field::Manufacturer,
        Field::Model,
        Field::Heading,
        Field::Fuel,
        Field::Drivetrain,
        Field::Seller,
        Field::Year,
        Field::Mileage,
        Field::Range,
        Field::Price,
    ];

    fn value(&self, field: Field) -> FieldValue<'_> {
        match field {
            Field::Manufacturer => (&self.manufacturer).into(),
            Field::Model => (&self.model).into(),
            Field::Heading => (&self.heading).into(),
            Field::Fuel => (&self.fuel).into(),
            Field::Drivetrain => (&self.drivetrain).into(),
            Field::Seller => (&self.seller).into(),
            Field::Year => FieldValue::Number(self.year),
            Field::Mileage => FieldValue::Number(self.mileage),
            Field::Range => FieldValue::Number(self.range_km),
            Field::Price => FieldValue::Number(self.price_numeric),
            Field::PriceDelta | Field::DwellDays => FieldValue::Null,
        }
    }
}

impl Filterable for LifecycleRecord {
    const TABLE: &'static str = "lifecycles";
    const FIELDS: &'static [Field] = &[
        Field::Manufacturer,
        Field::Model,
        Field::Heading,
        Field::Fuel,
        Field::Drivetrain,
        Field::Seller,
        Field::Year,
        Field::Mileage,
        Field::Range,
        Field::Price,
        Field::PriceDelta,
        Field::DwellDays,
    ];

    fn value(&self, field: Field) -> FieldValue<'_> {
        match field {
            Field::Manufacturer => (&self.manufacturer).into(),
            Field::Model => (&self.model).into(),
            Field::Heading => (&self.heading).into(),
            Field::Fuel => (&self.fuel).into(),
            Field::Drivetrain => (&self.drivetrain).into(),
            Field::Seller => (&self.seller).into(),
            Field::Year => FieldValue::Number(self.year),
            Field::Mileage => FieldValue::Number(self.mileage),
            Field::Range => FieldValue::Number(self.range_km),
            Field::Price => FieldValue::Number(self.price_last),
            Field::PriceDelta => FieldValue::Number(self.price_delta),
            Field::DwellDays => FieldValue::Number(self.dwell_days),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("a manufacturer is required")]
    MissingManufacturer,
    #[error("field {field} is not available on {table}")]
    UnsupportedField { field: Field, table: &'static str },
    #[error("{op} cannot be applied to {kind} field {field}")]
    PredicateMismatch {
        op: &'static str,
        field: Field,
        kind: &'static str,
    },
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
}

/// One filter condition. A predicate that imposes nothing (empty set, open range, blank needle)
/// passes every row; otherwise a null value never satisfies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    OneOf {
        field: Field,
        values: BTreeSet<String>,
    },
    Range {
        field: Field,
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Contains { field: Field, needle: String },
}

impl Predicate {
    pub fn one_of<I, S>(field: Field, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::OneOf {
            field,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn range(field: Field, min: Option<i64>, max: Option<i64>) -> Self {
        Predicate::Range { field, min, max }
    }

    pub fn contains(field: Field, needle: impl Into<String>) -> Self {
        Predicate::Contains {
            field,
            needle: needle.into(),
        }
    }

    pub fn field(&self) -> Field {
        match self {
            Predicate::OneOf { field, .. } | Predicate::Range { field, .. } | Predicate::Contains { field, .. } => {
                *field
            }
        }
    }

    fn op(&self) -> &'static str {
        match self {
            Predicate::OneOf { .. } => "one_of",
            Predicate::Range { .. } => "range",
            Predicate::Contains { .. } => "contains",
        }
    }

    pub fn is_constraining(&self) -> bool {
        match self {
            Predicate::OneOf { values, .. } => !values.is_empty(),
            Predicate::Range { min, max, .. } => min.is_some() || max.is_some(),
            Predicate::Contains { needle, .. } => !needle.trim().is_empty(),
        }
    }

    fn check<T: Filterable>(&self) -> Result<(), QueryError> {
        let field = self.field();
        if !T::FIELDS.contains(&field) {
            return Err(QueryError::UnsupportedField { field, table: T::TABLE });
        }
        let mismatch = match self {
            Predicate::OneOf { .. } => false,
            Predicate::Range { .. } => !field.is_numeric(),
            Predicate::Contains { .. } => field.is_numeric(),
        };
        if mismatch {
            return Err(QueryError::PredicateMismatch {
                op: self.op(),
                field,
                kind: if field.is_numeric() { "numeric" } else { "text" },
            });
        }
        Ok(())
    }

    pub fn matches(&self, value: FieldValue<'_>) -> bool {
        if !self.is_constraining() {
            return true;
        }
        match (self, value) {
            (_, FieldValue::Null) => false,
            (Predicate::OneOf { values, .. }, FieldValue::Text(text)) => values.contains(text),
            (Predicate::OneOf { values, .. }, FieldValue::Number(n)) => values.contains(&n.to_string()),
            (Predicate::Range { min, max, .. }, FieldValue::Number(n)) => {
                min.map_or(true, |lo| n >= lo) && max.map_or(true, |hi| n <= hi)
            }
            (Predicate::Contains { needle, .. }, FieldValue::Text(text)) => {
                text.to_lowercase().contains(&needle.trim().to_lowercase())
            }
            _ => false,
        }
    }
}

/// Keep the rows that satisfy every predicate, preserving their order.
pub fn apply_filters<T: Filterable>(mut rows: Vec<T>, predicates: &[Predicate]) -> Result<Vec<T>, QueryError> {
    for predicate in predicates {
        predicate.check::<T>()?;
    }
    let active = predicates
        .iter()
        .filter(|p| p.is_constraining())
        .collect::<Vec<_>>();
    if active.is_empty() {
        return Ok(rows);
    }
    rows.retain(|row| active.iter().all(|p| p.matches(row.value(p.field()))));
    Ok(rows)
}

fn latest_text<'a>(group: &[&'a EventRow], pick: impl Fn(&'a EventRow) -> &'a Option<String>) -> Option<String> {
    group.iter().rev().find_map(|e| pick(*e).clone())
}

/// One lifecycle record per listing, ordered by listing id.
///
/// Start values come from the earliest observation and end values from the latest; text
/// attributes take the latest observation that has a value.
pub fn reduce_lifecycles(events: &[EventRow]) -> Vec<LifecycleRecord> {
    let mut ordered = events.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|e| e.observation_date);

    let mut groups: BTreeMap<&ListingId, Vec<&EventRow>> = BTreeMap::new();
    for event in ordered {
        groups.entry(&event.listing_id).or_default().push(event);
    }

    groups
        .into_iter()
        .filter_map(|(listing_id, group)| {
            let first = *group.first()?;
            let last = *group.last()?;
            Some(LifecycleRecord {
                listing_id: listing_id.clone(),
                first_seen: first.observation_date,
                last_seen: last.observation_date,
                dwell_days: (last.observation_date - first.observation_date).num_days(),
                price_start: first.price_numeric,
                price_last: last.price_numeric,
                price_delta: last.price_numeric - first.price_numeric,
                manufacturer: latest_text(&group, |e| &e.manufacturer),
                model: latest_text(&group, |e| &e.model),
                heading: latest_text(&group, |e| &e.heading),
                year: last.year,
                mileage: last.mileage,
                fuel: latest_text(&group, |e| &e.fuel),
                drivetrain: latest_text(&group, |e| &e.drivetrain),
                range_km: last.range_km,
                seller: latest_text(&group, |e| &e.seller),
            })
        })
        .collect()
}

/// Median of unsorted values; the mean of the two middle values for an even count.
pub fn median(values: &mut [i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid] as f64)
    } else {
        Some((values[mid - 1] as f64 + values[mid] as f64) / 2.0)
    }
}

/// One row per observation date, ascending.
pub fn aggregate_daily(events: &[EventRow]) -> Vec<DailyStat> {
    let mut by_date: BTreeMap<NaiveDate, (usize, usize, Vec<i64>)> = BTreeMap::new();
    for event in events {
        let (total, sold, asking) = by_date.entry(event.observation_date).or_default();
        *total += 1;
        if event.is_sold() {
            *sold += 1;
        } else if event.price_numeric > 0 {
            asking.push(event.price_numeric);
        }
    }

    // Negative prices are neither sold nor part of the median.
    by_date
        .into_iter()
        .map(|(observation_date, (total_count, sold_count, mut asking))| DailyStat {
            observation_date,
            total_count,
            sold_count,
            median_unsold_price: median(&mut asking),
        })
        .collect()
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 7, 1).unwrap_or(NaiveDate::MIN)
}

/// Scope of one market query: a manufacturer, optionally one model, and inclusive date bounds,
/// followed by pre-filters evaluated on the matching events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub manufacturer: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub prefilters: Vec<Predicate>,
}

impl QueryRequest {
    pub const DEFAULT_TABLE: &'static str = "biler";

    pub fn new(manufacturer: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: None,
            start_date: default_start_date(),
            end_date: today,
            prefilters: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), QueryError> {
        if self.manufacturer.trim().is_empty() {
            return Err(QueryError::MissingManufacturer);
        }
        for predicate in &self.prefilters {
            predicate.check::<EventRow>()?;
        }
        Ok(())
    }

    /// The statement the remote engine runs for this request's scope. Pre-filters are not
    /// part of it; they run on the returned rows.
    pub fn to_sql(&self, table: &str) -> Result<String, QueryError> {
        self.validate()?;
        let table_ok = table
            .split('.')
            .all(|part| {
                let mut chars = part.chars();
                chars
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !table_ok {
            return Err(QueryError::InvalidTableName(table.to_string()));
        }

        let mut sql = format!(
            "SELECT * FROM {table} WHERE manufacturer = {} AND observation_date >= DATE {} AND observation_date <= DATE {}",
            sql_literal(&self.manufacturer),
            sql_literal(&self.start_date.format("%Y-%m-%d").to_string()),
            sql_literal(&self.end_date.format("%Y-%m-%d").to_string()),
        );
        if let Some(model) = &self.model {
            sql.push_str(&format!(" AND model = {}", sql_literal(model)));
        }
        Ok(sql)
    }

    fn in_scope(&self, event: &EventRow) -> bool {
        event.manufacturer.as_deref() == Some(self.manufacturer.as_str())
            && self
                .model
                .as_deref()
                .map_or(true, |model| event.model.as_deref() == Some(model))
            && event.observation_date >= self.start_date
            && event.observation_date <= self.end_date
    }

    /// The requested model when the catalog lists other models for this manufacturer but not it.
    /// A catalog with no models for the manufacturer says nothing either way.
    pub fn unknown_model<'a>(&'a self, catalog: &CatalogMetadata) -> Option<&'a str> {
        let model = self.model.as_deref()?;
        let known = catalog.models_for(&self.manufacturer);
        (!known.is_empty() && !known.iter().any(|m| m == model)).then_some(model)
    }

    /// Evaluate the request against a local event table: scope first, then pre-filters.
    pub fn select(&self, events: &[EventRow]) -> Result<Vec<EventRow>, QueryError> {
        self.validate()?;
        let scoped = events
            .iter()
            .filter(|e| self.in_scope(e))
            .cloned()
            .collect::<Vec<_>>();
        apply_filters(scoped, &self.prefilters)
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Lifecycle-table filters offered next to the displayed results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewFilters {
    pub heading_contains: String,
    pub seller_contains: String,
    pub fuel: BTreeSet<String>,
    pub drivetrain: BTreeSet<String>,
    pub year_min: Option<i64>,
    pub year_max: Option<i64>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub mileage_min: Option<i64>,
    pub mileage_max: Option<i64>,
    pub dwell_days_min: Option<i64>,
    pub dwell_days_max: Option<i64>,
}

impl ViewFilters {
    pub fn to_predicates(&self) -> Vec<Predicate> {
        vec![
            Predicate::contains(Field::Heading, self.heading_contains.clone()),
            Predicate::one_of(Field::Fuel, self.fuel.iter().cloned()),
            Predicate::one_of(Field::Drivetrain, self.drivetrain.iter().cloned()),
            Predicate::contains(Field::Seller, self.seller_contains.clone()),
            Predicate::range(Field::Year, self.year_min, self.year_max),
            Predicate::range(Field::Price, self.price_min, self.price_max),
            Predicate::range(Field::Mileage, self.mileage_min, self.mileage_max),
            Predicate::range(Field::DwellDays, self.dwell_days_min, self.dwell_days_max),
        ]
    }
}

/// One selectable value of a view filter and how many listings carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionCount {
    pub value: String,
    pub count: usize,
    pub selected: bool,
}

fn option_counts(
    lifecycles: &[LifecycleRecord],
    pick: impl Fn(&LifecycleRecord) -> &Option<String>,
    selected: &BTreeSet<String>,
) -> Vec<OptionCount> {
    let mut counts = BTreeMap::<&str, usize>::new();
    for record in lifecycles {
        if let Some(value) = pick(record) {
            *counts.entry(value.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(value, count)| OptionCount {
            selected: selected.contains(value),
            value: value.to_string(),
            count,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayTables {
    /// Lifecycle records that pass the view filters.
    pub lifecycles: Vec<LifecycleRecord>,
    /// Market statistics over every event the request selected.
    pub daily: Vec<DailyStat>,
    pub matching_count: usize,
    pub fuel_options: Vec<OptionCount>,
    pub drivetrain_options: Vec<OptionCount>,
}

pub fn build_display(
    request: &QueryRequest,
    events: &[EventRow],
    view: &ViewFilters,
) -> Result<DisplayTables, QueryError> {
    let selected = request.select(events)?;
    let daily = aggregate_daily(&selected);
    let lifecycles = reduce_lifecycles(&selected);
    let fuel_options = option_counts(&lifecycles, |r| &r.fuel, &view.fuel);
    let drivetrain_options = option_counts(&lifecycles, |r| &r.drivetrain, &view.drivetrain);
    let lifecycles = apply_filters(lifecycles, &view.to_predicates())?;

    debug!(
        manufacturer = %request.manufacturer,
        events = selected.len(),
        listings = lifecycles.len(),
        "built display tables"
    );
    Ok(DisplayTables {
        matching_count: lifecycles.len(),
        lifecycles,
        daily,
        fuel_options,
        drivetrain_options,
    })
}

/// Run a request against the consolidated artifact at `path`.
pub fn query_artifact(path: &Path, request: &QueryRequest, view: &ViewFilters) -> anyhow::Result<DisplayTables> {
    let events = read_events_parquet(path)?;
    build_display(request, &events, view).with_context(|| format!("querying {}", path.display()))
}
