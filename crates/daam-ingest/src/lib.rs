//! Ingestion and consolidation pipeline for the price catalog.
//!
//! One run: normalize the scraped batch, merge it into the current year's
//! partition under the append-time dedup policy, persist atomically, then
//! rebuild the latest-state meta index from the full store.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use daam_core::{
    clamp_price, fold_unit_into_name, image_filename, MetaEntry, PriceRecord, RawObservation,
    RejectionReason, UNIT_UNKNOWN,
};
use daam_store::{PartitionStore, StoreError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "daam-ingest";

/// Per-run configuration, created once by the entry point and passed down.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub images_dir: PathBuf,
    pub categories_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("DAAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./public/data")),
            images_dir: std::env::var("DAAM_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./public/images")),
            categories_file: std::env::var("DAAM_CATEGORIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./categories.json")),
            user_agent: std::env::var("DAAM_USER_AGENT")
                .unwrap_or_else(|_| "daam-track/0.1".to_string()),
            http_timeout_secs: std::env::var("DAAM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// Canonicalize one untrusted observation into a storable record.
///
/// Rejections are per-row and never fatal to a run; callers aggregate them
/// into the run report.
pub fn normalize(
    raw: &RawObservation,
    observed_date: NaiveDate,
) -> Result<PriceRecord, RejectionReason> {
    let name = raw.name.trim();
    if name.is_empty() {
        return Err(RejectionReason::MissingName);
    }
    let price = clamp_price(parse_price_text(&raw.price_text)?);
    let unit = raw
        .unit
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or(UNIT_UNKNOWN)
        .to_string();

    Ok(PriceRecord {
        date: observed_date,
        name: name.to_string(),
        price,
        unit,
        category: raw.category.trim().to_string(),
        image: image_filename(name),
    })
}

/// Strip the currency glyph, thousands separators, and whitespace, then parse.
pub fn parse_price_text(price_text: &str) -> Result<f64, RejectionReason> {
    let cleaned: String = price_text
        .chars()
        .filter(|c| *c != '৳' && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Err(RejectionReason::InvalidPrice);
    }
    let value: f64 = cleaned.parse().map_err(|_| RejectionReason::InvalidPrice)?;
    if !value.is_finite() {
        return Err(RejectionReason::InvalidPrice);
    }
    Ok(value)
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: Vec<PriceRecord>,
    pub duplicates_dropped: usize,
}

/// Append-time merge: concatenate old before new and keep the first record
/// seen per `(date, name)`. Pre-existing history wins over a same-day
/// re-scrape, so retrying a partially failed run never overwrites a capture.
pub fn append_merge(existing: Vec<PriceRecord>, incoming: Vec<PriceRecord>) -> MergeOutcome {
    let mut seen: HashSet<(NaiveDate, String)> =
        HashSet::with_capacity(existing.len() + incoming.len());
    let mut records = Vec::with_capacity(existing.len() + incoming.len());
    let mut duplicates_dropped = 0usize;

    for record in existing.into_iter().chain(incoming) {
        if seen.insert((record.date, record.name.clone())) {
            records.push(record);
        } else {
            duplicates_dropped += 1;
        }
    }

    MergeOutcome {
        records,
        duplicates_dropped,
    }
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub records: Vec<PriceRecord>,
    pub collapsed: usize,
}

/// Repair-time re-identification: fold each record's unit into its name,
/// then re-apply uniqueness over `(date, name, unit)`, first wins.
///
/// The fold widens the identity space, so this usually *separates* products
/// that previously collided rather than removing rows. Idempotent: a second
/// pass changes nothing.
pub fn repair_reidentify(records: Vec<PriceRecord>) -> RepairOutcome {
    let mut seen: HashSet<(NaiveDate, String, String)> = HashSet::with_capacity(records.len());
    let mut out = Vec::with_capacity(records.len());
    let mut collapsed = 0usize;

    for mut record in records {
        record.name = fold_unit_into_name(&record.name, &record.unit);
        if seen.insert((record.date, record.name.clone(), record.unit.clone())) {
            out.push(record);
        } else {
            collapsed += 1;
        }
    }

    RepairOutcome {
        records: out,
        collapsed,
    }
}

/// Derive the latest-state index: one entry per distinct name, carrying the
/// chronologically last observed record, emitted in name order.
///
/// Last-wins is the opposite tie-break from the merge: history keeps the
/// first arrival per day, the live index keeps the most recent state.
pub fn build_meta_index(records: &[PriceRecord]) -> Vec<MetaEntry> {
    let mut ordered: Vec<&PriceRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.date);

    let mut latest: BTreeMap<&str, &PriceRecord> = BTreeMap::new();
    for record in ordered {
        latest.insert(record.name.as_str(), record);
    }
    latest.into_values().map(MetaEntry::from).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub year: i32,
    pub observed: usize,
    pub ingested: usize,
    pub rejected: BTreeMap<RejectionReason, usize>,
    pub duplicates_dropped: usize,
    pub partition_rows: usize,
    pub meta_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub year: i32,
    pub rows_before: usize,
    pub rows_after: usize,
    pub collapsed: usize,
    pub meta_entries: usize,
}

pub struct IngestionPipeline {
    store: PartitionStore,
}

impl IngestionPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            store: PartitionStore::new(&config.data_dir),
        }
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// One ingestion run for `observed_date`.
    ///
    /// Bad rows are dropped and counted. A run with zero surviving rows still
    /// completes: the partition is left untouched and the meta index is
    /// rebuilt for consistency. Only a persistence failure aborts the run,
    /// and it aborts before any reindexing.
    pub fn run(
        &self,
        observations: Vec<RawObservation>,
        observed_date: NaiveDate,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let year = observed_date.year();
        let observed = observations.len();

        let mut rejected: BTreeMap<RejectionReason, usize> = BTreeMap::new();
        let mut normalized = Vec::with_capacity(observed);
        for raw in &observations {
            match normalize(raw, observed_date) {
                Ok(record) => normalized.push(record),
                Err(reason) => *rejected.entry(reason).or_default() += 1,
            }
        }
        let ingested = normalized.len();

        let existing = match self.store.load(year) {
            Ok(records) => records,
            Err(StoreError::PartitionMissing { .. }) => {
                info!(year, "no partition yet, starting empty");
                Vec::new()
            }
            Err(err) => return Err(err).context("loading current-year partition"),
        };

        if normalized.is_empty() {
            warn!(%run_id, observed, "run produced zero normalized rows, partition left untouched");
            let meta_entries = self.reindex()?;
            return Ok(RunReport {
                run_id,
                date: observed_date,
                year,
                observed,
                ingested,
                rejected,
                duplicates_dropped: 0,
                partition_rows: existing.len(),
                meta_entries,
            });
        }

        let MergeOutcome {
            records,
            duplicates_dropped,
        } = append_merge(existing, normalized);

        let partition_rows = self
            .store
            .save(year, &records)
            .context("persisting merged partition")?;
        let meta_entries = self.reindex()?;

        info!(
            %run_id,
            year,
            observed,
            ingested,
            duplicates_dropped,
            partition_rows,
            meta_entries,
            "ingestion run complete"
        );

        Ok(RunReport {
            run_id,
            date: observed_date,
            year,
            observed,
            ingested,
            rejected,
            duplicates_dropped,
            partition_rows,
            meta_entries,
        })
    }

    /// Maintenance entry point: re-identify one year's partition and rebuild
    /// the index. A missing partition is an error here, unlike ingestion,
    /// because there is nothing to repair.
    pub fn repair(&self, year: i32) -> Result<RepairReport> {
        let records = self
            .store
            .load(year)
            .with_context(|| format!("loading partition for year {year}"))?;
        let rows_before = records.len();

        let RepairOutcome { records, collapsed } = repair_reidentify(records);
        let rows_after = self
            .store
            .save(year, &records)
            .context("persisting repaired partition")?;
        let meta_entries = self.reindex()?;

        info!(year, rows_before, rows_after, collapsed, "repair pass complete");

        Ok(RepairReport {
            year,
            rows_before,
            rows_after,
            collapsed,
            meta_entries,
        })
    }

    /// Recompute the meta index from every partition. Always a full
    /// recompute: the index is a pure function of the store.
    fn reindex(&self) -> Result<usize> {
        let records = self.store.load_all().context("loading full store for reindex")?;
        let meta = build_meta_index(&records);
        self.store
            .write_meta_index(&meta)
            .context("writing meta index")?;
        Ok(meta.len())
    }
}

/// Demo/test product table: (name, base price, category, unit).
pub const SYNTHETIC_PRODUCTS: [(&str, i64, &str, &str); 20] = [
    ("Green Apple", 220, "Fruits", "1 kg"),
    ("Malta (Imported)", 180, "Fruits", "1 kg"),
    ("Banana (Sagor)", 110, "Fruits", "1 dozen"),
    ("Pineapple", 60, "Fruits", "each"),
    ("Potato (Regular)", 45, "Vegetables", "1 kg"),
    ("Tomato", 80, "Vegetables", "1 kg"),
    ("Onion (Local)", 90, "Vegetables", "1 kg"),
    ("Egg (Chicken)", 150, "Eggs", "12 pcs"),
    ("Beef (Bone In)", 750, "Meat", "1 kg"),
    ("Chicken (Broiler)", 210, "Meat", "1 kg"),
    ("Hilsha Fish", 1200, "Fish", "1 kg"),
    ("Rui Fish", 450, "Fish", "1 kg"),
    ("Miniket Rice", 75, "Rice", "1 kg"),
    ("Soybean Oil", 190, "Oil", "1 liter"),
    ("Milk (Liquid)", 90, "Dairy", "1 liter"),
    ("Dishwashing Liquid", 120, "Cleaning", "500 ml"),
    ("Laundry Detergent", 150, "Cleaning", "1 kg"),
    ("Hand Wash", 80, "Personal Care", "250 ml"),
    ("Sugar", 130, "Grocery", "1 kg"),
    ("Salt", 40, "Grocery", "1 kg"),
];

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub days: u32,
    pub seed: Option<u64>,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedReport {
    pub rows: usize,
    pub years: Vec<i32>,
    pub meta_entries: usize,
}

/// Random-walk price history for the demo product table: one row per product
/// per day, daily drift of ±5 with an occasional ±20 jump, floor-clamped.
pub fn generate_history(config: &SyntheticConfig) -> Vec<PriceRecord> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let days = config.days.max(1);
    let dates: Vec<NaiveDate> = (0..days)
        .rev()
        .filter_map(|back| config.end_date.checked_sub_days(chrono::Days::new(back as u64)))
        .collect();

    let mut rows = Vec::with_capacity(dates.len() * SYNTHETIC_PRODUCTS.len());
    for (name, base_price, category, unit) in SYNTHETIC_PRODUCTS {
        let image = image_filename(name);
        let mut current = base_price;
        for date in &dates {
            let mut change = rng.gen_range(-5..=5);
            if rng.gen::<f64>() > 0.95 {
                change = rng.gen_range(-20..=20);
            }
            current = (current + change).max(daam_core::PRICE_FLOOR as i64);
            rows.push(PriceRecord {
                date: *date,
                name: name.to_string(),
                price: current as f64,
                unit: unit.to_string(),
                category: category.to_string(),
                image: image.clone(),
            });
        }
    }
    rows
}

impl IngestionPipeline {
    /// Bootstrap a demo catalog: generated records replace the partitions of
    /// every year the window covers, then the index is rebuilt. Meant for an
    /// empty catalog, not for production data.
    pub fn seed_synthetic(&self, config: &SyntheticConfig) -> Result<SeedReport> {
        let rows = generate_history(config);

        let mut by_year: BTreeMap<i32, Vec<PriceRecord>> = BTreeMap::new();
        for row in rows {
            by_year.entry(row.date.year()).or_default().push(row);
        }

        let mut total = 0usize;
        let mut years = Vec::with_capacity(by_year.len());
        for (year, records) in &by_year {
            total += self
                .store
                .save(*year, records)
                .with_context(|| format!("persisting synthetic partition for year {year}"))?;
            years.push(*year);
        }
        let meta_entries = self.reindex()?;

        info!(rows = total, ?years, "seeded synthetic history");

        Ok(SeedReport {
            rows: total,
            years,
            meta_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(text: &str) -> NaiveDate {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").expect("date")
    }

    fn raw(name: &str, price_text: &str, unit: Option<&str>) -> RawObservation {
        RawObservation {
            name: name.to_string(),
            price_text: price_text.to_string(),
            unit: unit.map(str::to_string),
            category: "Grocery".to_string(),
            image_url: None,
        }
    }

    fn record(day: &str, name: &str, unit: &str, price: f64) -> PriceRecord {
        PriceRecord {
            date: date(day),
            name: name.to_string(),
            price,
            unit: unit.to_string(),
            category: "Grocery".to_string(),
            image: image_filename(name),
        }
    }

    #[test]
    fn normalize_strips_glyphs_and_separators() {
        let row = normalize(&raw("Miniket Rice", " ৳ 1,075 ", Some("1 kg")), date("2024-01-01"))
            .expect("normalized");
        assert_eq!(row.price, 1075.0);
        assert_eq!(row.unit, "1 kg");
        assert_eq!(row.image, image_filename("Miniket Rice"));
    }

    #[test]
    fn normalize_defaults_missing_unit() {
        let row = normalize(&raw("Pineapple", "60", None), date("2024-01-01")).expect("normalized");
        assert_eq!(row.unit, UNIT_UNKNOWN);
        let row = normalize(&raw("Pineapple", "60", Some("  ")), date("2024-01-01")).expect("normalized");
        assert_eq!(row.unit, UNIT_UNKNOWN);
    }

    #[test]
    fn normalize_rejects_bad_rows_and_clamps_low_prices() {
        assert_eq!(
            normalize(&raw("  ", "60", None), date("2024-01-01")),
            Err(RejectionReason::MissingName)
        );
        assert_eq!(
            normalize(&raw("Salt", "৳ --", None), date("2024-01-01")),
            Err(RejectionReason::InvalidPrice)
        );
        assert_eq!(
            normalize(&raw("Salt", "", None), date("2024-01-01")),
            Err(RejectionReason::InvalidPrice)
        );
        let clamped = normalize(&raw("Salt", "-3", None), date("2024-01-01")).expect("clamped");
        assert_eq!(clamped.price, daam_core::PRICE_FLOOR);
    }

    #[test]
    fn append_merge_keeps_first_seen_per_day() {
        let existing = vec![record("2024-01-01", "Rice", "1 kg", 75.0)];
        let incoming = vec![
            record("2024-01-01", "Rice", "1 kg", 70.0),
            record("2024-01-02", "Rice", "1 kg", 78.0),
        ];
        let outcome = append_merge(existing, incoming);
        assert_eq!(outcome.duplicates_dropped, 1);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].price, 75.0);
    }

    #[test]
    fn append_merge_is_idempotent_for_reingested_batches() {
        let batch = vec![
            record("2024-01-01", "Rice", "1 kg", 75.0),
            record("2024-01-01", "Salt", "1 kg", 40.0),
        ];
        let once = append_merge(Vec::new(), batch.clone());
        let twice = append_merge(once.records.clone(), batch);
        assert_eq!(once.records, twice.records);
        assert_eq!(twice.duplicates_dropped, 2);
    }

    #[test]
    fn repair_separates_units_that_previously_collided() {
        // Under (date, name) these two would have collapsed to one row.
        let rows = vec![
            record("2024-01-01", "Oil", "1 L", 190.0),
            record("2024-01-01", "Oil", "5 L", 900.0),
        ];
        let outcome = repair_reidentify(rows);
        assert_eq!(outcome.collapsed, 0);
        let names: Vec<&str> = outcome.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Oil 1 L", "Oil 5 L"]);
    }

    #[test]
    fn repair_is_idempotent() {
        let rows = vec![
            record("2024-01-01", "Oil", "1 L", 190.0),
            record("2024-01-01", "Oil", "5 L", 900.0),
            record("2024-01-01", "Oil 5 L", "5 L", 905.0),
        ];
        let once = repair_reidentify(rows);
        let twice = repair_reidentify(once.records.clone());
        assert_eq!(once.records, twice.records);
        assert_eq!(twice.collapsed, 0);
        // The pre-folded duplicate lost to the first-seen folded record.
        assert_eq!(once.collapsed, 1);
    }

    #[test]
    fn meta_index_keeps_latest_record_per_name() {
        let rows = vec![
            record("2024-01-02", "Rice", "1 kg", 78.0),
            record("2024-01-01", "Rice", "1 kg", 75.0),
            record("2024-01-01", "Salt", "1 kg", 40.0),
        ];
        let meta = build_meta_index(&rows);
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[0].name, "Rice");
        assert_eq!(meta[0].price, 78.0);
        assert_eq!(meta[1].name, "Salt");
    }

    #[test]
    fn synthetic_history_is_reproducible_and_floored() {
        let config = SyntheticConfig {
            days: 30,
            seed: Some(7),
            end_date: date("2024-03-01"),
        };
        let a = generate_history(&config);
        let b = generate_history(&config);
        assert_eq!(a, b);
        assert_eq!(a.len(), 30 * SYNTHETIC_PRODUCTS.len());
        assert!(a.iter().all(|r| r.price >= daam_core::PRICE_FLOOR));
        assert!(a.iter().all(|r| !r.image.is_empty()));
    }
}
