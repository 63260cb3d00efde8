//! Core domain model for the Daam Track price catalog.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "daam-core";

/// Sentinel stored when a listing shows no package size.
pub const UNIT_UNKNOWN: &str = "N/A";

/// Prices in this catalog trend but never reach zero; anything lower is clamped up.
pub const PRICE_FLOOR: f64 = 10.0;

/// One product tile as handed over by the extraction step. Untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub name: String,
    pub price_text: String,
    pub unit: Option<String>,
    pub category: String,
    pub image_url: Option<String>,
}

/// Canonical per-day price row as persisted in a year partition.
///
/// Field order matches the partition schema; `date` serializes as
/// `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub date: NaiveDate,
    pub name: String,
    pub price: f64,
    pub unit: String,
    pub category: String,
    pub image: String,
}

impl PriceRecord {
    /// Uniqueness key within a partition: one observed price per product per day.
    pub fn day_key(&self) -> (NaiveDate, &str) {
        (self.date, self.name.as_str())
    }
}

/// Latest-known state of one distinct product, derived from history.
///
/// Field order is the on-disk `meta.json` contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub name: String,
    pub category: String,
    pub unit: String,
    pub image: String,
    pub price: f64,
}

impl From<&PriceRecord> for MetaEntry {
    fn from(record: &PriceRecord) -> Self {
        Self {
            name: record.name.clone(),
            category: record.category.clone(),
            unit: record.unit.clone(),
            image: record.image.clone(),
            price: record.price,
        }
    }
}

/// Why a single observation was dropped during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Error, Serialize)]
pub enum RejectionReason {
    #[error("missing or blank product name")]
    MissingName,
    #[error("price text did not parse to a number")]
    InvalidPrice,
}

/// Clamp a parsed price onto the catalog floor.
pub fn clamp_price(price: f64) -> f64 {
    if price < PRICE_FLOOR {
        PRICE_FLOOR
    } else {
        price
    }
}

/// Fold the unit into the product name so same-named products sold in
/// different package sizes become distinct identities.
///
/// Idempotent: a name that already embeds the unit is returned unchanged, as
/// is any record with an unknown unit.
pub fn fold_unit_into_name(name: &str, unit: &str) -> String {
    if unit.is_empty() || unit == UNIT_UNKNOWN || name.contains(unit) {
        return name.to_string();
    }
    format!("{name} {unit}")
}

/// Deterministic image filename for a product name.
///
/// Truncated sha256 hex keeps the token fixed-length while remaining far
/// beyond collision range for a catalog of grocery products.
pub fn image_filename(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}.webp", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_appends_unit_once() {
        let folded = fold_unit_into_name("Soybean Oil", "1 liter");
        assert_eq!(folded, "Soybean Oil 1 liter");
        assert_eq!(fold_unit_into_name(&folded, "1 liter"), folded);
    }

    #[test]
    fn fold_skips_unknown_and_embedded_units() {
        assert_eq!(fold_unit_into_name("Pineapple", UNIT_UNKNOWN), "Pineapple");
        assert_eq!(fold_unit_into_name("Pineapple", ""), "Pineapple");
        assert_eq!(fold_unit_into_name("Sugar 1 kg", "1 kg"), "Sugar 1 kg");
    }

    #[test]
    fn image_filename_is_stable_and_distinct() {
        let a = image_filename("Miniket Rice");
        let b = image_filename("Miniket Rice");
        let c = image_filename("Rui Fish");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(".webp"));
        assert_eq!(a.len(), 32 + ".webp".len());
    }

    #[test]
    fn price_floor_clamps_non_positive_values() {
        assert_eq!(clamp_price(-4.0), PRICE_FLOOR);
        assert_eq!(clamp_price(0.0), PRICE_FLOOR);
        assert_eq!(clamp_price(9.99), PRICE_FLOOR);
        assert_eq!(clamp_price(75.0), 75.0);
    }
}
