use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use daam_core::{MetaEntry, PriceRecord, RawObservation};
use daam_ingest::{IngestionPipeline, PipelineConfig, SyntheticConfig};
use daam_store::PartitionStore;
use tempfile::tempdir;

fn date(text: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").expect("date")
}

fn config_for(root: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: root.join("data"),
        images_dir: root.join("images"),
        categories_file: root.join("categories.json"),
        user_agent: "daam-track-tests/0.1".to_string(),
        http_timeout_secs: 1,
    }
}

fn observation(name: &str, price_text: &str, unit: Option<&str>) -> RawObservation {
    RawObservation {
        name: name.to_string(),
        price_text: price_text.to_string(),
        unit: unit.map(str::to_string),
        category: "Rice".to_string(),
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
        image: daam_core::image_filename(name),
    }
}

fn read_meta(store: &PartitionStore) -> Vec<MetaEntry> {
    let text = std::fs::read_to_string(store.meta_path()).expect("read meta.json");
    serde_json::from_str(&text).expect("parse meta.json")
}

#[test]
fn first_ingest_then_same_day_retry_then_next_day() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    let report = pipeline
        .run(vec![observation("Rice", "75", Some("1 kg"))], date("2024-01-01"))
        .expect("first run");
    assert_eq!(report.ingested, 1);
    assert_eq!(report.partition_rows, 1);
    let meta = read_meta(pipeline.store());
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].name, "Rice");
    assert_eq!(meta[0].price, 75.0);

    // Same-day retry: first capture wins, no second row appears.
    let report = pipeline
        .run(vec![observation("Rice", "72", Some("1 kg"))], date("2024-01-01"))
        .expect("retry run");
    assert_eq!(report.duplicates_dropped, 1);
    assert_eq!(report.partition_rows, 1);
    assert_eq!(read_meta(pipeline.store())[0].price, 75.0);

    // Next day: history grows, index moves to the latest price.
    let report = pipeline
        .run(vec![observation("Rice", "78", Some("1 kg"))], date("2024-01-02"))
        .expect("next-day run");
    assert_eq!(report.partition_rows, 2);
    let meta = read_meta(pipeline.store());
    assert_eq!(meta[0].price, 78.0);

    let history = pipeline.store().load(2024).expect("partition");
    assert_eq!(history.len(), 2);
    let prices: Vec<f64> = history.iter().map(|r| r.price).collect();
    assert_eq!(prices, vec![75.0, 78.0]);
}

#[test]
fn partition_keys_stay_unique_and_sorted_across_runs() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    for (day, batch) in [
        ("2024-02-01", vec![("Tomato", "80"), ("Onion (Local)", "90"), ("Tomato", "85")]),
        ("2024-02-02", vec![("Onion (Local)", "92"), ("Tomato", "81")]),
        ("2024-02-02", vec![("Tomato", "99")]),
    ] {
        let observations = batch
            .into_iter()
            .map(|(name, price)| observation(name, price, Some("1 kg")))
            .collect();
        pipeline.run(observations, date(day)).expect("run");
    }

    let rows = pipeline.store().load(2024).expect("partition");
    let mut keys = HashSet::new();
    for row in &rows {
        assert!(keys.insert((row.date, row.name.clone())), "duplicate key {row:?}");
    }
    let sort_keys: Vec<(String, NaiveDate)> =
        rows.iter().map(|r| (r.name.clone(), r.date)).collect();
    let mut expected = sort_keys.clone();
    expected.sort();
    assert_eq!(sort_keys, expected);
    // Same-day second batch lost to the first capture of that day.
    assert_eq!(
        rows.iter()
            .find(|r| r.name == "Tomato" && r.date == date("2024-02-02"))
            .expect("tomato row")
            .price,
        81.0
    );
}

#[test]
fn meta_index_spans_every_year_in_the_store() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    let pipeline = IngestionPipeline::new(&config);

    // A prior year's partition, written through the same store contract.
    pipeline
        .store()
        .save(
            2023,
            &[
                record("2023-12-30", "Rice", "1 kg", 70.0),
                record("2023-12-31", "Hilsha Fish", "1 kg", 1150.0),
            ],
        )
        .expect("save 2023");

    pipeline
        .run(vec![observation("Rice", "75", Some("1 kg"))], date("2024-01-01"))
        .expect("2024 run");

    let meta = read_meta(pipeline.store());
    assert_eq!(meta.len(), 2);
    // Only seen in 2023, still indexed with its last known price.
    assert_eq!(meta[0].name, "Hilsha Fish");
    assert_eq!(meta[0].price, 1150.0);
    assert_eq!(meta[1].name, "Rice");
    assert_eq!(meta[1].price, 75.0);
}

#[test]
fn empty_scrape_leaves_partition_alone_but_rebuilds_index() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    pipeline
        .store()
        .save(2024, &[record("2024-01-01", "Rice", "1 kg", 75.0)])
        .expect("seed partition");
    // Stale index on disk, as if a previous run half-finished.
    pipeline.store().write_meta_index(&[]).expect("stale meta");

    let report = pipeline.run(Vec::new(), date("2024-01-05")).expect("empty run");
    assert_eq!(report.observed, 0);
    assert_eq!(report.ingested, 0);
    assert_eq!(report.partition_rows, 1);

    assert_eq!(pipeline.store().load(2024).expect("partition").len(), 1);
    assert_eq!(read_meta(pipeline.store()).len(), 1);
}

#[test]
fn all_rejected_rows_count_as_an_empty_run() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    let report = pipeline
        .run(
            vec![observation("", "75", None), observation("Salt", "n/a", None)],
            date("2024-01-01"),
        )
        .expect("rejecting run");
    assert_eq!(report.observed, 2);
    assert_eq!(report.ingested, 0);
    assert_eq!(report.rejected.values().sum::<usize>(), 2);
    assert!(pipeline.store().load(2024).is_err());
}

#[test]
fn price_floor_holds_through_the_pipeline() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    pipeline
        .run(
            vec![observation("Salt", "0", Some("1 kg")), observation("Sugar", "-12", Some("1 kg"))],
            date("2024-01-01"),
        )
        .expect("run");

    let rows = pipeline.store().load(2024).expect("partition");
    assert!(rows.iter().all(|r| r.price >= daam_core::PRICE_FLOOR));
}

#[test]
fn storage_failure_aborts_before_the_index_is_touched() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    std::fs::create_dir_all(&config.data_dir).expect("data dir");
    // A file where the prices tree should be makes every partition write fail.
    std::fs::write(config.data_dir.join("prices"), b"not a directory").expect("block prices dir");

    let pipeline = IngestionPipeline::new(&config);
    let result = pipeline.run(vec![observation("Rice", "75", None)], date("2024-01-01"));

    assert!(result.is_err());
    assert!(!pipeline.store().meta_path().exists());
}

#[test]
fn repair_folds_units_and_reindexes() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    pipeline
        .store()
        .save(
            2024,
            &[
                record("2024-01-01", "Oil", "1 L", 190.0),
                record("2024-01-01", "Oil", "5 L", 900.0),
                record("2024-01-02", "Oil", "1 L", 195.0),
            ],
        )
        .expect("seed partition");

    let report = pipeline.repair(2024).expect("repair");
    assert_eq!(report.rows_before, 3);
    assert_eq!(report.rows_after, 3);
    assert_eq!(report.collapsed, 0);
    assert_eq!(report.meta_entries, 2);

    let rows = pipeline.store().load(2024).expect("partition");
    let names: HashSet<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, HashSet::from(["Oil 1 L", "Oil 5 L"]));

    let meta = read_meta(pipeline.store());
    assert_eq!(meta[0].name, "Oil 1 L");
    assert_eq!(meta[0].price, 195.0);

    // Second pass is a no-op.
    let again = pipeline.repair(2024).expect("repair again");
    assert_eq!(again.rows_after, 3);
    assert_eq!(again.collapsed, 0);
    assert_eq!(pipeline.store().load(2024).expect("partition"), rows);
}

#[test]
fn repair_of_a_missing_partition_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));
    assert!(pipeline.repair(1999).is_err());
}

#[test]
fn synthetic_seed_writes_partitions_per_calendar_year() {
    let dir = tempdir().expect("tempdir");
    let pipeline = IngestionPipeline::new(&config_for(dir.path()));

    // A 10-day window ending Jan 3 straddles the year boundary.
    let report = pipeline
        .seed_synthetic(&SyntheticConfig {
            days: 10,
            seed: Some(42),
            end_date: date("2024-01-03"),
        })
        .expect("seed");

    assert_eq!(report.years, vec![2023, 2024]);
    assert_eq!(report.rows, 10 * daam_ingest::SYNTHETIC_PRODUCTS.len());
    assert_eq!(report.meta_entries, daam_ingest::SYNTHETIC_PRODUCTS.len());

    let y2023 = pipeline.store().load(2023).expect("2023");
    let y2024 = pipeline.store().load(2024).expect("2024");
    assert_eq!(y2023.len(), 7 * daam_ingest::SYNTHETIC_PRODUCTS.len());
    assert_eq!(y2024.len(), 3 * daam_ingest::SYNTHETIC_PRODUCTS.len());
    assert!(y2023.iter().all(|r| r.date.format("%Y").to_string() == "2023"));
}
