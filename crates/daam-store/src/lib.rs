//! Year-partitioned price storage, meta index persistence, and fetch edges.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::NaiveDate;
use daam_core::{MetaEntry, PriceRecord};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "daam-store";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no partition file for year {year}")]
    PartitionMissing { year: i32 },
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("serializing meta index: {0}")]
    Json(#[from] serde_json::Error),
    #[error("partition column {column} is missing or has the wrong type")]
    Column { column: &'static str },
    #[error("unparseable date value {value:?} in partition")]
    BadDate { value: String },
}

impl StoreError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write bytes to `path` via a temp file in the same directory plus rename,
/// so a crash mid-write never leaves a truncated file behind.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io("creating directory", parent, e))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes).map_err(|e| StoreError::io("writing temp file", &temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StoreError::io("replacing file", path, e)
    })
}

/// Reads and writes the year-partitioned historical dataset.
///
/// One parquet file per calendar year at `<root>/prices/year=<YYYY>/data.parquet`,
/// rows sorted by `(name, date)` on every save. Downstream analytical readers
/// range-scan per product and rely on that order.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prices_dir(&self) -> PathBuf {
        self.root.join("prices")
    }

    pub fn partition_path(&self, year: i32) -> PathBuf {
        self.prices_dir().join(format!("year={year}")).join("data.parquet")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    /// Years that currently have a partition file, ascending.
    pub fn list_years(&self) -> Result<Vec<i32>, StoreError> {
        let prices_dir = self.prices_dir();
        let entries = match fs::read_dir(&prices_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("listing partitions", &prices_dir, e)),
        };

        let mut years = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("listing partitions", &prices_dir, e))?;
            let dir_name = entry.file_name();
            let Some(year) = dir_name
                .to_str()
                .and_then(|n| n.strip_prefix("year="))
                .and_then(|y| y.parse::<i32>().ok())
            else {
                continue;
            };
            if entry.path().join("data.parquet").exists() {
                years.push(year);
            }
        }
        years.sort_unstable();
        Ok(years)
    }

    /// Load one year's partition. Absence is `PartitionMissing`; steady-state
    /// ingestion treats that as an empty starting partition.
    pub fn load(&self, year: i32) -> Result<Vec<PriceRecord>, StoreError> {
        let path = self.partition_path(year);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::PartitionMissing { year });
            }
            Err(e) => return Err(StoreError::io("opening partition", &path, e)),
        };

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut records = Vec::new();
        for batch in reader {
            decode_batch(&batch?, &mut records)?;
        }
        debug!(year, rows = records.len(), "loaded partition");
        Ok(records)
    }

    /// Every record across every year, in ascending year order.
    pub fn load_all(&self) -> Result<Vec<PriceRecord>, StoreError> {
        let mut records = Vec::new();
        for year in self.list_years()? {
            records.extend(self.load(year)?);
        }
        Ok(records)
    }

    /// Persist a full partition atomically, re-sorting by `(name, date)`.
    pub fn save(&self, year: i32, records: &[PriceRecord]) -> Result<usize, StoreError> {
        let mut sorted: Vec<&PriceRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then(a.date.cmp(&b.date)));

        let path = self.partition_path(year);
        let parent = path.parent().expect("partition path always has parent");
        fs::create_dir_all(parent).map_err(|e| StoreError::io("creating directory", parent, e))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let result = self.write_parquet(&temp_path, &sorted);
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            StoreError::io("replacing partition", &path, e)
        })?;
        debug!(year, rows = sorted.len(), "saved partition");
        Ok(sorted.len())
    }

    fn write_parquet(&self, path: &Path, records: &[&PriceRecord]) -> Result<(), StoreError> {
        let schema = partition_schema();
        let batch = encode_batch(schema.clone(), records)?;
        let file =
            File::create(path).map_err(|e| StoreError::io("creating temp partition", path, e))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    /// Overwrite the whole-catalog meta index with one JSON array.
    pub fn write_meta_index(&self, entries: &[MetaEntry]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(entries)?;
        write_atomic(&self.meta_path(), &bytes)
    }
}

fn partition_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("date", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
        Field::new("unit", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("image", DataType::Utf8, false),
    ]))
}

fn encode_batch(schema: Arc<Schema>, records: &[&PriceRecord]) -> Result<RecordBatch, StoreError> {
    let dates = StringArray::from(
        records
            .iter()
            .map(|r| r.date.format(DATE_FORMAT).to_string())
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    let prices = Float64Array::from(records.iter().map(|r| r.price).collect::<Vec<_>>());
    let units = StringArray::from(records.iter().map(|r| r.unit.as_str()).collect::<Vec<_>>());
    let categories =
        StringArray::from(records.iter().map(|r| r.category.as_str()).collect::<Vec<_>>());
    let images = StringArray::from(records.iter().map(|r| r.image.as_str()).collect::<Vec<_>>());

    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(names),
            Arc::new(prices),
            Arc::new(units),
            Arc::new(categories),
            Arc::new(images),
        ],
    )?)
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    column: &'static str,
) -> Result<&'a StringArray, StoreError> {
    batch
        .column_by_name(column)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or(StoreError::Column { column })
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<PriceRecord>) -> Result<(), StoreError> {
    let dates = string_column(batch, "date")?;
    let names = string_column(batch, "name")?;
    let units = string_column(batch, "unit")?;
    let categories = string_column(batch, "category")?;
    let images = string_column(batch, "image")?;
    let prices = batch
        .column_by_name("price")
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or(StoreError::Column { column: "price" })?;

    out.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        let date_text = dates.value(row);
        let date = NaiveDate::parse_from_str(date_text, DATE_FORMAT).map_err(|_| {
            StoreError::BadDate {
                value: date_text.to_string(),
            }
        })?;
        out.push(PriceRecord {
            date,
            name: names.value(row).to_string(),
            price: prices.value(row),
            unit: units.value(row).to_string(),
            category: categories.value(row).to_string(),
            image: images.value(row).to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Flat directory of product images keyed by the deterministic filename.
///
/// The filename is a pure function of the product name, so checking existence
/// before fetching makes repeated runs skip already-cached images. A race
/// between two runs writing the same new image is tolerated: content is
/// identical, last rename wins.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub async fn contains(&self, filename: &str) -> bool {
        tokio::fs::try_exists(self.path_for(filename))
            .await
            .unwrap_or(false)
    }

    pub async fn store_bytes(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<StoredImage> {
        use anyhow::Context;

        let path = self.path_for(filename);
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating image directory {}", self.root.display()))?;

        if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking image path {}", path.display()))?
        {
            return Ok(StoredImage {
                path,
                deduplicated: true,
            });
        }

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match tokio::fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredImage {
                path,
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Ok(StoredImage {
                    path,
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(err).with_context(|| format!("renaming temp image into {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Small retrying GET client for the image cache and sitemap download.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}
