//! Harvest orchestration: descriptor iteration, the per-descriptor state
//! machine, and sequential or bounded-parallel scheduling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use netatlas_core::{Record, ScoreType, SourceDescriptor, VariantConfig};
use netatlas_extract::{detect_score_type, page_has_table, parse_net_table, RowExtractor};
use netatlas_fetch::{FetcherConfig, HttpFetcher, RetryPolicy};
use netatlas_store::{AppendResult, RecordStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "netatlas-harvest";

pub use netatlas_fetch::DEFAULT_USER_AGENT;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub initial_wait: Duration,
    /// Courtesy delay bounds between descriptors; the actual wait is drawn
    /// uniformly from this range. Politeness only, not a correctness knob.
    pub delay_min: Duration,
    pub delay_max: Duration,
    /// 1 = sequential; larger values run descriptors on a bounded pool.
    pub workers: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("out"),
            user_agent: netatlas_fetch::DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_wait: Duration::from_secs(2),
            delay_min: Duration::from_millis(1000),
            delay_max: Duration::from_millis(3000),
            workers: 1,
        }
    }
}

/// Stage at which a descriptor short-circuited to failure. Fetch, schema,
/// and empty-table failures are recorded and skipped; only store failures
/// abort the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FailureStage {
    Fetch,
    Schema,
    Empty,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Schema => "schema",
            FailureStage::Empty => "empty",
        }
    }
}

#[derive(Debug, Error)]
#[error("{stage:?} failure for {name}: {detail}")]
pub struct DescriptorFailure {
    pub name: String,
    pub stage: FailureStage,
    pub detail: String,
}

/// Run summary: the single surface where per-descriptor failures become
/// visible. Per-descriptor failures never affect the process exit status.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures_by_stage: BTreeMap<String, usize>,
    pub rows_by_variant: BTreeMap<String, usize>,
    pub written: usize,
    pub skipped_duplicate: usize,
}

impl HarvestReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            processed: 0,
            succeeded: 0,
            failed: 0,
            failures_by_stage: BTreeMap::new(),
            rows_by_variant: BTreeMap::new(),
            written: 0,
            skipped_duplicate: 0,
        }
    }

    fn record_success(&mut self, score_type: ScoreType, rows: usize, result: AppendResult) {
        self.processed += 1;
        self.succeeded += 1;
        *self
            .rows_by_variant
            .entry(score_type.file_stem().to_string())
            .or_default() += rows;
        self.written += result.written;
        self.skipped_duplicate += result.skipped_duplicate;
    }

    fn record_failure(&mut self, stage: FailureStage) {
        self.processed += 1;
        self.failed += 1;
        *self
            .failures_by_stage
            .entry(stage.as_str().to_string())
            .or_default() += 1;
    }
}

/// Load the descriptor list from a two-column CSV (display name, URL) with
/// a header row. Produced by an external enumeration step.
pub fn load_descriptors(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("reading descriptor list {}", path.display()))?;
    let mut descriptors = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("parsing descriptor list {}", path.display()))?;
        let name = row.get(0).unwrap_or_default().trim();
        let url = row.get(1).unwrap_or_default().trim();
        if name.is_empty() || url.is_empty() {
            continue;
        }
        descriptors.push(SourceDescriptor {
            name: name.to_string(),
            url: url.to_string(),
        });
    }
    Ok(descriptors)
}

/// Variant schema configuration: a YAML file when given, compiled-in
/// defaults otherwise.
pub fn load_variant_config(path: Option<&Path>) -> Result<VariantConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(VariantConfig::default()),
    }
}

/// Resolve and extract one fetched page: detect the variant, resolve the
/// header against its schema, and stream the rows into records. Pure with
/// respect to the page text.
pub fn records_from_page(
    body: &str,
    descriptor: &SourceDescriptor,
    variants: &VariantConfig,
) -> Result<(ScoreType, Vec<Record>), DescriptorFailure> {
    let fail = |stage, detail: String| DescriptorFailure {
        name: descriptor.name.clone(),
        stage,
        detail,
    };

    // Pages without a score-type tag in the title are two-year program
    // tables carrying only the base columns.
    let score_type = detect_score_type(body).unwrap_or(ScoreType::Tyt);

    let schema = variants.schema(score_type).ok_or_else(|| {
        fail(
            FailureStage::Schema,
            format!("no schema configured for {}", score_type.label()),
        )
    })?;

    let table = parse_net_table(body)
        .ok_or_else(|| fail(FailureStage::Schema, "table header missing".to_string()))?;

    let field_map = resolve_or_fail(&table.header, schema, descriptor)?;

    let records: Vec<Record> =
        RowExtractor::new(&table.rows, &field_map, schema, &descriptor.name).collect();
    if records.is_empty() {
        // An empty table for a known-valid program is almost certainly a
        // resolver or markup problem, not real data.
        return Err(fail(
            FailureStage::Empty,
            "no extractable data rows".to_string(),
        ));
    }

    Ok((score_type, records))
}

fn resolve_or_fail(
    header: &[String],
    schema: &netatlas_core::VariantSchema,
    descriptor: &SourceDescriptor,
) -> Result<netatlas_core::FieldMap, DescriptorFailure> {
    netatlas_extract::resolve_header(header, schema).map_err(|err| DescriptorFailure {
        name: descriptor.name.clone(),
        stage: FailureStage::Schema,
        detail: err.to_string(),
    })
}

async fn process_descriptor(
    fetcher: &HttpFetcher,
    variants: &VariantConfig,
    descriptor: &SourceDescriptor,
) -> Result<(ScoreType, Vec<Record>), DescriptorFailure> {
    let page = fetcher
        .fetch_with_check(&descriptor.url, |page| page_has_table(&page.body))
        .await
        .map_err(|err| DescriptorFailure {
            name: descriptor.name.clone(),
            stage: FailureStage::Fetch,
            detail: err.to_string(),
        })?;

    records_from_page(&page.body, descriptor, variants)
}

fn courtesy_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span_ms = (max - min).as_millis() as u64;
    let jitter = {
        use rand::Rng;
        rand::rng().random_range(0..=span_ms)
    };
    min + Duration::from_millis(jitter)
}

pub struct HarvestDriver {
    config: HarvestConfig,
    fetcher: Arc<HttpFetcher>,
    variants: Arc<VariantConfig>,
}

impl HarvestDriver {
    pub fn new(config: HarvestConfig, variants: VariantConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            retry: RetryPolicy {
                max_attempts: config.max_retries,
                initial_wait: config.initial_wait,
            },
        })?;
        Ok(Self {
            config,
            fetcher: Arc::new(fetcher),
            variants: Arc::new(variants),
        })
    }

    /// Process every descriptor through the fetch → resolve → extract →
    /// persist pipeline. Descriptor-level failures are tallied and skipped;
    /// a store-level error aborts the run because there is no safe way to
    /// continue without a working sink.
    pub async fn run(&self, descriptors: &[SourceDescriptor]) -> Result<HarvestReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("harvest_run", %run_id, total = descriptors.len());

        let store = Mutex::new(RecordStore::new(
            self.config.output_dir.clone(),
            self.variants.as_ref().clone(),
        ));

        let mut report = HarvestReport::new(run_id, started_at);
        if self.config.workers <= 1 {
            self.run_sequential(descriptors, &store, &mut report)
                .instrument(span)
                .await?;
        } else {
            self.run_parallel(descriptors, &store, &mut report)
                .instrument(span)
                .await?;
        }

        report.finished_at = Utc::now();
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            written = report.written,
            skipped_duplicate = report.skipped_duplicate,
            "harvest finished"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        descriptors: &[SourceDescriptor],
        store: &Mutex<RecordStore>,
        report: &mut HarvestReport,
    ) -> Result<()> {
        for (index, descriptor) in descriptors.iter().enumerate() {
            match process_descriptor(&self.fetcher, &self.variants, descriptor).await {
                Ok((score_type, records)) => {
                    let result = store
                        .lock()
                        .await
                        .append(score_type, &records)
                        .with_context(|| format!("persisting batch for {}", descriptor.name))?;
                    info!(
                        name = %descriptor.name,
                        variant = score_type.label(),
                        rows = records.len(),
                        written = result.written,
                        "descriptor persisted"
                    );
                    report.record_success(score_type, records.len(), result);
                }
                Err(failure) => {
                    warn!(name = %failure.name, stage = failure.stage.as_str(), detail = %failure.detail, "descriptor failed");
                    report.record_failure(failure.stage);
                }
            }

            if index + 1 < descriptors.len() {
                let wait = courtesy_delay(self.config.delay_min, self.config.delay_max);
                tokio::time::sleep(wait).await;
            }
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        descriptors: &[SourceDescriptor],
        store: &Mutex<RecordStore>,
        report: &mut HarvestReport,
    ) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.config.workers));
        let mut handles = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors.iter().cloned() {
            let limit = Arc::clone(&limit);
            let fetcher = Arc::clone(&self.fetcher);
            let variants = Arc::clone(&self.variants);
            let delay = courtesy_delay(self.config.delay_min, self.config.delay_max);

            handles.push(tokio::spawn(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                tokio::time::sleep(delay).await;
                let outcome = process_descriptor(&fetcher, &variants, &descriptor).await;
                (descriptor, outcome)
            }));
        }

        for handle in handles {
            let (descriptor, outcome) = handle.await.context("joining harvest worker")?;
            match outcome {
                Ok((score_type, records)) => {
                    // The store is the single serialized writer; append
                    // batches never interleave partial rows.
                    let result = store
                        .lock()
                        .await
                        .append(score_type, &records)
                        .with_context(|| format!("persisting batch for {}", descriptor.name))?;
                    report.record_success(score_type, records.len(), result);
                }
                Err(failure) => {
                    warn!(name = %failure.name, stage = failure.stage.as_str(), detail = %failure.detail, "descriptor failed");
                    report.record_failure(failure.stage);
                }
            }
        }
        Ok(())
    }
}
