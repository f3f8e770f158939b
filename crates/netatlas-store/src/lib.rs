//! Append-only, restart-safe record persistence.
//!
//! The authoritative output per variant is a UTF-8 CSV that only ever grows.
//! A side-car identity log (one identity per line) lets a restarted run skip
//! already-persisted rows without re-reading the whole dataset; when the log
//! is missing the identity set is rebuilt by scanning the CSV's identity
//! column. A derived Parquet snapshot is regenerated on each persist cycle
//! as a best-effort view and never blocks the CSV.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use netatlas_core::{Record, ScoreType, VariantConfig, VariantSchema, ABSENT_FIELD};
use parquet::arrow::ArrowWriter;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "netatlas-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("no schema configured for score type {0:?}")]
    UnknownVariant(ScoreType),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path, source: csv::Error) -> StoreError {
    StoreError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Outcome of one `append` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendResult {
    pub written: usize,
    pub skipped_duplicate: usize,
}

impl AppendResult {
    fn merge(&mut self, other: AppendResult) {
        self.written += other.written;
        self.skipped_duplicate += other.skipped_duplicate;
    }
}

/// Store for one variant's output file pair.
#[derive(Debug)]
pub struct VariantStore {
    schema: VariantSchema,
    csv_path: PathBuf,
    log_path: PathBuf,
    parquet_path: PathBuf,
    known: HashSet<String>,
}

impl VariantStore {
    /// Open (or create) the output target for one variant, reloading the
    /// identity set from the side-car log unioned with a scan of the CSV
    /// identity column. The union makes a crash between the row write and
    /// the log write harmless.
    pub fn open(dir: &Path, schema: VariantSchema) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let stem = schema.score_type.file_stem();
        let csv_path = dir.join(format!("{stem}.csv"));
        let log_path = dir.join(format!("{stem}.identities"));
        let parquet_path = dir.join(format!("{stem}.parquet"));

        let mut known = HashSet::new();
        if log_path.exists() {
            let file = File::open(&log_path).map_err(|e| io_err(&log_path, e))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| io_err(&log_path, e))?;
                let identity = line.trim();
                if !identity.is_empty() {
                    known.insert(identity.to_string());
                }
            }
        }

        if csv_path.exists() {
            let mut reader = csv::Reader::from_path(&csv_path).map_err(|e| csv_err(&csv_path, e))?;
            for row in reader.records() {
                let row = row.map_err(|e| csv_err(&csv_path, e))?;
                if let Some(identity) = row.get(0) {
                    known.insert(identity.to_string());
                }
            }
        } else {
            let mut writer =
                csv::Writer::from_path(&csv_path).map_err(|e| csv_err(&csv_path, e))?;
            writer
                .write_record(Self::column_titles(&schema))
                .map_err(|e| csv_err(&csv_path, e))?;
            writer.flush().map_err(|e| io_err(&csv_path, e))?;
        }

        debug!(
            variant = schema.score_type.label(),
            known = known.len(),
            "opened variant store"
        );

        Ok(Self {
            schema,
            csv_path,
            log_path,
            parquet_path,
            known,
        })
    }

    fn column_titles(schema: &VariantSchema) -> Vec<String> {
        let mut titles = vec!["Kimlik".to_string(), "Program Adı".to_string()];
        titles.extend(schema.fields.iter().map(|f| f.column_title.clone()));
        titles
    }

    /// Append a batch, dropping identities that are already persisted.
    /// Idempotent per identity across calls and across process restarts;
    /// previously committed rows are never rewritten.
    pub fn append(&mut self, records: &[Record]) -> Result<AppendResult, StoreError> {
        let mut result = AppendResult::default();

        let csv_file = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .map_err(|e| io_err(&self.csv_path, e))?;
        let mut writer = csv::Writer::from_writer(csv_file);

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| io_err(&self.log_path, e))?;
        let mut log = BufWriter::new(log_file);

        for record in records {
            if self.known.contains(&record.identity) {
                result.skipped_duplicate += 1;
                continue;
            }

            let mut row = vec![record.identity.clone(), record.program.clone()];
            for field in &self.schema.fields {
                row.push(
                    record
                        .field(&field.name)
                        .unwrap_or(ABSENT_FIELD)
                        .to_string(),
                );
            }
            writer
                .write_record(&row)
                .map_err(|e| csv_err(&self.csv_path, e))?;
            // Row first, identity second: a crash in between leaves a row
            // whose identity is recovered by the CSV scan on reopen.
            writer.flush().map_err(|e| io_err(&self.csv_path, e))?;
            writeln!(log, "{}", record.identity).map_err(|e| io_err(&self.log_path, e))?;

            self.known.insert(record.identity.clone());
            result.written += 1;
        }

        log.flush().map_err(|e| io_err(&self.log_path, e))?;

        if result.written > 0 {
            if let Err(err) = self.export_snapshot() {
                warn!(
                    variant = self.schema.score_type.label(),
                    error = %err,
                    "parquet snapshot export failed; csv output is unaffected"
                );
            }
        }

        Ok(result)
    }

    pub fn known_identities(&self) -> usize {
        self.known.len()
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn parquet_path(&self) -> &Path {
        &self.parquet_path
    }

    /// Regenerate the derived Parquet snapshot from the full CSV content.
    /// Best-effort by contract; callers log failures instead of propagating.
    fn export_snapshot(&self) -> anyhow::Result<()> {
        let mut reader = csv::Reader::from_path(&self.csv_path)
            .with_context(|| format!("reading {}", self.csv_path.display()))?;
        let titles = Self::column_titles(&self.schema);
        let mut columns: Vec<Vec<String>> = vec![Vec::new(); titles.len()];
        for row in reader.records() {
            let row = row.with_context(|| format!("reading {}", self.csv_path.display()))?;
            for (i, column) in columns.iter_mut().enumerate() {
                column.push(row.get(i).unwrap_or_default().to_string());
            }
        }

        let arrow_schema = Arc::new(Schema::new(
            titles
                .iter()
                .map(|t| ArrowField::new(t.clone(), DataType::Utf8, false))
                .collect::<Vec<_>>(),
        ));
        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|c| Arc::new(StringArray::from(c)) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(arrow_schema.clone(), arrays)
            .context("building snapshot record batch")?;

        // Temp-file + rename so a crash mid-export never leaves a truncated
        // snapshot in place.
        let tmp_path = self.parquet_path.with_extension("parquet.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        let mut writer = ArrowWriter::try_new(file, arrow_schema, None)
            .with_context(|| format!("opening parquet writer {}", tmp_path.display()))?;
        writer
            .write(&batch)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        writer
            .close()
            .with_context(|| format!("closing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.parquet_path).with_context(|| {
            format!(
                "renaming {} -> {}",
                tmp_path.display(),
                self.parquet_path.display()
            )
        })?;
        Ok(())
    }
}

/// All variant stores under one output directory. Opens each variant target
/// lazily on first append, so only harvested variants produce files.
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    config: VariantConfig,
    variants: BTreeMap<ScoreType, VariantStore>,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>, config: VariantConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            variants: BTreeMap::new(),
        }
    }

    pub fn variant(&mut self, score_type: ScoreType) -> Result<&mut VariantStore, StoreError> {
        if !self.variants.contains_key(&score_type) {
            let schema = self
                .config
                .schema(score_type)
                .ok_or(StoreError::UnknownVariant(score_type))?
                .clone();
            let store = VariantStore::open(&self.dir, schema)?;
            self.variants.insert(score_type, store);
        }
        Ok(self.variants.get_mut(&score_type).expect("just inserted"))
    }

    pub fn append(
        &mut self,
        score_type: ScoreType,
        records: &[Record],
    ) -> Result<AppendResult, StoreError> {
        let mut result = AppendResult::default();
        result.merge(self.variant(score_type)?.append(records)?);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netatlas_core::FieldSpec;
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn test_schema() -> VariantSchema {
        VariantSchema {
            score_type: ScoreType::Tyt,
            fields: vec![
                FieldSpec::required("university", "Üniversite", "Üniversite"),
                FieldSpec::required("year", "Yılı", "Yılı"),
            ],
        }
    }

    fn record(identity: &str, university: &str, year: &str) -> Record {
        let mut fields = Map::new();
        fields.insert("university".to_string(), university.to_string());
        fields.insert("year".to_string(), year.to_string());
        Record {
            identity: identity.to_string(),
            program: "Hemşirelik".to_string(),
            score_type: ScoreType::Tyt,
            fields,
        }
    }

    fn csv_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn append_is_idempotent_per_identity() {
        let dir = tempdir().unwrap();
        let mut store = VariantStore::open(dir.path(), test_schema()).unwrap();

        let batch = vec![record("a", "X Üni", "2024"), record("b", "Y Üni", "2024")];
        let first = store.append(&batch).unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(first.skipped_duplicate, 0);

        let second = store.append(&batch).unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.skipped_duplicate, 2);

        // Header plus exactly one row per identity.
        assert_eq!(csv_lines(store.csv_path()).len(), 3);
    }

    #[test]
    fn resume_skips_previously_persisted_identities() {
        let dir = tempdir().unwrap();
        {
            let mut store = VariantStore::open(dir.path(), test_schema()).unwrap();
            store
                .append(&[record("a", "X Üni", "2023"), record("b", "Y Üni", "2023")])
                .unwrap();
        }

        // Fresh process: reopen and append an overlapping batch.
        let mut store = VariantStore::open(dir.path(), test_schema()).unwrap();
        assert_eq!(store.known_identities(), 2);
        let result = store
            .append(&[
                record("a", "X Üni", "2023"),
                record("b", "Y Üni", "2023"),
                record("c", "Z Üni", "2023"),
            ])
            .unwrap();
        assert_eq!(result.written, 1);
        assert_eq!(result.skipped_duplicate, 2);
        assert_eq!(csv_lines(store.csv_path()).len(), 4);
    }

    #[test]
    fn identity_set_rebuilds_from_csv_when_log_is_lost() {
        let dir = tempdir().unwrap();
        let log_path;
        {
            let mut store = VariantStore::open(dir.path(), test_schema()).unwrap();
            store.append(&[record("a", "X Üni", "2022")]).unwrap();
            log_path = dir.path().join("tyt.identities");
        }
        std::fs::remove_file(&log_path).unwrap();

        let mut store = VariantStore::open(dir.path(), test_schema()).unwrap();
        assert_eq!(store.known_identities(), 1);
        let result = store.append(&[record("a", "X Üni", "2022")]).unwrap();
        assert_eq!(result.written, 0);
        assert_eq!(result.skipped_duplicate, 1);
    }

    #[test]
    fn snapshot_is_regenerated_next_to_the_csv() {
        let dir = tempdir().unwrap();
        let mut store = VariantStore::open(dir.path(), test_schema()).unwrap();
        store.append(&[record("a", "X Üni", "2024")]).unwrap();
        assert!(store.parquet_path().exists());
    }

    #[test]
    fn record_store_opens_variants_lazily() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::new(dir.path(), VariantConfig::default());
        store
            .append(ScoreType::Tyt, &[record("a", "X Üni", "2024")])
            .unwrap();
        assert!(dir.path().join("tyt.csv").exists());
        assert!(!dir.path().join("say.csv").exists());
    }
}
