//! Append-only store of named diagnostic time series
//!
//! Created at run start, passed by `&mut` through the step loop and into the
//! components that record values, and flushed to disk at run end. Every
//! skipped correction, dropped observation and fallback leaves a record
//! here so a run can be audited afterwards.

use crate::error::{AssimilationError, PersistenceFailure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// Fitted mean-field coefficient
pub const TAG_MFM_GAMMA: &str = "mfm_gamma";
/// Mean-field fallback applied instead of a fit
pub const TAG_MFM_FALLBACK: &str = "mfm_fallback";
/// Condition number of the kriging observation covariance
pub const TAG_SKDM_COV_COND: &str = "skdm_cov_cond";
/// Number of cells whose kriging variance was clamped at zero
pub const TAG_SKDM_NEGATIVE_VARIANCE: &str = "skdm_negative_variance";
/// Kriging failed, correction skipped for the time slice
pub const TAG_SKDM_FAILED: &str = "skdm_failed";
/// Per-station observation residual variance
pub const TAG_OBS_RESIDUAL_VARIANCE: &str = "obs_residual_variance";
/// Grid mean of the model residual variance
pub const TAG_MODEL_RESIDUAL_VARIANCE_MEAN: &str = "model_residual_variance_mean";
/// Observation estimator not updated because some stations did not report
pub const TAG_OBS_RE_PARTIAL_SKIP: &str = "obs_re_partial_skip";
/// Cells whose Kalman correction was skipped
pub const TAG_KALMAN_SKIPPED_CELLS: &str = "kalman_skipped_cells";
/// Worst innovation-covariance condition number among skipped cells
pub const TAG_KALMAN_MAX_COND: &str = "kalman_max_cond";
/// Largest state-covariance condition number over the grid
pub const TAG_CELL_COV_COND_MAX: &str = "cell_cov_cond_max";
/// Measurement dropped during pre-processing
pub const TAG_OBS_DROPPED: &str = "obs_dropped";

/// A recorded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiagnosticValue {
    /// Single number
    Scalar(f64),
    /// Vector of numbers
    Array(Vec<f64>),
    /// Free-form note
    Text(String),
}

impl DiagnosticValue {
    /// The scalar, if this is one
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for DiagnosticValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<usize> for DiagnosticValue {
    fn from(v: usize) -> Self {
        Self::Scalar(v as f64)
    }
}

impl From<Vec<f64>> for DiagnosticValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(v)
    }
}

impl From<&[f64]> for DiagnosticValue {
    fn from(v: &[f64]) -> Self {
        Self::Array(v.to_vec())
    }
}

impl From<String> for DiagnosticValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for DiagnosticValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

/// One stored value with its step stamp and global recording sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// Recording order across all tags
    pub seq: u64,
    /// Assimilation step active when the value was pushed
    pub step: usize,
    /// The value
    pub value: DiagnosticValue,
}

/// Flat export row: one value of one tag at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Tag name
    pub tag: String,
    /// Assimilation step
    pub step: usize,
    /// The value
    pub value: DiagnosticValue,
}

#[derive(Debug, Clone, Copy)]
struct TagConfig {
    echo: bool,
    store: bool,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            echo: false,
            store: true,
        }
    }
}

/// Diagnostics context of one run
#[derive(Debug, Default)]
pub struct Diagnostics {
    step: usize,
    next_seq: u64,
    config: BTreeMap<String, TagConfig>,
    series: BTreeMap<String, Vec<DiagnosticEntry>>,
}

impl Diagnostics {
    /// Empty store at step 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure whether `tag` is echoed to the log and whether it is stored
    pub fn configure_tag(&mut self, tag: &str, echo: bool, store: bool) {
        self.config
            .insert(tag.to_owned(), TagConfig { echo, store });
    }

    /// Stamp subsequent pushes with `step`
    pub fn begin_step(&mut self, step: usize) {
        self.step = step;
    }

    /// Step currently being recorded
    pub fn current_step(&self) -> usize {
        self.step
    }

    /// Append a value under `tag`
    pub fn push(&mut self, tag: &str, value: impl Into<DiagnosticValue>) {
        let value = value.into();
        let cfg = self.config.get(tag).copied().unwrap_or_default();
        if cfg.echo {
            info!(target: "fmda::diagnostics", step = self.step, tag, value = ?value);
        }
        if !cfg.store {
            return;
        }
        let entry = DiagnosticEntry {
            seq: self.next_seq,
            step: self.step,
            value,
        };
        self.next_seq += 1;
        self.series.entry(tag.to_owned()).or_default().push(entry);
    }

    /// Values recorded under `tag`, in recording order (empty if none)
    pub fn pull(&self, tag: &str) -> &[DiagnosticEntry] {
        self.series.get(tag).map_or(&[], Vec::as_slice)
    }

    /// Scalar values recorded under `tag`, in recording order
    pub fn pull_scalars(&self, tag: &str) -> Vec<f64> {
        self.pull(tag)
            .iter()
            .filter_map(|e| e.value.as_scalar())
            .collect()
    }

    /// Names of all tags with at least one stored value
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Every stored value as a flat record, in global recording order
    pub fn flat_records(&self) -> Vec<DiagnosticRecord> {
        let mut rows: Vec<(u64, DiagnosticRecord)> = self
            .series
            .iter()
            .flat_map(|(tag, entries)| {
                entries.iter().map(move |e| {
                    (
                        e.seq,
                        DiagnosticRecord {
                            tag: tag.clone(),
                            step: e.step,
                            value: e.value.clone(),
                        },
                    )
                })
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, r)| r).collect()
    }

    /// Write all records to `path` as JSON
    ///
    /// # Errors
    /// Returns `Persistence` if the file cannot be created or written
    pub fn flush(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_json(path, &self.flat_records())?;
        info!(
            "Diagnostics flushed: {} records, {} tags -> {}",
            self.next_seq,
            self.series.len(),
            path.display()
        );
        Ok(())
    }

    /// Write every tag's series to `path` as a JSON object keyed by tag
    ///
    /// Entries keep their `seq` and `step` stamps.
    ///
    /// # Errors
    /// Returns `Persistence` if the file cannot be created or written
    pub fn flush_series(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_json(path, &self.series)?;
        info!(
            "Diagnostics series dumped: {} tags -> {}",
            self.series.len(),
            path.display()
        );
        Ok(())
    }

    /// Log a warning and record it under `tag`
    pub(crate) fn warn(&mut self, tag: &str, value: impl Into<DiagnosticValue>, message: &str) {
        warn!(step = self.step, tag, "{message}");
        self.push(tag, value);
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let wrap = |source: PersistenceFailure| AssimilationError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(|e| wrap(e.into()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| wrap(e.into()))?;
    writer.flush().map_err(|e| wrap(e.into()))
}
