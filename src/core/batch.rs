//! Batch keys and per-batch completion counts.
//!
//! A batch is the set of jobs submitted together. Membership is never stored:
//! it is recomputed by filtering jobs on their `batch_key`.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::models::{Job, JobKind};

/// Batch key shared by every lone single-file submission.
pub const SINGLE_BATCH: &str = "single";

/// Grouping key for jobs submitted together. Also the server-side output folder
/// name, which is what the batch export is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl BatchKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn single() -> Self {
        Self(SINGLE_BATCH.to_string())
    }

    /// Derive the key for a submission of `count` jobs of `kind` made at `now`.
    ///
    /// Paired submissions always get a `combine_` key (minute resolution);
    /// single-file sets get `multi_` (second resolution) unless they hold
    /// exactly one file.
    pub fn derive(kind: JobKind, count: usize, now: DateTime<Local>) -> Self {
        match kind {
            JobKind::PairedFile => Self(format!("combine_{}", now.format("%Y%m%d_%H%M"))),
            JobKind::SingleFile if count > 1 => {
                Self(format!("multi_{}", now.format("%Y%m%d_%H%M%S")))
            }
            JobKind::SingleFile => Self::single(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completion counts for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchAggregate {
    pub key: BatchKey,
    /// Jobs in the batch that reached any terminal state.
    pub completed: usize,
    pub total: usize,
}

impl BatchAggregate {
    /// Count the members of `key` among `jobs`.
    pub fn compute<'a>(key: &BatchKey, jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let (completed, total) = jobs
            .into_iter()
            .filter(|job| &job.batch_key == key)
            .fold((0, 0), |(completed, total), job| {
                (completed + usize::from(job.is_terminal()), total + 1)
            });
        Self {
            key: key.clone(),
            completed,
            total,
        }
    }

    /// Export unlocks as soon as one member is terminal; it does not wait for
    /// the whole batch.
    pub fn export_ready(&self) -> bool {
        self.completed > 0
    }
}

/// Result of a server-side batch export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchExport {
    pub download_url: String,
    pub filename: String,
}
