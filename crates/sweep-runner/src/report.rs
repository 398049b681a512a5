use crate::job::SkippedConfig;
use crate::pipeline::{JobOutcome, JobState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use sweep_core::atomic_write_json_pretty;

pub const REPORT_FILE: &str = "sweep_report.json";
pub const REPORT_SCHEMA: &str = "sweep_report_v1";

/// A job the driver never got to because the sweep was cancelled.
#[derive(Debug, Clone, Serialize)]
pub struct NotStarted {
    pub architecture_id: String,
    pub workload_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub done: usize,
    pub search_failed: usize,
    pub eval_failed: usize,
    pub skipped: usize,
    pub not_started: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub schema_version: String,
    pub sweep_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_root: PathBuf,
    pub mapping_root: PathBuf,
    pub cancelled: bool,
    pub counts: ReportCounts,
    pub jobs: Vec<JobOutcome>,
    pub skipped: Vec<SkippedConfig>,
    pub not_started: Vec<NotStarted>,
}

impl SweepReport {
    pub fn tally(&mut self) {
        let mut counts = ReportCounts {
            skipped: self.skipped.len(),
            not_started: self.not_started.len(),
            ..ReportCounts::default()
        };
        for job in &self.jobs {
            match job.state {
                JobState::Done => counts.done += 1,
                JobState::EvalFailed => counts.eval_failed += 1,
                _ => counts.search_failed += 1,
            }
        }
        self.counts = counts;
    }

    /// Every planned job reached `done` and nothing was skipped or left out.
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty()
            && self.not_started.is_empty()
            && self.jobs.iter().all(|j| j.succeeded())
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| !j.succeeded())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &serde_json::to_value(self)?)
    }
}
