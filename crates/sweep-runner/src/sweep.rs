use crate::cache::MappingCache;
use crate::evaluator::{Evaluator, ProcessEvaluator};
use crate::job::build_jobs;
use crate::pipeline::{StagePipeline, WorkDirLayout};
use crate::report::{NotStarted, ReportCounts, SweepReport, REPORT_FILE, REPORT_SCHEMA};
use crate::spec::{load_sweep_spec, SweepSpec};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sweep_core::ensure_dir;
use tracing::{info, warn};

/// Cooperative stop request, honoured between jobs only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    /// Overrides `reuse_cached_mappings` from the spec when set.
    pub reuse_cached_mappings: Option<bool>,
    pub cancel: Option<CancelFlag>,
}

/// Runs every job of `spec` in order. Only failing to set up the output and
/// mapping roots (or to write the final report) is an error; job failures are
/// recorded in the report.
pub fn run_sweep<E: Evaluator + ?Sized>(
    spec: &SweepSpec,
    evaluator: &E,
    options: &SweepOptions,
) -> Result<SweepReport> {
    let started_at = Utc::now();
    let output_root = spec.output_root.clone();
    let mapping_root = spec.mapping_root();
    ensure_dir(&output_root)
        .map_err(|e| anyhow!("cannot create output root {}: {}", output_root.display(), e))?;
    ensure_dir(&mapping_root)
        .map_err(|e| anyhow!("cannot create mapping root {}: {}", mapping_root.display(), e))?;

    let plan = build_jobs(spec);
    let cache = MappingCache::new(&mapping_root);
    let layout = WorkDirLayout::new(&output_root);
    let reuse = options
        .reuse_cached_mappings
        .unwrap_or(spec.reuse_cached_mappings);
    let pipeline = StagePipeline::new(evaluator, &cache, &layout, &spec.evaluator.mapping_artifact)
        .reuse_cached_mappings(reuse);

    let sweep_id = format!("sweep_{}", started_at.format("%Y%m%d_%H%M%S"));
    info!(
        sweep_id = %sweep_id,
        jobs = plan.jobs.len(),
        skipped = plan.skipped.len(),
        reuse_cached_mappings = reuse,
        "starting sweep"
    );

    let total = plan.jobs.len();
    let mut outcomes = Vec::with_capacity(total);
    let mut not_started = Vec::new();
    let mut cancelled = false;
    for (idx, job) in plan.jobs.iter().enumerate() {
        if !cancelled && options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            warn!(remaining = total - idx, "sweep cancelled; remaining jobs will not start");
            cancelled = true;
        }
        if cancelled {
            not_started.push(NotStarted {
                architecture_id: job.architecture_id.clone(),
                workload_id: job.workload_id.clone(),
            });
            continue;
        }
        info!(job = %job.label(), index = idx + 1, total, "starting job");
        outcomes.push(pipeline.run(job));
    }

    // Only succeeds once every per-job search directory is gone.
    let _ = fs::remove_dir(layout.search_root());

    let mut report = SweepReport {
        schema_version: REPORT_SCHEMA.to_string(),
        sweep_id,
        started_at,
        finished_at: Utc::now(),
        output_root: output_root.clone(),
        mapping_root,
        cancelled,
        counts: ReportCounts::default(),
        jobs: outcomes,
        skipped: plan.skipped,
        not_started,
    };
    report.tally();
    report.write(&output_root.join(REPORT_FILE))?;

    for job in report.failed_jobs() {
        warn!(
            job = %job.label(),
            state = job.state.as_str(),
            error = job.error.as_deref().unwrap_or(""),
            "job did not finish"
        );
    }
    info!(
        done = report.counts.done,
        search_failed = report.counts.search_failed,
        eval_failed = report.counts.eval_failed,
        skipped = report.counts.skipped,
        not_started = report.counts.not_started,
        "sweep finished"
    );
    Ok(report)
}

/// Loads a spec file and runs it against the configured evaluator process.
pub fn run_sweep_file(path: &Path, options: &SweepOptions) -> Result<SweepReport> {
    let spec = load_sweep_spec(path)?;
    let evaluator = ProcessEvaluator::from_spec(&spec.evaluator);
    run_sweep(&spec, &evaluator, options)
}
