use crate::cache::{MappingCache, StoredMapping};
use crate::error::JobError;
use crate::evaluator::{log_tail, Evaluator, Invocation, Mode};
use crate::job::JobDescriptor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use sweep_core::{atomic_write_json_pretty, ensure_dir, remove_dir_if_exists};
use tracing::{info, warn};

pub const JOB_STATUS_FILE: &str = "job_status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Searching,
    SearchFailed,
    MappingFound,
    Evaluating,
    Done,
    EvalFailed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Searching => "searching",
            JobState::SearchFailed => "search_failed",
            JobState::MappingFound => "mapping_found",
            JobState::Evaluating => "evaluating",
            JobState::Done => "done",
            JobState::EvalFailed => "eval_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::SearchFailed | JobState::Done | JobState::EvalFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    Searched,
    Cached,
}

/// Where a job's directories live. Transient search directories sit under
/// `{output_root}/.search`; final outputs sit directly under `output_root`.
#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    pub output_root: PathBuf,
}

impl WorkDirLayout {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    pub fn search_root(&self) -> PathBuf {
        self.output_root.join(".search")
    }

    pub fn search_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.search_root().join(job.output_name())
    }

    pub fn final_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.output_root.join(job.output_name())
    }
}

/// Removes the search directory when dropped, on every exit path.
struct TransientDir {
    path: PathBuf,
}

impl TransientDir {
    fn create(path: PathBuf) -> Result<Self, JobError> {
        remove_dir_if_exists(&path)?;
        ensure_dir(&path)?;
        Ok(Self { path })
    }
}

impl Drop for TransientDir {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove search directory");
        }
    }
}

/// What happened to one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub architecture_id: String,
    pub workload_id: String,
    pub key: String,
    pub state: JobState,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub search_status: Option<String>,
    pub eval_status: Option<String>,
    pub invocations: u32,
    pub mapping_source: Option<MappingSource>,
    pub mapping: Option<StoredMapping>,
    pub output_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobOutcome {
    fn pending(job: &JobDescriptor) -> Self {
        Self {
            architecture_id: job.architecture_id.clone(),
            workload_id: job.workload_id.clone(),
            key: job.key.clone(),
            state: JobState::Pending,
            error_kind: None,
            error: None,
            search_status: None,
            eval_status: None,
            invocations: 0,
            mapping_source: None,
            mapping: None,
            output_dir: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Done
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.architecture_id, self.workload_id)
    }
}

/// Search, store, then evaluate with the stored mapping, for one job.
pub struct StagePipeline<'a, E: Evaluator + ?Sized> {
    evaluator: &'a E,
    cache: &'a MappingCache,
    layout: &'a WorkDirLayout,
    mapping_artifact: &'a Path,
    reuse_cached_mappings: bool,
}

impl<'a, E: Evaluator + ?Sized> StagePipeline<'a, E> {
    pub fn new(
        evaluator: &'a E,
        cache: &'a MappingCache,
        layout: &'a WorkDirLayout,
        mapping_artifact: &'a Path,
    ) -> Self {
        Self {
            evaluator,
            cache,
            layout,
            mapping_artifact,
            reuse_cached_mappings: false,
        }
    }

    pub fn reuse_cached_mappings(mut self, enabled: bool) -> Self {
        self.reuse_cached_mappings = enabled;
        self
    }

    /// Never fails: stage errors end up in the returned outcome.
    pub fn run(&self, job: &JobDescriptor) -> JobOutcome {
        let mut outcome = JobOutcome::pending(job);
        if let Err(err) = self.run_stages(job, &mut outcome) {
            if !outcome.state.is_terminal() {
                outcome.state = match outcome.state {
                    JobState::Evaluating => JobState::EvalFailed,
                    _ => JobState::SearchFailed,
                };
            }
            warn!(
                job = %job.label(),
                state = outcome.state.as_str(),
                error = %err,
                "job failed"
            );
            outcome.error_kind = Some(err.kind().to_string());
            outcome.error = Some(err.to_string());
        }
        outcome.finished_at = Some(Utc::now());
        if let Some(dir) = outcome.output_dir.as_ref().filter(|d| d.is_dir()) {
            let status_path = dir.join(JOB_STATUS_FILE);
            let written = serde_json::to_value(&outcome)
                .map_err(anyhow::Error::from)
                .and_then(|v| atomic_write_json_pretty(&status_path, &v));
            if let Err(e) = written {
                warn!(path = %status_path.display(), error = %e, "failed to write job status");
            }
        }
        outcome
    }

    fn run_stages(&self, job: &JobDescriptor, outcome: &mut JobOutcome) -> Result<(), JobError> {
        let cached = if self.reuse_cached_mappings {
            self.cache.lookup(&job.architecture_id, &job.key)?
        } else {
            None
        };
        let mapping = match cached {
            Some(mapping) => {
                info!(job = %job.label(), path = %mapping.path.display(), "reusing stored mapping");
                outcome.mapping_source = Some(MappingSource::Cached);
                mapping
            }
            None => {
                let mapping = self.search(job, outcome)?;
                outcome.mapping_source = Some(MappingSource::Searched);
                mapping
            }
        };
        outcome.state = JobState::MappingFound;
        outcome.mapping = Some(mapping.clone());

        self.evaluate(job, &mapping, outcome)
    }

    fn search(&self, job: &JobDescriptor, outcome: &mut JobOutcome) -> Result<StoredMapping, JobError> {
        outcome.state = JobState::Searching;
        info!(job = %job.label(), "searching for mapping");
        let transient = TransientDir::create(self.layout.search_dir(job))?;

        let status = self.evaluator.invoke(&Invocation {
            mode: Mode::Search,
            job,
            policy_or_mapping: &job.bundle.mapper_policy,
            output_dir: &transient.path,
        })?;
        outcome.invocations += 1;
        outcome.search_status = Some(status.describe());

        // The artifact decides, not the exit code, as long as the process
        // finished by itself.
        let artifact = transient.path.join(self.mapping_artifact);
        if !status.completed() || !artifact.is_file() {
            outcome.state = JobState::SearchFailed;
            let mut reason = format!(
                "{} not produced (evaluator {})",
                self.mapping_artifact.display(),
                status.describe()
            );
            if let Some(tail) = self
                .evaluator
                .log_file()
                .and_then(|log| log_tail(&transient.path, log))
            {
                reason.push_str(&format!("; last output: {}", tail));
            }
            return Err(JobError::SearchFailure { reason });
        }
        if !status.success() {
            warn!(
                job = %job.label(),
                status = %status.describe(),
                "search exited nonzero but produced a mapping; keeping it"
            );
        }

        let stored = self.cache.store(&job.architecture_id, &job.key, &artifact)?;
        info!(
            job = %job.label(),
            path = %stored.path.display(),
            sha256 = %stored.sha256,
            "stored mapping"
        );
        drop(transient);
        Ok(stored)
    }

    fn evaluate(
        &self,
        job: &JobDescriptor,
        mapping: &StoredMapping,
        outcome: &mut JobOutcome,
    ) -> Result<(), JobError> {
        outcome.state = JobState::Evaluating;
        let final_dir = self.layout.final_dir(job);
        ensure_dir(&final_dir)?;
        outcome.output_dir = Some(final_dir.clone());
        info!(job = %job.label(), output = %final_dir.display(), "evaluating fixed mapping");

        let status = self.evaluator.invoke(&Invocation {
            mode: Mode::FixedMapping,
            job,
            policy_or_mapping: &mapping.path,
            output_dir: &final_dir,
        })?;
        outcome.invocations += 1;
        outcome.eval_status = Some(status.describe());

        if status.success() {
            outcome.state = JobState::Done;
            info!(job = %job.label(), "job done");
            Ok(())
        } else {
            outcome.state = JobState::EvalFailed;
            Err(JobError::EvaluationFailure {
                reason: format!("evaluator {}", status.describe()),
            })
        }
    }
}
