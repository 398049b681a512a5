use crate::error::JobError;
use crate::spec::{ArchitectureSpec, SweepSpec};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// The fixed configuration files describing one architecture design point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigBundle {
    pub architecture: PathBuf,
    pub dataflow: PathBuf,
    pub sparse_opt: PathBuf,
    pub mapper_policy: PathBuf,
    pub cost_models: [PathBuf; 2],
}

impl ConfigBundle {
    fn from_spec(arch: &ArchitectureSpec) -> Self {
        Self {
            architecture: arch.architecture.clone(),
            dataflow: arch.dataflow.clone(),
            sparse_opt: arch.sparse_opt.clone(),
            mapper_policy: arch.mapper_policy.clone(),
            cost_models: arch.cost_models.clone(),
        }
    }

    fn files(&self) -> [(&'static str, &Path); 6] {
        [
            ("architecture", self.architecture.as_path()),
            ("dataflow", self.dataflow.as_path()),
            ("sparse_opt", self.sparse_opt.as_path()),
            ("mapper_policy", self.mapper_policy.as_path()),
            ("cost_model", self.cost_models[0].as_path()),
            ("cost_model", self.cost_models[1].as_path()),
        ]
    }

    fn first_missing(&self) -> Option<JobError> {
        self.files()
            .into_iter()
            .find(|(_, path)| !path.is_file())
            .map(|(role, path)| JobError::ConfigurationMissing {
                role,
                path: path.to_path_buf(),
            })
    }
}

/// One (architecture, workload) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub architecture_id: String,
    pub workload_id: String,
    pub key: String,
    pub workload: PathBuf,
    pub bundle: ConfigBundle,
}

impl JobDescriptor {
    /// Evaluator input files in the order the process expects them, with
    /// `policy_or_mapping` in the mapper slot.
    pub fn evaluator_inputs<'a>(&'a self, policy_or_mapping: &'a Path) -> [&'a Path; 7] {
        [
            self.bundle.architecture.as_path(),
            self.bundle.dataflow.as_path(),
            self.bundle.sparse_opt.as_path(),
            self.workload.as_path(),
            policy_or_mapping,
            self.bundle.cost_models[0].as_path(),
            self.bundle.cost_models[1].as_path(),
        ]
    }

    pub fn output_name(&self) -> String {
        output_name(&self.architecture_id, &self.key)
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.architecture_id, self.workload_id)
    }
}

/// Final output directory name for a job. Not injective on its own; sweep
/// validation rejects specs where two jobs share one.
pub fn output_name(architecture_id: &str, key: &str) -> String {
    format!("{}_{}", architecture_id, key)
}

/// A configuration problem found while building jobs. `workload_id` is `None`
/// when the whole architecture was dropped.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedConfig {
    pub architecture_id: String,
    pub workload_id: Option<String>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobPlan {
    pub jobs: Vec<JobDescriptor>,
    pub skipped: Vec<SkippedConfig>,
}

/// Builds jobs architectures-outer, workloads-inner. Missing files skip the
/// affected architecture (or single workload) and are reported in the plan.
pub fn build_jobs(spec: &SweepSpec) -> JobPlan {
    let mut plan = JobPlan::default();
    for arch in &spec.architectures {
        let bundle = ConfigBundle::from_spec(arch);
        if let Some(err) = bundle.first_missing() {
            warn!(architecture = %arch.id, error = %err, "skipping architecture");
            plan.skipped.push(SkippedConfig {
                architecture_id: arch.id.clone(),
                workload_id: None,
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
            continue;
        }
        for workload_id in &spec.workloads.ids {
            let workload = spec
                .workloads
                .dir
                .join(format!("{}{}", workload_id, spec.workloads.extension));
            if !workload.is_file() {
                let err = JobError::ConfigurationMissing {
                    role: "workload",
                    path: workload,
                };
                warn!(architecture = %arch.id, workload = %workload_id, error = %err, "skipping workload");
                plan.skipped.push(SkippedConfig {
                    architecture_id: arch.id.clone(),
                    workload_id: Some(workload_id.clone()),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
                continue;
            }
            plan.jobs.push(JobDescriptor {
                architecture_id: arch.id.clone(),
                workload_id: workload_id.clone(),
                key: arch.naming.key(workload_id),
                workload,
                bundle: bundle.clone(),
            });
        }
    }
    plan
}
