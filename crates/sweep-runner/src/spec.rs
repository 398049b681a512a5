use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use crate::job::output_name;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const SWEEP_SPEC_SCHEMA: &str = "sweep_spec_v1";

/// A sweep specification: architectures crossed with workloads, plus how to
/// reach the external evaluator. Relative paths are resolved against the
/// directory holding the spec file by [`load_sweep_spec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSpec {
    pub schema_version: String,
    pub output_root: PathBuf,
    #[serde(default)]
    pub mapping_root: Option<PathBuf>,
    #[serde(default)]
    pub reuse_cached_mappings: bool,
    pub evaluator: EvaluatorSpec,
    pub workloads: WorkloadSpec,
    pub architectures: Vec<ArchitectureSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub fixed_mapping_command: Option<Vec<String>>,
    #[serde(default = "default_output_flag")]
    pub output_flag: String,
    /// Where search mode leaves its mapping, relative to the output directory.
    #[serde(default = "default_mapping_artifact")]
    pub mapping_artifact: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub dir: PathBuf,
    #[serde(default = "default_workload_extension")]
    pub extension: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub id: String,
    pub architecture: PathBuf,
    pub dataflow: PathBuf,
    pub sparse_opt: PathBuf,
    pub mapper_policy: PathBuf,
    pub cost_models: [PathBuf; 2],
    /// Written as `identity` or `{ strip_suffix: <suffix> }`.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub naming: NamingPolicy,
}

/// Maps a raw workload id (which names the input file) to the key used for
/// the mapping store and the final output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    #[default]
    Identity,
    StripSuffix(String),
}

impl NamingPolicy {
    pub fn key(&self, workload_id: &str) -> String {
        match self {
            NamingPolicy::Identity => workload_id.to_string(),
            NamingPolicy::StripSuffix(suffix) => workload_id
                .strip_suffix(suffix.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(workload_id)
                .to_string(),
        }
    }
}

fn default_output_flag() -> String {
    "-o".to_string()
}

fn default_mapping_artifact() -> PathBuf {
    PathBuf::from("timeloop-mapper.map.yaml")
}

fn default_log_file() -> String {
    "evaluator.log".to_string()
}

fn default_workload_extension() -> String {
    ".yaml".to_string()
}

impl SweepSpec {
    pub fn mapping_root(&self) -> PathBuf {
        self.mapping_root
            .clone()
            .unwrap_or_else(|| self.output_root.join("mappings"))
    }

    /// Joins every relative path onto `base_dir`. Absolute paths are kept.
    pub fn resolve_paths(mut self, base_dir: &Path) -> Self {
        let join = |p: &PathBuf| -> PathBuf {
            if p.is_absolute() {
                p.clone()
            } else {
                base_dir.join(p)
            }
        };
        resolve_command(&mut self.evaluator.command, base_dir);
        if let Some(cmd) = self.evaluator.fixed_mapping_command.as_mut() {
            resolve_command(cmd, base_dir);
        }
        self.output_root = join(&self.output_root);
        self.mapping_root = self.mapping_root.as_ref().map(join);
        self.workloads.dir = join(&self.workloads.dir);
        for arch in self.architectures.iter_mut() {
            arch.architecture = join(&arch.architecture);
            arch.dataflow = join(&arch.dataflow);
            arch.sparse_opt = join(&arch.sparse_opt);
            arch.mapper_policy = join(&arch.mapper_policy);
            arch.cost_models = [join(&arch.cost_models[0]), join(&arch.cost_models[1])];
        }
        self
    }

    /// Structural checks only. Missing configuration files are not an error
    /// here; they skip the affected architecture when jobs are built.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.schema_version != SWEEP_SPEC_SCHEMA {
            problems.push(format!(
                "schema_version must be {} (found: {})",
                SWEEP_SPEC_SCHEMA, self.schema_version
            ));
        }
        if self.evaluator.command.is_empty() {
            problems.push("evaluator.command must not be empty".to_string());
        }
        if matches!(&self.evaluator.fixed_mapping_command, Some(c) if c.is_empty()) {
            problems.push("evaluator.fixed_mapping_command must not be empty".to_string());
        }
        let artifact = &self.evaluator.mapping_artifact;
        if artifact.as_os_str().is_empty()
            || artifact.is_absolute()
            || artifact.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            problems.push(
                "evaluator.mapping_artifact must be a relative path inside the output directory"
                    .to_string(),
            );
        }
        if self.architectures.is_empty() {
            problems.push("architectures must not be empty".to_string());
        }
        if self.workloads.ids.is_empty() {
            problems.push("workloads.ids must not be empty".to_string());
        }

        let mut arch_ids = BTreeSet::new();
        let mut output_dirs: BTreeMap<String, String> = BTreeMap::new();
        for arch in &self.architectures {
            if !is_safe_name(&arch.id) {
                problems.push(format!("invalid architecture id: '{}'", arch.id));
            }
            if !arch_ids.insert(arch.id.as_str()) {
                problems.push(format!("duplicate architecture id: {}", arch.id));
            }
            let mut keys = BTreeSet::new();
            for workload_id in &self.workloads.ids {
                let key = arch.naming.key(workload_id);
                if !is_safe_name(workload_id) || !is_safe_name(&key) {
                    problems.push(format!("invalid workload id: '{}'", workload_id));
                } else if !keys.insert(key.clone()) {
                    problems.push(format!(
                        "workloads collide on key '{}' under architecture {}",
                        key, arch.id
                    ));
                } else {
                    let label = format!("{}/{}", arch.id, workload_id);
                    let dir = output_name(&arch.id, &key);
                    if let Some(first) = output_dirs.get(&dir) {
                        if !first.starts_with(&format!("{}/", arch.id)) {
                            problems.push(format!(
                                "{} and {} share output directory '{}'",
                                first, label, dir
                            ));
                        }
                    } else {
                        output_dirs.insert(dir, label);
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid sweep spec:\n  {}", problems.join("\n  ")))
        }
    }
}

/// The evaluator runs inside its output directory, so a relative program path
/// must be pinned to the spec directory first. Bare names stay on `PATH`.
fn resolve_command(command: &mut [String], base_dir: &Path) {
    if let Some(program) = command.first_mut() {
        let path = Path::new(program.as_str());
        if command_part_looks_like_path(program) && path.is_relative() {
            *program = base_dir.join(path).to_string_lossy().to_string();
        }
    }
}

fn command_part_looks_like_path(part: &str) -> bool {
    part.starts_with('.') || part.contains('/')
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

pub fn load_sweep_spec(path: &Path) -> Result<SweepSpec> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read sweep spec {}: {}", path.display(), e))?;
    let spec: SweepSpec = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow!("cannot parse sweep spec {}: {}", path.display(), e))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let base_dir = base_dir
        .canonicalize()
        .unwrap_or_else(|_| base_dir.to_path_buf());
    let spec = spec.resolve_paths(&base_dir);
    spec.validate()?;
    Ok(spec)
}
