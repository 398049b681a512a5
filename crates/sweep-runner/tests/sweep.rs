use anyhow::Result;
use chrono::Utc;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_runner::spec::{ArchitectureSpec, EvaluatorSpec, WorkloadSpec, SWEEP_SPEC_SCHEMA};
use sweep_runner::{
    run_sweep, run_sweep_file, Evaluator, Invocation, InvocationStatus, JobState, Mode,
    NamingPolicy, SweepOptions, SweepSpec, REPORT_FILE,
};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sweep_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

fn write_inputs(root: &Path, workloads: &[&str]) {
    for name in [
        "arch.yaml",
        "dataflow.yaml",
        "sparse-opt.yaml",
        "mapper.yaml",
        "ERT.yaml",
        "ART.yaml",
    ] {
        fs::write(root.join(name), b"{}\n").unwrap();
    }
    fs::create_dir_all(root.join("workload")).unwrap();
    for w in workloads {
        fs::write(root.join("workload").join(format!("{}.yaml", w)), b"{}\n").unwrap();
    }
}

fn spec(root: &Path, workloads: &[&str]) -> SweepSpec {
    write_inputs(root, workloads);
    SweepSpec {
        schema_version: SWEEP_SPEC_SCHEMA.to_string(),
        output_root: root.join("outputs"),
        mapping_root: Some(root.join("mappings")),
        reuse_cached_mappings: false,
        evaluator: EvaluatorSpec {
            command: vec!["unused".to_string()],
            fixed_mapping_command: None,
            output_flag: "-o".to_string(),
            mapping_artifact: PathBuf::from("timeloop-mapper.map.yaml"),
            log_file: "evaluator.log".to_string(),
            timeout_seconds: None,
        },
        workloads: WorkloadSpec {
            dir: root.join("workload"),
            extension: ".yaml".to_string(),
            ids: workloads.iter().map(|s| s.to_string()).collect(),
        },
        architectures: vec![ArchitectureSpec {
            id: "A".to_string(),
            architecture: root.join("arch.yaml"),
            dataflow: root.join("dataflow.yaml"),
            sparse_opt: root.join("sparse-opt.yaml"),
            mapper_policy: root.join("mapper.yaml"),
            cost_models: [root.join("ERT.yaml"), root.join("ART.yaml")],
            naming: NamingPolicy::Identity,
        }],
    }
}

/// Writes `mapping` on search unless the workload is in `fail_search`, and
/// fails fixed-mapping evaluation for workloads in `fail_eval`.
struct StubEvaluator {
    mapping: Vec<u8>,
    fail_search: Vec<String>,
    fail_eval: Vec<String>,
    calls: RefCell<Vec<(String, Mode)>>,
}

impl StubEvaluator {
    fn new(mapping: &[u8]) -> Self {
        Self {
            mapping: mapping.to_vec(),
            fail_search: Vec::new(),
            fail_eval: Vec::new(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn calls_for(&self, workload: &str) -> Vec<Mode> {
        self.calls
            .borrow()
            .iter()
            .filter(|(w, _)| w == workload)
            .map(|(_, m)| *m)
            .collect()
    }
}

impl Evaluator for StubEvaluator {
    fn invoke(&self, inv: &Invocation<'_>) -> Result<InvocationStatus> {
        let workload = inv.job.workload_id.clone();
        self.calls.borrow_mut().push((workload.clone(), inv.mode));
        match inv.mode {
            Mode::Search if self.fail_search.contains(&workload) => Ok(InvocationStatus::Exited(1)),
            Mode::Search => {
                fs::write(inv.output_dir.join("timeloop-mapper.map.yaml"), &self.mapping)?;
                Ok(InvocationStatus::Exited(0))
            }
            Mode::FixedMapping if self.fail_eval.contains(&workload) => Ok(InvocationStatus::Exited(2)),
            Mode::FixedMapping => {
                assert_eq!(fs::read(inv.policy_or_mapping)?, self.mapping);
                fs::write(inv.output_dir.join("timeloop-model.stats.txt"), b"ok")?;
                Ok(InvocationStatus::Exited(0))
            }
        }
    }
}

fn state_of(report: &sweep_runner::SweepReport, workload: &str) -> JobState {
    report
        .jobs
        .iter()
        .find(|j| j.workload_id == workload)
        .map(|j| j.state)
        .expect("job present in report")
}

#[test]
fn all_jobs_done_store_identical_mappings() {
    let root = scratch_dir("all_done");
    let spec = spec(&root, &["w1", "w2"]);
    let ev = StubEvaluator::new(b"b1");
    let report = run_sweep(&spec, &ev, &SweepOptions::default()).expect("sweep");

    assert_eq!(fs::read(root.join("mappings/A/w1.map")).unwrap(), b"b1");
    assert_eq!(fs::read(root.join("mappings/A/w2.map")).unwrap(), b"b1");
    assert_eq!(state_of(&report, "w1"), JobState::Done);
    assert_eq!(state_of(&report, "w2"), JobState::Done);
    for name in ["A_w1", "A_w2"] {
        let status: serde_json::Value = serde_json::from_slice(
            &fs::read(root.join("outputs").join(name).join("job_status.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(status["state"], "done");
    }
    assert!(report.all_succeeded());
    assert!(!root.join("outputs/.search").exists());
    assert!(root.join("outputs").join(REPORT_FILE).exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn search_failure_is_isolated_to_its_job() {
    let root = scratch_dir("search_fail");
    let spec = spec(&root, &["w1", "w2", "w3"]);
    let mut ev = StubEvaluator::new(b"b1");
    ev.fail_search.push("w2".to_string());
    let report = run_sweep(&spec, &ev, &SweepOptions::default()).expect("sweep");

    assert!(root.join("mappings/A/w1.map").exists());
    assert!(!root.join("mappings/A/w2.map").exists());
    assert_eq!(state_of(&report, "w1"), JobState::Done);
    assert_eq!(state_of(&report, "w2"), JobState::SearchFailed);
    assert_eq!(state_of(&report, "w3"), JobState::Done);
    assert_eq!(ev.calls_for("w2"), vec![Mode::Search]);
    assert!(!root.join("outputs/A_w2").exists());
    assert!(!root.join("outputs/.search").exists());
    assert_eq!(report.counts.search_failed, 1);
    assert!(!report.all_succeeded());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn evaluation_failure_keeps_outputs_and_continues() {
    let root = scratch_dir("eval_fail");
    let spec = spec(&root, &["w1", "w2"]);
    let mut ev = StubEvaluator::new(b"b1");
    ev.fail_eval.push("w1".to_string());
    let report = run_sweep(&spec, &ev, &SweepOptions::default()).expect("sweep");

    assert_eq!(state_of(&report, "w1"), JobState::EvalFailed);
    assert_eq!(state_of(&report, "w2"), JobState::Done);
    assert!(root.join("outputs/A_w1/job_status.json").exists());
    assert!(root.join("mappings/A/w1.map").exists());
    assert_eq!(report.counts.eval_failed, 1);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn rerunning_overwrites_store_with_same_content() {
    let root = scratch_dir("idempotent");
    let spec = spec(&root, &["w1"]);
    let ev = StubEvaluator::new(b"mapping M");
    run_sweep(&spec, &ev, &SweepOptions::default()).expect("first sweep");
    let first = fs::read(root.join("mappings/A/w1.map")).unwrap();
    run_sweep(&spec, &ev, &SweepOptions::default()).expect("second sweep");
    let second = fs::read(root.join("mappings/A/w1.map")).unwrap();
    assert_eq!(first, b"mapping M");
    assert_eq!(first, second);
    assert_eq!(ev.calls_for("w1"), vec![Mode::Search, Mode::FixedMapping, Mode::Search, Mode::FixedMapping]);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn missing_architecture_file_is_reported_not_fatal() {
    let root = scratch_dir("missing_cfg");
    let mut spec = spec(&root, &["w1"]);
    let mut broken = spec.architectures[0].clone();
    broken.id = "B".to_string();
    broken.dataflow = root.join("absent-dataflow.yaml");
    spec.architectures.insert(0, broken);
    let ev = StubEvaluator::new(b"b1");
    let report = run_sweep(&spec, &ev, &SweepOptions::default()).expect("sweep");

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].architecture_id, "B");
    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].state, JobState::Done);
    assert!(!report.all_succeeded());
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn spec_file_drives_a_real_evaluator_process() {
    use std::os::unix::fs::PermissionsExt;

    let root = scratch_dir("process");
    write_inputs(&root, &["conv1_structured", "conv2"]);
    fs::rename(
        root.join("workload/conv2.yaml"),
        root.join("workload/conv2_structured.yaml"),
    )
    .unwrap();

    // Search mode gets mapper.yaml in slot 5 and writes a mapping; fixed
    // mapping mode gets the stored .map file and copies it as its result.
    let script = root.join("fake-evaluator.sh");
    fs::write(
        &script,
        "#!/bin/sh\n\
         out=\"$9\"\n\
         case \"$5\" in\n\
           *.map) cp \"$5\" \"$out/evaluated.map\" ;;\n\
           *) case \"$4\" in *conv2*) echo 'no mapping found' >&2; exit 1 ;; esac\n\
              echo \"mapping for $4\" > \"$out/timeloop-mapper.map.yaml\" ;;\n\
         esac\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let spec_path = root.join("sweep.yaml");
    fs::write(
        &spec_path,
        "schema_version: sweep_spec_v1\n\
         output_root: outputs\n\
         evaluator:\n\
         \x20 command: [./fake-evaluator.sh]\n\
         \x20 timeout_seconds: 60\n\
         workloads:\n\
         \x20 dir: workload\n\
         \x20 ids: [conv1_structured, conv2_structured]\n\
         architectures:\n\
         \x20 - id: DSTC\n\
         \x20   architecture: arch.yaml\n\
         \x20   dataflow: dataflow.yaml\n\
         \x20   sparse_opt: sparse-opt.yaml\n\
         \x20   mapper_policy: mapper.yaml\n\
         \x20   cost_models: [ERT.yaml, ART.yaml]\n\
         \x20   naming:\n\
         \x20     strip_suffix: _structured\n",
    )
    .unwrap();

    let report = run_sweep_file(&spec_path, &SweepOptions::default()).expect("sweep");

    let canonical = root.canonicalize().unwrap();
    let stored = canonical.join("outputs/mappings/DSTC/conv1.map");
    let content = fs::read_to_string(&stored).unwrap();
    assert!(content.contains("conv1_structured.yaml"), "{}", content);
    assert_eq!(
        fs::read(canonical.join("outputs/DSTC_conv1/evaluated.map")).unwrap(),
        content.as_bytes()
    );
    assert_eq!(state_of(&report, "conv1_structured"), JobState::Done);
    assert_eq!(state_of(&report, "conv2_structured"), JobState::SearchFailed);
    let failed = report
        .jobs
        .iter()
        .find(|j| j.workload_id == "conv2_structured")
        .unwrap();
    assert!(
        failed.error.as_deref().unwrap_or("").contains("no mapping found"),
        "{:?}",
        failed.error
    );
    assert!(!canonical.join("outputs/mappings/DSTC/conv2.map").exists());
    assert!(!canonical.join("outputs/DSTC_conv2").exists());
    assert!(!canonical.join("outputs/.search").exists());
    let log = fs::read_to_string(canonical.join("outputs/DSTC_conv1/evaluator.log")).unwrap();
    assert!(log.contains("DSTC/conv1.map "), "{}", log);
    assert!(log.contains(" -o "), "{}", log);
    let _ = fs::remove_dir_all(root);
}
