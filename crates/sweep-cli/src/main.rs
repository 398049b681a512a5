use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use sweep_runner::{JobOutcome, MappingCache, SweepOptions, SweepReport, WorkDirLayout};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sweep", version, about = "Two-stage mapping sweep runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search, store and evaluate every (architecture, workload) job.
    Run {
        spec: PathBuf,
        /// Evaluate an already stored mapping instead of searching again.
        #[arg(long)]
        reuse_mappings: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved jobs and skipped configurations without running.
    Describe {
        spec: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List the mappings held in the store.
    Mappings {
        spec: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn ok(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sweep_runner=info,sweep=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            spec,
            reuse_mappings,
            json,
        } => {
            let options = SweepOptions {
                reuse_cached_mappings: reuse_mappings.then_some(true),
                cancel: None,
            };
            let report = sweep_runner::run_sweep_file(&spec, &options)?;
            let exit_code = if report.all_succeeded() { 0 } else { 1 };
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": exit_code == 0,
                        "command": "run",
                        "report": serde_json::to_value(&report)?,
                    })),
                    exit_code,
                });
            }
            print_report(&report);
            Ok(CommandOutput {
                payload: None,
                exit_code,
            })
        }
        Commands::Describe { spec, json } => {
            let spec = sweep_runner::load_sweep_spec(&spec)?;
            let plan = sweep_runner::build_jobs(&spec);
            let layout = WorkDirLayout::new(&spec.output_root);
            let cache = MappingCache::new(spec.mapping_root());
            let jobs: Vec<Value> = plan
                .jobs
                .iter()
                .map(|job| {
                    json!({
                        "architecture": job.architecture_id,
                        "workload": job.workload_id,
                        "key": job.key,
                        "workload_file": job.workload.display().to_string(),
                        "mapping_store": cache.entry_path(&job.architecture_id, &job.key).display().to_string(),
                        "output_dir": layout.final_dir(job).display().to_string(),
                    })
                })
                .collect();
            if json {
                return Ok(CommandOutput::ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "evaluator": spec.evaluator.command,
                    "output_root": spec.output_root.display().to_string(),
                    "mapping_root": cache.root().display().to_string(),
                    "jobs": jobs,
                    "skipped": serde_json::to_value(&plan.skipped)?,
                }))));
            }
            println!("evaluator: {:?}", spec.evaluator.command);
            println!("output_root: {}", spec.output_root.display());
            println!("mapping_root: {}", cache.root().display());
            println!("mapping_artifact: {}", spec.evaluator.mapping_artifact.display());
            println!("reuse_cached_mappings: {}", spec.reuse_cached_mappings);
            println!("jobs: {}", plan.jobs.len());
            for job in &plan.jobs {
                println!(
                    "  {} -> {}",
                    job.label(),
                    layout.final_dir(job).display()
                );
            }
            print_skipped(&plan.skipped);
            Ok(CommandOutput::ok(None))
        }
        Commands::Mappings { spec, json } => {
            let spec = sweep_runner::load_sweep_spec(&spec)?;
            let cache = MappingCache::new(spec.mapping_root());
            let entries = cache.list()?;
            if json {
                return Ok(CommandOutput::ok(Some(json!({
                    "ok": true,
                    "command": "mappings",
                    "mapping_root": cache.root().display().to_string(),
                    "mappings": serde_json::to_value(&entries)?,
                }))));
            }
            println!("mapping_root: {}", cache.root().display());
            for entry in &entries {
                println!(
                    "{}/{}  {} bytes  sha256:{}",
                    entry.architecture_id, entry.key, entry.size_bytes, entry.sha256
                );
            }
            if entries.is_empty() {
                println!("no stored mappings");
            }
            Ok(CommandOutput::ok(None))
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"json_encode_failed\",\"message\":\"failed to encode output\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } => *json,
        Commands::Describe { json, .. } => *json,
        Commands::Mappings { json, .. } => *json,
    }
}

fn print_report(report: &SweepReport) {
    println!("sweep_id: {}", report.sweep_id);
    println!("output_root: {}", report.output_root.display());
    println!("mapping_root: {}", report.mapping_root.display());
    for job in &report.jobs {
        print_job(job);
    }
    print_skipped(&report.skipped);
    for job in &report.not_started {
        println!("  {}/{}: not_started", job.architecture_id, job.workload_id);
    }
    let c = &report.counts;
    println!(
        "done: {}  search_failed: {}  eval_failed: {}  skipped: {}  not_started: {}",
        c.done, c.search_failed, c.eval_failed, c.skipped, c.not_started
    );
    if report.cancelled {
        println!("cancelled: true");
    }
    println!(
        "report: {}",
        report.output_root.join(sweep_runner::REPORT_FILE).display()
    );
}

fn print_job(job: &JobOutcome) {
    match &job.error {
        Some(error) => println!("  {}: {} ({})", job.label(), job.state.as_str(), error),
        None => println!("  {}: {}", job.label(), job.state.as_str()),
    }
}

fn print_skipped(skipped: &[sweep_runner::SkippedConfig]) {
    for entry in skipped {
        let scope = match &entry.workload_id {
            Some(w) => format!("{}/{}", entry.architecture_id, w),
            None => entry.architecture_id.clone(),
        };
        println!("  {}: skipped ({})", scope, entry.message);
    }
}
