pub mod cache;
pub mod error;
pub mod evaluator;
pub mod job;
pub mod pipeline;
pub mod report;
pub mod spec;
pub mod sweep;

pub use cache::{MappingCache, StoredMapping};
pub use error::JobError;
pub use evaluator::{Evaluator, Invocation, InvocationStatus, Mode, ProcessEvaluator};
pub use job::{build_jobs, ConfigBundle, JobDescriptor, JobPlan, SkippedConfig};
pub use pipeline::{JobOutcome, JobState, MappingSource, StagePipeline, WorkDirLayout};
pub use report::{ReportCounts, SweepReport, REPORT_FILE};
pub use spec::{load_sweep_spec, NamingPolicy, SweepSpec};
pub use sweep::{run_sweep, run_sweep_file, CancelFlag, SweepOptions};
