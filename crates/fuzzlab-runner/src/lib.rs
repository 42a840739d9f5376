//! Trial execution: per-trial job units, process-group handles and the
//! scheduler that runs the target x fuzzer x trial matrix under a core budget.

mod cores;
mod job;
mod process;
mod scheduler;

pub use cores::{AffinityCores, CoreAllocator, CoreLease, CorePool, FixedCores};
pub use job::{JobOutcome, JobUnit, LaunchConfig, Supervision, TrialPaths};
pub use process::{DockerLauncher, ExitInfo, Launcher, LocalLauncher, ProcessGroup, TrialProcess};
pub use scheduler::{RunPlan, RunReport, RunTally, Scheduler};
