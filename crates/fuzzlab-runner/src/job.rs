use crate::process::{ExitInfo, Launcher, TrialProcess};
use anyhow::{anyhow, Result};
use chrono::Utc;
use fuzzlab_core::{
    ensure_dir, reset_dir, CancelToken, JobStatus, LaunchError, TrialKey, TrialState,
};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Directories owned by one trial: `<data_dir>/trial_<i>/<target>/<fuzzer>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPaths {
    pub root: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

impl TrialPaths {
    pub fn new(data_dir: &Path, key: &TrialKey) -> Self {
        let root = data_dir
            .join(format!("trial_{}", key.trial))
            .join(&key.target)
            .join(&key.fuzzer);
        Self {
            input: root.join("input"),
            output: root.join("output"),
            log: root.join("fuzz.log"),
            root,
        }
    }

    /// Recreates the trial directory empty. Leftovers from an earlier run of
    /// the same trial are discarded.
    pub fn prepare(&self) -> Result<()> {
        reset_dir(&self.root)?;
        ensure_dir(&self.input)?;
        ensure_dir(&self.output)?;
        Ok(())
    }
}

/// Everything a launcher needs to start one trial. Built once per trial and
/// never mutated.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub key: TrialKey,
    pub cpu: usize,
    pub timeout: Duration,
    pub paths: TrialPaths,
    /// Unique per invocation; used as the container name.
    pub name: String,
}

impl LaunchConfig {
    /// Timeout in seconds as handed to the unit in `FUZZ_TIMEOUT`.
    pub fn timeout_arg(&self) -> String {
        let secs = self.timeout.as_secs_f64();
        if secs.fract() == 0.0 {
            format!("{}", self.timeout.as_secs())
        } else {
            format!("{}", secs)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Supervision {
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for Supervision {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            poll: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub key: TrialKey,
    pub status: JobStatus,
    pub cpu: usize,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub launched: bool,
    pub terminated: bool,
}

fn can_advance(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Pending => matches!(
            to,
            JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
        ),
        JobStatus::Running => to.is_terminal(),
        _ => false,
    }
}

/// Writes `trial_state.json`; records `failed` if dropped before completion.
struct TrialStateGuard {
    dir: PathBuf,
    state: TrialState,
    done: bool,
}

impl TrialStateGuard {
    fn start(dir: &Path, key: &TrialKey, cpu: usize) -> Result<Self> {
        let mut state = TrialState::new(key, JobStatus::Running);
        state.cpu = Some(cpu);
        state.started_at = Some(Utc::now());
        state.store(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state,
            done: false,
        })
    }

    fn complete(&mut self, status: JobStatus, exit_code: Option<i32>, error: Option<&str>) {
        self.state.status = status;
        self.state.exit_code = exit_code;
        self.state.error = error.map(str::to_string);
        self.state.finished_at = Some(Utc::now());
        if let Err(err) = self.state.store(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "failed to write trial state");
        }
        self.done = true;
    }
}

impl Drop for TrialStateGuard {
    fn drop(&mut self) {
        if !self.done {
            self.state.status = JobStatus::Failed;
            self.state.error = Some("aborted".to_string());
            self.state.finished_at = Some(Utc::now());
            let _ = self.state.store(&self.dir);
        }
    }
}

/// One (target, fuzzer, trial) bound to its directories, core and timeout.
///
/// Moves `pending -> running -> {completed | timed_out | failed | cancelled}`.
/// A unit that never gets to run goes straight from `pending` to `failed` or
/// `cancelled`.
pub struct JobUnit {
    config: LaunchConfig,
    status: JobStatus,
    started: Option<Instant>,
    exit_code: Option<i32>,
    error: Option<String>,
    launched: bool,
    terminated: bool,
}

impl JobUnit {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            status: JobStatus::Pending,
            started: None,
            exit_code: None,
            error: None,
            launched: false,
            terminated: false,
        }
    }

    pub fn key(&self) -> &TrialKey {
        &self.config.key
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    fn advance(&mut self, next: JobStatus) -> Result<()> {
        if !can_advance(self.status, next) {
            return Err(anyhow!(
                "{}: illegal transition {} -> {}",
                self.config.key,
                self.status.as_str(),
                next.as_str()
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Runs the unit to a terminal status. Never returns an error: every
    /// failure mode is folded into the outcome.
    pub fn run(
        mut self,
        launcher: &dyn Launcher,
        supervision: &Supervision,
        cancel: &CancelToken,
    ) -> JobOutcome {
        if let Err(err) = self.execute(launcher, supervision, cancel) {
            tracing::warn!(trial = %self.config.key, error = %err, "trial failed");
            if !self.status.is_terminal() {
                self.status = JobStatus::Failed;
            }
            self.error.get_or_insert_with(|| err.to_string());
        }
        JobOutcome {
            key: self.config.key.clone(),
            status: self.status,
            cpu: self.config.cpu,
            exit_code: self.exit_code,
            error: self.error.take(),
            elapsed: self.started.map(|s| s.elapsed()).unwrap_or_default(),
            launched: self.launched,
            terminated: self.terminated,
        }
    }

    fn execute(
        &mut self,
        launcher: &dyn Launcher,
        supervision: &Supervision,
        cancel: &CancelToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return self.advance(JobStatus::Cancelled);
        }
        if let Err(err) = self.config.paths.prepare() {
            self.advance(JobStatus::Failed)?;
            self.error = Some(LaunchError::Prepare(format!("{:#}", err)).to_string());
            self.record_unprepared();
            return Ok(());
        }

        let mut guard =
            TrialStateGuard::start(&self.config.paths.root, &self.config.key, self.config.cpu)?;
        self.advance(JobStatus::Running)?;
        self.started = Some(Instant::now());
        tracing::info!(trial = %self.config.key, cpu = self.config.cpu, "trial started");

        let mut process = match launcher.launch(&self.config) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(trial = %self.config.key, error = %err, "launch failed");
                self.error = Some(err.to_string());
                self.advance(JobStatus::Failed)?;
                guard.complete(self.status, None, self.error.as_deref());
                return Ok(());
            }
        };
        self.launched = true;

        let (status, exit) = self.supervise(process.as_mut(), supervision, cancel);
        self.exit_code = exit.and_then(|e| e.code);
        if status == JobStatus::Failed && self.error.is_none() {
            self.error = Some(describe_exit(exit));
        }
        self.advance(status)?;
        guard.complete(self.status, self.exit_code, self.error.as_deref());
        tracing::info!(
            trial = %self.config.key,
            status = self.status.as_str(),
            elapsed_secs = self.started.map(|s| s.elapsed().as_secs_f64()).unwrap_or_default(),
            "trial finished"
        );
        Ok(())
    }

    fn supervise(
        &mut self,
        process: &mut dyn TrialProcess,
        supervision: &Supervision,
        cancel: &CancelToken,
    ) -> (JobStatus, Option<ExitInfo>) {
        // A timeout too large to represent is no deadline at all.
        let deadline = Instant::now().checked_add(self.config.timeout);
        loop {
            match process.try_wait() {
                Ok(Some(exit)) => {
                    self.reap_group(process, supervision, cancel);
                    let status = if exit.success() {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    return (status, Some(exit));
                }
                Ok(None) => {}
                Err(err) => {
                    self.error = Some(format!("wait: {}", err));
                    return (JobStatus::Failed, self.terminate(process, supervision, cancel));
                }
            }
            if cancel.is_cancelled() {
                tracing::warn!(trial = %self.config.key, "cancelled, terminating process group");
                return (JobStatus::Cancelled, self.terminate(process, supervision, cancel));
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                tracing::info!(trial = %self.config.key, "timeout reached, terminating process group");
                return (JobStatus::TimedOut, self.terminate(process, supervision, cancel));
            }
            thread::sleep(remaining.map_or(supervision.poll, |r| supervision.poll.min(r)));
        }
    }

    /// The leader is gone; the core is only free once the rest of its tree is.
    fn reap_group(
        &mut self,
        process: &mut dyn TrialProcess,
        supervision: &Supervision,
        cancel: &CancelToken,
    ) {
        match process.reap_group(supervision.grace, cancel) {
            Ok(true) => self.terminated = true,
            Ok(false) => {}
            Err(err) => tracing::warn!(
                trial = %self.config.key,
                pid = process.id(),
                error = %err,
                "failed to reap process group"
            ),
        }
    }

    fn terminate(
        &mut self,
        process: &mut dyn TrialProcess,
        supervision: &Supervision,
        cancel: &CancelToken,
    ) -> Option<ExitInfo> {
        self.terminated = true;
        match process.terminate_tree(supervision.grace, cancel) {
            Ok(exit) => Some(exit),
            Err(err) => {
                tracing::warn!(
                    trial = %self.config.key,
                    pid = process.id(),
                    error = %err,
                    "terminate failed"
                );
                None
            }
        }
    }

    /// Leaves a failed `trial_state.json` behind when the trial directory
    /// exists but its layout could not be built.
    fn record_unprepared(&self) {
        let dir = &self.config.paths.root;
        if !dir.is_dir() {
            return;
        }
        let mut state = TrialState::new(&self.config.key, JobStatus::Failed);
        state.cpu = Some(self.config.cpu);
        state.finished_at = Some(Utc::now());
        state.error = self.error.clone();
        if let Err(err) = state.store(dir) {
            tracing::warn!(dir = %dir.display(), error = %err, "failed to write trial state");
        }
    }
}

fn describe_exit(exit: Option<ExitInfo>) -> String {
    match exit {
        Some(ExitInfo {
            code: Some(code), ..
        }) => format!("exited with status {}", code),
        Some(ExitInfo {
            signal: Some(signal),
            ..
        }) => format!("killed by signal {}", signal),
        _ => "exited abnormally".to_string(),
    }
}
