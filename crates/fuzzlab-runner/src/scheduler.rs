use crate::cores::{CoreAllocator, CorePool};
use crate::job::{JobOutcome, JobUnit, LaunchConfig, Supervision, TrialPaths};
use crate::process::Launcher;
use anyhow::Result;
use chrono::Utc;
use fuzzlab_core::{ensure_dir, CancelToken, JobStatus, TrialKey, WorkerPool};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub targets: Vec<String>,
    pub fuzzers: Vec<String>,
    pub trials: usize,
    pub timeout: Duration,
    /// 0 runs trials one at a time on the calling thread.
    pub concurrency: usize,
    pub data_dir: PathBuf,
}

impl RunPlan {
    pub fn total(&self) -> usize {
        self.trials * self.targets.len() * self.fuzzers.len()
    }

    /// Every trial key, trial-major: all pairs of trial 0 before trial 1.
    pub fn trial_keys(&self) -> Vec<TrialKey> {
        let mut keys = Vec::with_capacity(self.total());
        for trial in 0..self.trials {
            for target in &self.targets {
                for fuzzer in &self.fuzzers {
                    keys.push(TrialKey::new(target.clone(), fuzzer.clone(), trial));
                }
            }
        }
        keys
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub dispatched: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<JobOutcome>,
    /// Trials never dispatched because the run was cancelled.
    pub skipped: Vec<TrialKey>,
}

impl RunReport {
    pub fn tally(&self) -> RunTally {
        let mut tally = RunTally {
            dispatched: self.outcomes.len(),
            skipped: self.skipped.len(),
            ..RunTally::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                JobStatus::Completed => tally.completed += 1,
                JobStatus::TimedOut => tally.timed_out += 1,
                JobStatus::Failed => tally.failed += 1,
                JobStatus::Cancelled => tally.cancelled += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
        }
        tally
    }

    pub fn failures(&self) -> Vec<&JobOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == JobStatus::Failed)
            .collect()
    }
}

pub struct Scheduler {
    launcher: Arc<dyn Launcher>,
    cores: Arc<dyn CorePool>,
    supervision: Supervision,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(launcher: impl Launcher + 'static, cores: impl CorePool + 'static) -> Self {
        Self {
            launcher: Arc::new(launcher),
            cores: Arc::new(cores),
            supervision: Supervision::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_supervision(mut self, supervision: Supervision) -> Self {
        self.supervision = supervision;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs every trial of `plan`. Trial failures are reported in the
    /// result; only an unusable core budget or worker pool is an error.
    pub fn run(&self, plan: &RunPlan) -> Result<RunReport> {
        let allocator = CoreAllocator::new(self.cores.as_ref(), plan.concurrency)?;
        ensure_dir(&plan.data_dir)?;
        let pool = WorkerPool::new("trial", plan.concurrency)?;
        let run_tag = format!("fuzzlab{}", Utc::now().timestamp_millis());
        tracing::info!(
            trials = plan.total(),
            concurrency = plan.concurrency,
            timeout_secs = plan.timeout.as_secs_f64(),
            data_dir = %plan.data_dir.display(),
            "starting run"
        );

        let (tx, rx) = mpsc::channel::<(usize, JobOutcome)>();
        let mut skipped = Vec::new();
        let mut keys = plan.trial_keys().into_iter().enumerate();
        while let Some((idx, key)) = keys.next() {
            let Some(lease) = allocator.acquire(&self.cancel) else {
                skipped.push(key);
                skipped.extend(keys.by_ref().map(|(_, key)| key));
                break;
            };
            let config = LaunchConfig {
                paths: TrialPaths::new(&plan.data_dir, &key),
                cpu: lease.core(),
                timeout: plan.timeout,
                name: container_name(&run_tag, &key),
                key,
            };
            let launcher = self.launcher.clone();
            let supervision = self.supervision;
            let cancel = self.cancel.clone();
            let tx = tx.clone();
            pool.execute(move || {
                let outcome = JobUnit::new(config).run(launcher.as_ref(), &supervision, &cancel);
                drop(lease);
                let _ = tx.send((idx, outcome));
            })?;
        }
        drop(tx);
        pool.join();

        let mut outcomes: Vec<(usize, JobOutcome)> = rx.into_iter().collect();
        outcomes.sort_by_key(|(idx, _)| *idx);
        let report = RunReport {
            outcomes: outcomes.into_iter().map(|(_, o)| o).collect(),
            skipped,
        };
        if !report.skipped.is_empty() {
            tracing::warn!(
                skipped = report.skipped.len(),
                "run cancelled before all trials were dispatched"
            );
        }
        tracing::info!(tally = ?report.tally(), "run finished");
        Ok(report)
    }
}

fn container_name(run_tag: &str, key: &TrialKey) -> String {
    let raw = format!("{}_{}_{}_{}", run_tag, key.target, key.fuzzer, key.trial);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_.-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(trials: usize) -> RunPlan {
        RunPlan {
            targets: vec!["a".to_string(), "b".to_string()],
            fuzzers: vec!["x".to_string(), "y".to_string()],
            trials,
            timeout: Duration::from_secs(1),
            concurrency: 0,
            data_dir: PathBuf::from("/tmp/unused"),
        }
    }

    #[test]
    fn keys_are_trial_major() {
        let keys: Vec<String> = plan(2).trial_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(
            keys,
            vec!["a/x#0", "a/y#0", "b/x#0", "b/y#0", "a/x#1", "a/y#1", "b/x#1", "b/y#1"]
        );
        assert_eq!(plan(0).trial_keys().len(), 0);
        assert_eq!(plan(3).total(), 12);
    }

    #[test]
    fn container_names_are_docker_safe() {
        let name = container_name("fuzzlab1", &TrialKey::new("lib/png", "afl++", 2));
        assert_eq!(name, "fuzzlab1_lib_png_afl___2");
    }
}
