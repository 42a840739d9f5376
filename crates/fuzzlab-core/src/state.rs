use crate::ids::TrialKey;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const TRIAL_STATE_FILE: &str = "trial_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::TimedOut | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Persisted per-trial record, kept next to the trial's output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialState {
    pub schema_version: String,
    pub target: String,
    pub fuzzer: String,
    pub trial: usize,
    pub status: JobStatus,
    #[serde(default)]
    pub cpu: Option<usize>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TrialState {
    pub fn new(key: &TrialKey, status: JobStatus) -> Self {
        Self {
            schema_version: "trial_state_v1".to_string(),
            target: key.target.clone(),
            fuzzer: key.fuzzer.clone(),
            trial: key.trial,
            status,
            cpu: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn key(&self) -> TrialKey {
        TrialKey::new(self.target.clone(), self.fuzzer.clone(), self.trial)
    }

    pub fn load(trial_dir: &Path) -> Result<Self> {
        let bytes = fs::read(trial_dir.join(TRIAL_STATE_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn store(&self, trial_dir: &Path) -> Result<()> {
        let value = serde_json::to_value(self)?;
        crate::atomic_write_json_pretty(&trial_dir.join(TRIAL_STATE_FILE), &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_trial_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = TrialState::new(&TrialKey::new("libpng", "afl", 2), JobStatus::Running);
        state.cpu = Some(3);
        state.started_at = Some(Utc::now());
        state.store(dir.path()).expect("store");

        let loaded = TrialState::load(dir.path()).expect("load");
        assert_eq!(loaded, state);
        assert_eq!(loaded.key(), TrialKey::new("libpng", "afl", 2));

        let raw = fs::read_to_string(dir.path().join(TRIAL_STATE_FILE)).expect("read");
        assert!(raw.contains("\"status\": \"running\""), "{}", raw);
    }

    #[test]
    fn only_outcomes_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(JobStatus::TimedOut.as_str(), "timed_out");
    }
}
