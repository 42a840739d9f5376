use crate::record::ResultRecord;
use anyhow::{Context, Result};
use fuzzlab_core::{JobStatus, TrialState, TRIAL_STATE_FILE};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

const CRASH_DIR: &str = "crashes";
const STATS_FILE: &str = "fuzzer_stats";

/// Turns a run directory into raw per-trial records.
///
/// Completed and timed-out trials are read from their `output/` directory;
/// failed trials count as no event and no crashes. Trials that are still
/// running or were cancelled are left out.
pub fn collect(data_dir: &Path) -> Result<Vec<ResultRecord>> {
    let mut trials: Vec<(TrialState, PathBuf)> = Vec::new();
    let walker = WalkDir::new(data_dir)
        .min_depth(4)
        .max_depth(4)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", data_dir.display()))?;
        if entry.file_name() != TRIAL_STATE_FILE || !in_trial_dir(data_dir, entry.path()) {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        match TrialState::load(dir) {
            Ok(state) => trials.push((state, dir.to_path_buf())),
            Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "unreadable trial state"),
        }
    }
    trials.sort_by_key(|(state, _)| state.trial);

    let mut records = Vec::new();
    for (state, dir) in trials {
        let record = match state.status {
            JobStatus::Completed | JobStatus::TimedOut => observe(&state, &dir.join("output"))?,
            JobStatus::Failed => ResultRecord::new(&state.target, &state.fuzzer, None, 0),
            JobStatus::Pending | JobStatus::Running | JobStatus::Cancelled => {
                tracing::debug!(trial = %state.key(), status = state.status.as_str(), "skipped");
                continue;
            }
        };
        records.push(record);
    }
    tracing::info!(records = records.len(), "collected results");
    Ok(records)
}

fn in_trial_dir(data_dir: &Path, path: &Path) -> bool {
    path.strip_prefix(data_dir)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|first| first.as_os_str().to_str())
        .map(|first| first.starts_with("trial_"))
        .unwrap_or(false)
}

fn observe(state: &TrialState, output: &Path) -> Result<ResultRecord> {
    let crashes = crash_files(output)?;
    let tte = match crashes.iter().copied().reduce(f64::min) {
        None => None,
        Some(first_crash) => match start_time(state, output) {
            Some(start) => Some((first_crash - start).max(0.0)),
            None => {
                tracing::warn!(trial = %state.key(), "no start time, time to crash unknown");
                None
            }
        },
    };
    Ok(ResultRecord::new(
        &state.target,
        &state.fuzzer,
        tte,
        crashes.len() as u64,
    ))
}

/// Directories that may hold crashes: `output/crashes` and
/// `output/<instance>/crashes`.
fn candidate_dirs(output: &Path, leaf: &str) -> Result<Vec<PathBuf>> {
    let mut dirs = vec![output.join(leaf)];
    if output.is_dir() {
        let mut nested: Vec<PathBuf> = fs::read_dir(output)
            .with_context(|| format!("failed to list {}", output.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .map(|p| p.join(leaf))
            .collect();
        nested.sort();
        dirs.extend(nested);
    }
    Ok(dirs)
}

fn crash_files(output: &Path) -> Result<Vec<f64>> {
    let mut times = Vec::new();
    for dir in candidate_dirs(output, CRASH_DIR)? {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name() == "README.txt" {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified()?.duration_since(UNIX_EPOCH)?;
            times.push(modified.as_secs_f64());
        }
    }
    Ok(times)
}

/// Fuzzing start in unix seconds: the engine's own `start_time` when it wrote
/// one, otherwise when the trial was launched.
fn start_time(state: &TrialState, output: &Path) -> Option<f64> {
    let from_stats = candidate_dirs(output, STATS_FILE)
        .ok()?
        .into_iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .find_map(|text| parse_start_time(&text));
    from_stats.or_else(|| {
        state
            .started_at
            .map(|t| t.timestamp_millis() as f64 / 1000.0)
    })
}

fn parse_start_time(stats: &str) -> Option<f64> {
    stats.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "start_time")
            .then(|| value.trim().parse::<f64>().ok())
            .flatten()
    })
}
