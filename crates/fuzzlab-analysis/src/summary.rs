use crate::record::{AnalysisError, ResultRecord};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

pub const SUMMARY_HEADER: [&str; 5] = [
    "target",
    "fuzzer",
    "valuable_count",
    "tte_avg",
    "total_crashes_avg",
];

/// Per (target, fuzzer) statistics over a right-censored sample.
///
/// `tte_avg` covers only trials where the event occurred and
/// `total_crashes_avg` only trials with at least one crash. An empty sample
/// averages to 0; `valuable_count` tells the two apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStatistic {
    pub target: String,
    pub fuzzer: String,
    pub valuable_count: usize,
    pub tte_avg: f64,
    pub total_crashes_avg: f64,
}

#[derive(Default)]
struct Sample {
    tte: Vec<f64>,
    crashes: Vec<u64>,
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let len = values.len();
    if len == 0 {
        return 0.0;
    }
    values.sum::<f64>() / len as f64
}

/// Groups records by target, then by fuzzer within a target, each in the
/// order first seen.
pub fn aggregate(records: &[ResultRecord]) -> Vec<SummaryStatistic> {
    let mut targets: Vec<(&str, Vec<(&str, Sample)>)> = Vec::new();
    let mut target_idx: HashMap<&str, usize> = HashMap::new();
    for record in records {
        let t = *target_idx.entry(record.target.as_str()).or_insert_with(|| {
            targets.push((record.target.as_str(), Vec::new()));
            targets.len() - 1
        });
        let fuzzers = &mut targets[t].1;
        let f = match fuzzers.iter().position(|(name, _)| *name == record.fuzzer) {
            Some(f) => f,
            None => {
                fuzzers.push((record.fuzzer.as_str(), Sample::default()));
                fuzzers.len() - 1
            }
        };
        let sample = &mut fuzzers[f].1;
        if let Some(tte) = record.tte {
            sample.tte.push(tte);
        }
        if record.total_crashes != 0 {
            sample.crashes.push(record.total_crashes);
        }
    }

    targets
        .into_iter()
        .flat_map(|(target, fuzzers)| {
            fuzzers.into_iter().map(move |(fuzzer, sample)| SummaryStatistic {
                target: target.to_string(),
                fuzzer: fuzzer.to_string(),
                valuable_count: sample.tte.len(),
                tte_avg: mean(sample.tte.iter().copied()),
                total_crashes_avg: mean(sample.crashes.iter().map(|c| *c as f64)),
            })
        })
        .collect()
}

pub fn emit_summary<W: Write>(writer: W, stats: &[SummaryStatistic]) -> Result<(), AnalysisError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(SUMMARY_HEADER)?;
    for stat in stats {
        writer.write_record([
            stat.target.clone(),
            stat.fuzzer.clone(),
            stat.valuable_count.to_string(),
            format!("{:.4}", stat.tte_avg),
            format!("{:.4}", stat.total_crashes_avg),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn format_summary(stats: &[SummaryStatistic]) -> Result<String> {
    let mut buf = Vec::new();
    emit_summary(&mut buf, stats)?;
    Ok(String::from_utf8(buf)?)
}

pub fn write_summary(path: &Path, stats: &[SummaryStatistic]) -> Result<()> {
    let text = format_summary(stats)?;
    fuzzlab_core::atomic_write_bytes(path, text.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}
