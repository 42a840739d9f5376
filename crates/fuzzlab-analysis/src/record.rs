use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// `tte` value marking a trial in which the event never happened.
pub const NO_EVENT: f64 = -1.0;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("record {record}: invalid tte {value}")]
    InvalidTte { record: usize, value: f64 },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One row of the raw per-trial table: `target,fuzzer,tte,total_crashes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub target: String,
    pub fuzzer: String,
    pub tte: f64,
    pub total_crashes: u64,
}

/// A per-trial result with the censoring sentinel decoded: `tte` is `None`
/// when the event did not occur within the trial's budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub target: String,
    pub fuzzer: String,
    pub tte: Option<f64>,
    pub total_crashes: u64,
}

impl ResultRecord {
    pub fn new(
        target: impl Into<String>,
        fuzzer: impl Into<String>,
        tte: Option<f64>,
        total_crashes: u64,
    ) -> Self {
        Self {
            target: target.into(),
            fuzzer: fuzzer.into(),
            tte,
            total_crashes,
        }
    }

    fn from_raw(raw: RawRecord, record: usize) -> Result<Self, AnalysisError> {
        let tte = if raw.tte == NO_EVENT {
            None
        } else if raw.tte.is_finite() && raw.tte >= 0.0 {
            Some(raw.tte)
        } else {
            return Err(AnalysisError::InvalidTte {
                record,
                value: raw.tte,
            });
        };
        Ok(Self {
            target: raw.target,
            fuzzer: raw.fuzzer,
            tte,
            total_crashes: raw.total_crashes,
        })
    }

    fn to_raw(&self) -> RawRecord {
        RawRecord {
            target: self.target.clone(),
            fuzzer: self.fuzzer.clone(),
            tte: self.tte.unwrap_or(NO_EVENT),
            total_crashes: self.total_crashes,
        }
    }
}

impl TryFrom<RawRecord> for ResultRecord {
    type Error = AnalysisError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        Self::from_raw(raw, 0)
    }
}

pub fn parse_records<R: Read>(reader: R) -> Result<Vec<ResultRecord>, AnalysisError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();
    for (idx, row) in reader.deserialize::<RawRecord>().enumerate() {
        records.push(ResultRecord::from_raw(row?, idx + 1)?);
    }
    Ok(records)
}

pub fn emit_records<W: Write>(writer: W, records: &[ResultRecord]) -> Result<(), AnalysisError> {
    let mut writer = csv::Writer::from_writer(writer);
    for record in records {
        writer.serialize(record.to_raw())?;
    }
    if records.is_empty() {
        writer.write_record(["target", "fuzzer", "tte", "total_crashes"])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_records(path: &Path) -> Result<Vec<ResultRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_records(file).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_records(path: &Path, records: &[ResultRecord]) -> Result<()> {
    let mut buf = Vec::new();
    emit_records(&mut buf, records)?;
    fuzzlab_core::atomic_write_bytes(path, &buf)
        .with_context(|| format!("failed to write {}", path.display()))
}
