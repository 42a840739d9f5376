//! Per-trial result records and their censored per-pair summary.

mod collect;
mod record;
mod summary;

pub use collect::collect;
pub use record::{
    emit_records, parse_records, read_records, write_records, AnalysisError, RawRecord,
    ResultRecord, NO_EVENT,
};
pub use summary::{
    aggregate, emit_summary, format_summary, write_summary, SummaryStatistic, SUMMARY_HEADER,
};
