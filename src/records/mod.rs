pub mod local_records;

pub use local_records::{LocalRecord, LocalRecordData, LocalRecords, ResolvedChain};
