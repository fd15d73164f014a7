pub mod query_log;
pub mod query_logger;

pub use query_log::{QueryLog, TraceEntry};
pub use query_logger::{LoggerError, QueryLogSink, QueryLogger};
