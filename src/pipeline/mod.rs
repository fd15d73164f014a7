pub mod handler;
pub mod outcome;

pub use handler::{HandlerServices, QueryHandler};
pub use outcome::{OutcomePool, QueryOutcome, TracePool, TraceRecorder};
