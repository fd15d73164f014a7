pub mod context;
pub mod listeners;

pub use context::{DnsServer, ServerContext, ServerError};
