pub mod conditional;
pub mod forwarder;

pub use conditional::{ConditionalResolver, ConditionalRule, DomainPattern};
pub use forwarder::{ForwardError, Forwarded, Forwarder, Upstream, UpstreamForwarder};
