//! Forwarding queries to upstream resolvers with retry and failover.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::client::network_client::{ClientError, DnsClient};
use crate::protocols::edns::EdnsInfo;
use crate::protocols::protocol::{DnsPacket, DnsQuestion};

/// Attempts per upstream before moving on to the next one.
const ATTEMPTS_PER_UPSTREAM: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no upstream configured")]
    NoUpstreams,
    #[error("all upstreams failed: {0}")]
    Exhausted(ClientError),
}

/// A forwarded response and the upstream that produced it.
#[derive(Debug, Clone)]
pub struct Forwarded {
    pub response: DnsPacket,
    pub upstream: Upstream,
}

/// An upstream resolver address. Parses from `host` (port 53 implied) or
/// `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: &str, port: u16) -> Upstream {
        Upstream {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Upstream {
    type Err = std::num::ParseIntError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // IPv6 literals with an explicit port use bracket notation.
        if let Some(rest) = input.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                return Ok(Upstream::new(host, port.parse()?));
            }
            return Ok(Upstream::new(rest.trim_end_matches(']'), 53));
        }

        match input.rsplit_once(':') {
            // A lone colon-free host, or a bare IPv6 address.
            Some((host, port)) if !host.contains(':') => Ok(Upstream::new(host, port.parse()?)),
            _ => Ok(Upstream::new(input, 53)),
        }
    }
}

impl<'de> Deserialize<'de> for Upstream {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The seam the pipeline forwards through. Mocked out in pipeline tests.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forwards against the default upstream set.
    async fn forward(
        &self,
        question: &DnsQuestion,
        edns: &EdnsInfo,
    ) -> Result<Forwarded, ForwardError>;

    /// Forwards against a caller-supplied upstream set, e.g. from a
    /// conditional forwarding rule or a policy FORWARD action.
    async fn forward_with(
        &self,
        question: &DnsQuestion,
        edns: &EdnsInfo,
        upstreams: &[Upstream],
    ) -> Result<Forwarded, ForwardError>;
}

/// The production forwarder: walks the upstream list in order, giving
/// each a couple of attempts before failing over to the next.
pub struct UpstreamForwarder {
    client: Arc<dyn DnsClient>,
    upstreams: Vec<Upstream>,
}

impl UpstreamForwarder {
    pub fn new(client: Arc<dyn DnsClient>, upstreams: Vec<Upstream>) -> UpstreamForwarder {
        UpstreamForwarder { client, upstreams }
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }
}

#[async_trait]
impl Forwarder for UpstreamForwarder {
    async fn forward(
        &self,
        question: &DnsQuestion,
        edns: &EdnsInfo,
    ) -> Result<Forwarded, ForwardError> {
        self.forward_with(question, edns, &self.upstreams).await
    }

    async fn forward_with(
        &self,
        question: &DnsQuestion,
        edns: &EdnsInfo,
        upstreams: &[Upstream],
    ) -> Result<Forwarded, ForwardError> {
        if upstreams.is_empty() {
            return Err(ForwardError::NoUpstreams);
        }

        let mut last_error = None;

        for upstream in upstreams {
            for attempt in 1..=ATTEMPTS_PER_UPSTREAM {
                match self
                    .client
                    .send_query(question, edns, (&upstream.host, upstream.port))
                    .await
                {
                    Ok(response) => {
                        debug!(%upstream, attempt, name = %question.name, "forwarded upstream");
                        return Ok(Forwarded {
                            response,
                            upstream: upstream.clone(),
                        });
                    }
                    Err(err) => {
                        warn!(%upstream, attempt, error = %err, "upstream attempt failed");
                        last_error = Some(err);
                    }
                }
            }
        }

        Err(ForwardError::Exhausted(
            last_error.unwrap_or(ClientError::LookupFailed),
        ))
    }
}
