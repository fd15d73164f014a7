//! The per-query log entry and its decision trace.

use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};

/// One step of the decision pipeline, recorded only when decision tracing
/// is enabled. The ordered list explains how the final answer came to be.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stage: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TraceEntry {
    pub fn new(stage: &str, action: &str) -> Self {
        TraceEntry {
            stage: stage.to_string(),
            action: action.to_string(),
            rule: None,
            source: None,
            detail: None,
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The record handed to the asynchronous query logger after a response
/// has been written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLog {
    pub timestamp: DateTime<Local>,
    pub client_ip: String,
    pub domain: String,
    pub qtype: String,
    pub response_code: String,
    pub blocked: bool,
    pub cached: bool,
    pub response_time_ms: f64,
    pub upstream_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<TraceEntry>>,
}
