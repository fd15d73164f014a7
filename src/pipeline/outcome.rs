//! Per-request scratch objects, pooled to keep the hot path free of
//! allocation. Release always clears owned strings and vectors so a
//! pooled slot cannot pin a previous request's memory.

use std::sync::Mutex;
use std::time::Duration;

use crate::logging::query_log::TraceEntry;
use crate::protocols::protocol::ResultCode;

/// How the request was answered, filled in as the pipeline runs.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    pub blocked: bool,
    pub cached: bool,
    pub upstream: Option<String>,
    pub response_code: ResultCode,
    pub upstream_duration: Duration,
}

impl QueryOutcome {
    fn reset(&mut self) {
        self.blocked = false;
        self.cached = false;
        self.upstream = None;
        self.response_code = ResultCode::NOERROR;
        self.upstream_duration = Duration::ZERO;
    }
}

pub struct OutcomePool {
    slots: Mutex<Vec<QueryOutcome>>,
    max_idle: usize,
}

impl OutcomePool {
    pub fn new(max_idle: usize) -> OutcomePool {
        OutcomePool {
            slots: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// A zeroed outcome, recycled when one is available.
    pub fn acquire(&self) -> QueryOutcome {
        let slot = self
            .slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.pop());

        match slot {
            Some(mut outcome) => {
                outcome.reset();
                outcome
            }
            None => QueryOutcome::default(),
        }
    }

    /// Returns an outcome to the pool, dropping retained strings first.
    pub fn release(&self, mut outcome: QueryOutcome) {
        outcome.reset();
        if let Ok(mut slots) = self.slots.lock() {
            if slots.len() < self.max_idle {
                slots.push(outcome);
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}

/// Accumulates trace entries for one request. When tracing is disabled
/// the recorder refuses every entry, so the hot path pays nothing.
pub struct TraceRecorder {
    enabled: bool,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, entry: TraceEntry) {
        if self.enabled {
            self.entries.push(entry);
        }
    }

    pub fn extend(&mut self, entries: Vec<TraceEntry>) {
        if self.enabled {
            self.entries.extend(entries);
        }
    }

    /// A copy of what has been recorded so far, or `None` when tracing
    /// is off or nothing happened.
    pub fn snapshot(&self) -> Option<Vec<TraceEntry>> {
        if self.enabled && !self.entries.is_empty() {
            Some(self.entries.clone())
        } else {
            None
        }
    }
}

pub struct TracePool {
    slots: Mutex<Vec<Vec<TraceEntry>>>,
    max_idle: usize,
}

impl TracePool {
    pub fn new(max_idle: usize) -> TracePool {
        TracePool {
            slots: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn recorder(&self, enabled: bool) -> TraceRecorder {
        let entries = self
            .slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.pop())
            .unwrap_or_default();

        TraceRecorder { enabled, entries }
    }

    pub fn release(&self, recorder: TraceRecorder) {
        let mut entries = recorder.entries;
        entries.clear();
        if let Ok(mut slots) = self.slots.lock() {
            if slots.len() < self.max_idle {
                slots.push(entries);
            }
        }
    }
}
