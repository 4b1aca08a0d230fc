// src/core/logging.rs
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::timestamp::utc_ns_now;
use crate::ring::SinkStats;

// global sequence, lets interleaved session logs be correlated
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub instance_id: String,
    pub session_id: Option<u64>,
    pub sequence: u64,
    pub timestamp_ns: u64,
}

impl LogContext {
    pub fn new(component: &str, instance_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: instance_id.to_string(),
            session_id: None,
            sequence: LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp_ns: utc_ns_now(),
        }
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn format(&self, message: &str) -> String {
        let session_info = match self.session_id {
            Some(id) => format!(" session={}", id),
            None => String::new(),
        };

        format!(
            "[seq={:06}][{}:{}{}] {}",
            self.sequence, self.component, self.instance_id, session_info, message
        )
    }
}

/// Uniform log prefixes for pipeline components.
pub trait ComponentLogger {
    fn log_context(&self) -> LogContext;

    fn debug(&self, message: &str) {
        log::debug!("{}", self.log_context().format(message));
    }

    fn info(&self, message: &str) {
        log::info!("{}", self.log_context().format(message));
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", self.log_context().format(message));
    }

    fn error(&self, message: &str) {
        log::error!("{}", self.log_context().format(message));
    }

    fn trace_sink(&self, stats: &SinkStats) {
        let info = format!(
            "sink frames={}/{} enqueued={} dropped={} dequeued={}",
            stats.len, stats.capacity, stats.enqueued, stats.dropped, stats.dequeued
        );
        log::debug!("{}", self.log_context().format(&info));
    }
}
