use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};

use crate::core::logging::{ComponentLogger, LogContext};
use crate::core::{PipelineError, PipelineResult};
use crate::ring::{AudioFrame, FrameSink};

pub const DEFAULT_SINK_CAPACITY: usize = 50; // 1 s @ 20 ms

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

/// Bounded frame queue toward the live transport.
///
/// The playback session is the only producer; the transport drains it
/// with [`OutboundSink::dequeue`]. Enqueueing never blocks: when the ring is
/// full the offered (newest) frame is dropped and counted.
pub struct OutboundSink {
    name: String,
    queue: ArrayQueue<AudioFrame>,
    open: AtomicBool,
    producer_attached: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    dequeued: AtomicU64,
}

impl OutboundSink {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            queue: ArrayQueue::new(capacity.max(1)),
            open: AtomicBool::new(true),
            producer_attached: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: &str, config: &SinkConfig) -> Arc<Self> {
        Arc::new(Self::new(name, config.capacity))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_enqueue(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_rejected) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Consumer side. `None` means the queue is currently empty.
    pub fn dequeue(&self) -> Option<AudioFrame> {
        let frame = self.queue.pop();
        if frame.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Called by the transport when the voice channel goes away.
    /// Frames still queued stay available to `dequeue`.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.info("closed by transport");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn has_producer(&self) -> bool {
        self.producer_attached.load(Ordering::SeqCst)
    }

    /// Registers the single producing session. Fails if the sink is closed
    /// or another session still holds a lease.
    pub fn claim_producer(self: &Arc<Self>) -> PipelineResult<ProducerLease> {
        if !self.is_open() {
            return Err(PipelineError::channel_unavailable(format!(
                "sink '{}' is closed",
                self.name
            )));
        }
        if self
            .producer_attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::channel_unavailable(format!(
                "sink '{}' already has an active producer",
                self.name
            )));
        }
        Ok(ProducerLease { sink: self.clone() })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            capacity: self.capacity(),
            len: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for OutboundSink {
    fn try_enqueue(&self, frame: AudioFrame) -> bool {
        OutboundSink::try_enqueue(self, frame)
    }

    fn stats(&self) -> Option<SinkStats> {
        Some(OutboundSink::stats(self))
    }
}

impl ComponentLogger for OutboundSink {
    fn log_context(&self) -> LogContext {
        LogContext::new("Sink", &self.name)
    }
}

/// Producer registration on a sink; released on drop.
pub struct ProducerLease {
    sink: Arc<OutboundSink>,
}

impl ProducerLease {
    pub fn sink(&self) -> &Arc<OutboundSink> {
        &self.sink
    }
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        self.sink.producer_attached.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub capacity: usize,
    pub len: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub dequeued: u64,
}
