// src/pipeline/pacer.rs
use std::io::{self, Read};
use std::sync::Arc;

use bytes::Bytes;

use crate::core::logging::{ComponentLogger, LogContext};
use crate::core::timestamp::{format_position, utc_ns_now};
use crate::core::StopSignal;
use crate::ring::{AudioFrame, FrameGeometry, FrameSink};

/// Log the first drop, then every n-th.
const DROP_LOG_EVERY: u64 = 50;
/// Progress line every n frames (5 s at 20 ms).
const PROGRESS_EVERY: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaceEnd {
    /// Upstream closed; a trailing partial frame (if any) was discarded.
    EndOfStream,
    Stopped,
    ReadError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaceReport {
    pub frames_read: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub discarded_tail_bytes: usize,
    pub end: PaceEnd,
}

impl PaceReport {
    fn new() -> Self {
        Self {
            frames_read: 0,
            frames_sent: 0,
            frames_dropped: 0,
            discarded_tail_bytes: 0,
            end: PaceEnd::EndOfStream,
        }
    }
}

enum FrameRead {
    Full,
    /// End of stream after this many bytes of an incomplete frame.
    Partial(usize),
    Eof,
    Error(io::Error),
}

/// Slices canonical PCM into frames and offers them to a sink at real-time
/// pace: one enqueue attempt, then one frame duration of sleep.
pub struct FramePacer {
    geometry: FrameGeometry,
    stop: Arc<StopSignal>,
    label: String,
    session_id: Option<u64>,
}

impl FramePacer {
    pub fn new(geometry: FrameGeometry, stop: Arc<StopSignal>) -> Self {
        Self {
            geometry,
            stop,
            label: "pcm".to_string(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: u64, label: &str) -> Self {
        self.session_id = Some(session_id);
        self.label = label.to_string();
        self
    }

    pub fn run<R, S>(&self, reader: &mut R, sink: &S) -> PaceReport
    where
        R: Read + ?Sized,
        S: FrameSink + ?Sized,
    {
        let frame_duration = self.geometry.frame_duration();
        let mut buf = vec![0u8; self.geometry.frame_bytes()];
        let mut report = PaceReport::new();

        self.debug(&format!(
            "pacing {} bytes every {:?}",
            buf.len(),
            frame_duration
        ));

        loop {
            if self.stop.is_stopped() {
                report.end = PaceEnd::Stopped;
                break;
            }

            match read_frame(reader, &mut buf) {
                FrameRead::Full => {}
                FrameRead::Eof => {
                    report.end = self.end_or_stopped(PaceEnd::EndOfStream);
                    break;
                }
                FrameRead::Partial(n) => {
                    report.discarded_tail_bytes = n;
                    self.debug(&format!("discarding {} trailing bytes", n));
                    report.end = self.end_or_stopped(PaceEnd::EndOfStream);
                    break;
                }
                FrameRead::Error(e) => {
                    report.end = self.end_or_stopped(PaceEnd::ReadError(e.to_string()));
                    break;
                }
            }

            report.frames_read += 1;
            let frame = match AudioFrame::new(
                &self.geometry,
                report.frames_read,
                utc_ns_now(),
                Bytes::copy_from_slice(&buf),
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    report.end = PaceEnd::ReadError(e.to_string());
                    break;
                }
            };

            let progress = report.frames_read % PROGRESS_EVERY == 0;
            let peak = if progress { frame.peak() } else { 0.0 };

            if sink.try_enqueue(frame) {
                report.frames_sent += 1;
            } else {
                report.frames_dropped += 1;
                if report.frames_dropped == 1 || report.frames_dropped % DROP_LOG_EVERY == 0 {
                    self.warn(&format!(
                        "sink full, dropped frame {} ({} dropped so far)",
                        report.frames_read, report.frames_dropped
                    ));
                }
            }

            if progress {
                self.debug(&format!(
                    "position {} sent={} dropped={} peak={:.2}",
                    format_position(report.frames_read, frame_duration),
                    report.frames_sent,
                    report.frames_dropped,
                    peak
                ));
                if let Some(stats) = sink.stats() {
                    self.trace_sink(&stats);
                }
            }

            if self.stop.wait_timeout(frame_duration) {
                report.end = PaceEnd::Stopped;
                break;
            }
        }

        self.info(&format!(
            "pacing ended ({:?}) read={} sent={} dropped={} at {}",
            report.end,
            report.frames_read,
            report.frames_sent,
            report.frames_dropped,
            format_position(report.frames_read, frame_duration)
        ));
        report
    }

    // a read cut short by a stop request is not an upstream failure
    fn end_or_stopped(&self, end: PaceEnd) -> PaceEnd {
        if self.stop.is_stopped() {
            PaceEnd::Stopped
        } else {
            end
        }
    }
}

impl ComponentLogger for FramePacer {
    fn log_context(&self) -> LogContext {
        let ctx = LogContext::new("Pacer", &self.label);
        match self.session_id {
            Some(id) => ctx.with_session(id),
            None => ctx,
        }
    }
}

/// Fills `buf` completely, accumulating short reads.
fn read_frame<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> FrameRead {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return FrameRead::Eof,
            Ok(0) => return FrameRead::Partial(filled),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return FrameRead::Error(e),
        }
    }
    FrameRead::Full
}
