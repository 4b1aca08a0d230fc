// src/pipeline/controller.rs
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::core::lock::lock_mutex;
use crate::core::logging::ComponentLogger;
use crate::core::{PipelineError, PipelineResult};
use crate::io::fetcher::MediaFetcher;
use crate::io::transcoder::{TRANSCODER_LABEL, Transcoder};
use crate::pipeline::pacer::{FramePacer, PaceEnd, PaceReport};
use crate::pipeline::session::{
    PlaybackSession, SessionEvent, SessionHandle, SessionPhase, SessionState,
};
use crate::ring::{FrameSink, OutboundSink};

/// How long processes get to exit on their own after the PCM stream ended.
const EXIT_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Starts playback sessions and reports how they end.
pub struct PipelineController {
    config: RelayConfig,
    next_id: AtomicU64,
    notifier: EventNotifier,
}

impl PipelineController {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            notifier: EventNotifier::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Receiver that sees every terminal event from now on. Dropping it
    /// unsubscribes.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    /// Resolves `url`, starts the transcoder and hands the PCM stream to a
    /// pacer thread feeding `sink`.
    ///
    /// Blocks through fetching and transcoder start-up only. Failures in
    /// those phases are returned and also reported as a `Failed` event.
    /// A sink that is closed or already fed by another session is refused
    /// with `VoiceChannelUnavailable` before any session exists.
    pub fn start_playback(
        &self,
        url: &str,
        sink: Arc<OutboundSink>,
    ) -> PipelineResult<SessionHandle> {
        let lease = sink.claim_producer()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(PlaybackSession::new(id, url, lease));
        info!("[controller] session {} requested for {}", id, url);

        session.transition(SessionState::Fetching);
        let fetched = match MediaFetcher::new(self.config.fetcher.clone()).fetch(url) {
            Ok(fetched) => fetched,
            Err(e) => return Err(self.fail_early(&session, e)),
        };

        session.transition(SessionState::Transcoding);
        let transcoder = Transcoder::new(self.config.transcoder.clone(), self.config.frame);
        let stream = match transcoder.start(fetched) {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail_early(&session, e)),
        };
        let upstream_error = stream.upstream_error_slot();
        let pcm = stream.pcm;
        session.install_processes(stream.processes);

        session.transition(SessionState::Streaming);
        let pacer = FramePacer::new(self.config.frame, session.stop_signal())
            .with_session(id, sink.name());

        let worker = {
            let session = session.clone();
            let notifier = self.notifier.clone();
            thread::Builder::new()
                .name(format!("pacer-{}", id))
                .spawn(move || {
                    run_session(&session, &pacer, pcm, &sink, &upstream_error, &notifier)
                })
        };

        match worker {
            Ok(worker) => Ok(SessionHandle::new(session, worker)),
            Err(e) => Err(self.fail_early(&session, PipelineError::read(e))),
        }
    }

    /// Best effort; returns immediately. The terminal event follows once
    /// the worker has cleaned up.
    pub fn stop_playback(&self, handle: &SessionHandle) {
        info!("[controller] stop requested for session {}", handle.id());
        handle.stop();
    }

    fn fail_early(&self, session: &PlaybackSession, error: PipelineError) -> PipelineError {
        let phase = session.last_active_phase();
        session.cleanup();
        session.transition(SessionState::Failed(error.clone()));
        session.error(&format!("failed while {}: {}", phase.as_str(), error));
        self.notifier.send(SessionEvent::Failed {
            session_id: session.id(),
            url: session.url().to_string(),
            phase,
            error: error.clone(),
            report: None,
        });
        error
    }

}

/// Fans terminal events out to live subscribers only.
#[derive(Clone, Default)]
struct EventNotifier {
    subscribers: Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl EventNotifier {
    fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = channel::unbounded();
        lock_mutex(&self.subscribers, "EventNotifier::subscribe").push(tx);
        rx
    }

    fn send(&self, event: SessionEvent) {
        // a failed send means the receiver is gone
        lock_mutex(&self.subscribers, "EventNotifier::send")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock_mutex(&self.subscribers, "EventNotifier::subscriber_count").len()
    }
}

fn run_session<R, S>(
    session: &PlaybackSession,
    pacer: &FramePacer,
    mut pcm: R,
    sink: &S,
    upstream_error: &Arc<Mutex<Option<PipelineError>>>,
    notifier: &EventNotifier,
) where
    R: Read,
    S: FrameSink + ?Sized,
{
    let paced = panic::catch_unwind(AssertUnwindSafe(|| pacer.run(&mut pcm, sink)));
    drop(pcm);

    let (report, outcome) = match paced {
        Ok(report) => {
            let outcome = classify_end(session, &report, upstream_error);
            (Some(report), outcome)
        }
        Err(_) => {
            error!("[controller] pacer for session {} panicked", session.id());
            (None, Err(PipelineError::read("pacer panicked")))
        }
    };

    session.cleanup();

    let event = match outcome {
        Ok(()) => {
            session.transition(SessionState::Stopped);
            SessionEvent::Stopped {
                session_id: session.id(),
                url: session.url().to_string(),
                report: report.unwrap_or_else(stopped_report),
            }
        }
        Err(error) => {
            session.transition(SessionState::Failed(error.clone()));
            session.error(&format!("stream failed: {}", error));
            SessionEvent::Failed {
                session_id: session.id(),
                url: session.url().to_string(),
                phase: SessionPhase::Streaming,
                error,
                report,
            }
        }
    };
    notifier.send(event);
}

fn stopped_report() -> PaceReport {
    PaceReport {
        frames_read: 0,
        frames_sent: 0,
        frames_dropped: 0,
        discarded_tail_bytes: 0,
        end: PaceEnd::Stopped,
    }
}

/// Decides whether a finished pacing run ended cleanly.
fn classify_end(
    session: &PlaybackSession,
    report: &PaceReport,
    upstream_error: &Arc<Mutex<Option<PipelineError>>>,
) -> PipelineResult<()> {
    match &report.end {
        PaceEnd::Stopped => Ok(()),
        PaceEnd::ReadError(reason) => Err(PipelineError::read(reason)),
        PaceEnd::EndOfStream => {
            let Some(statuses) = await_exit(session) else {
                return Ok(());
            };
            // killed by a stop that raced the exit poll
            if session.stop_requested() {
                return Ok(());
            }
            if let Some(e) = lock_mutex(upstream_error, "classify_end").clone() {
                return Err(e);
            }
            exit_error(&statuses).map_or(Ok(()), Err)
        }
    }
}

/// Waits for every process to exit after end of stream. `None` when a stop
/// arrived meanwhile or the grace period ran out (processes are then
/// killed by cleanup).
fn await_exit(session: &PlaybackSession) -> Option<Vec<(String, ExitStatus)>> {
    let stop = session.stop_signal();
    let deadline = Instant::now() + EXIT_GRACE;
    loop {
        if let Some(statuses) = session.try_exit_statuses() {
            return Some(statuses);
        }
        if Instant::now() >= deadline {
            warn!(
                "[controller] session {} processes still running {:?} after end of stream",
                session.id(),
                EXIT_GRACE
            );
            return None;
        }
        if stop.wait_timeout(EXIT_POLL) {
            debug!("[controller] session {} stopped while reaping", session.id());
            return None;
        }
    }
}

/// A retrieval process that exited with an error code is the root cause;
/// otherwise the transcoder's status decides, and a retrieval process
/// killed by a signal comes last.
fn exit_error(statuses: &[(String, ExitStatus)]) -> Option<PipelineError> {
    let fetch_code = statuses
        .iter()
        .filter(|(label, _)| label != TRANSCODER_LABEL)
        .find(|(_, status)| matches!(status.code(), Some(code) if code != 0));
    if let Some((label, status)) = fetch_code {
        return Some(PipelineError::read(format!("{} exited with {}", label, status)));
    }

    if let Some((_, status)) = statuses
        .iter()
        .find(|(label, status)| label == TRANSCODER_LABEL && !status.success())
    {
        return Some(PipelineError::TranscodeAbnormalExit {
            code: status.code(),
        });
    }

    statuses
        .iter()
        .find(|(_, status)| !status.success())
        .map(|(label, status)| PipelineError::read(format!("{} exited with {}", label, status)))
}
