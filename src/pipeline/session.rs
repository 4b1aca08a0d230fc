//! Playback session lifecycle.
//!
//! A session moves strictly forward through
//! `Idle → Fetching → Transcoding → Streaming → {Stopped | Failed}`.
//! Requests for a transition that is not forward (including anything out
//! of a terminal state) are ignored, so stopping an already stopped session
//! is a no-op.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::core::lock::lock_mutex;
use crate::core::logging::{ComponentLogger, LogContext};
use crate::core::{PipelineError, StopSignal};
use crate::io::process::ProcessGroup;
use crate::pipeline::pacer::PaceReport;
use crate::ring::ProducerLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Fetching,
    Transcoding,
    Streaming,
    Stopped,
    Failed,
}

impl SessionPhase {
    fn rank(self) -> u8 {
        match self {
            SessionPhase::Idle => 0,
            SessionPhase::Fetching => 1,
            SessionPhase::Transcoding => 2,
            SessionPhase::Streaming => 3,
            SessionPhase::Stopped | SessionPhase::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Stopped | SessionPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Fetching => "fetching",
            SessionPhase::Transcoding => "transcoding",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Stopped => "stopped",
            SessionPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Fetching,
    Transcoding,
    Streaming,
    Stopped,
    Failed(PipelineError),
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Fetching => SessionPhase::Fetching,
            SessionState::Transcoding => SessionPhase::Transcoding,
            SessionState::Streaming => SessionPhase::Streaming,
            SessionState::Stopped => SessionPhase::Stopped,
            SessionState::Failed(_) => SessionPhase::Failed,
        }
    }

    pub fn can_advance_to(&self, next: &SessionState) -> bool {
        let current = self.phase();
        !current.is_terminal() && next.phase().rank() > current.rank()
    }
}

/// Terminal notification for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stopped {
        session_id: u64,
        url: String,
        report: PaceReport,
    },
    Failed {
        session_id: u64,
        url: String,
        /// Last phase reached before failing.
        phase: SessionPhase,
        error: PipelineError,
        report: Option<PaceReport>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::Stopped { session_id, .. } | SessionEvent::Failed { session_id, .. } => {
                *session_id
            }
        }
    }
}

/// State shared between a session's worker thread and its handle.
pub struct PlaybackSession {
    id: u64,
    url: String,
    state: Mutex<SessionState>,
    history: Mutex<Vec<SessionPhase>>,
    processes: Mutex<ProcessGroup>,
    lease: Mutex<Option<ProducerLease>>,
    stop: Arc<StopSignal>,
}

impl PlaybackSession {
    pub fn new(id: u64, url: &str, lease: ProducerLease) -> Self {
        Self {
            id,
            url: url.to_string(),
            state: Mutex::new(SessionState::Idle),
            history: Mutex::new(vec![SessionPhase::Idle]),
            processes: Mutex::new(ProcessGroup::new()),
            lease: Mutex::new(Some(lease)),
            stop: Arc::new(StopSignal::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        lock_mutex(&self.state, "PlaybackSession::state").clone()
    }

    pub fn phase(&self) -> SessionPhase {
        lock_mutex(&self.state, "PlaybackSession::phase").phase()
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> Vec<SessionPhase> {
        lock_mutex(&self.history, "PlaybackSession::history").clone()
    }

    /// Last phase entered that was not terminal.
    pub fn last_active_phase(&self) -> SessionPhase {
        self.history()
            .into_iter()
            .rev()
            .find(|p| !p.is_terminal())
            .unwrap_or(SessionPhase::Idle)
    }

    /// Applies `next` if it moves the session forward. Returns whether
    /// the transition happened.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = lock_mutex(&self.state, "PlaybackSession::transition");
        if !state.can_advance_to(&next) {
            self.debug(&format!(
                "ignoring transition {} -> {}",
                state.phase().as_str(),
                next.phase().as_str()
            ));
            return false;
        }

        let from = state.phase();
        let to = next.phase();
        *state = next;
        lock_mutex(&self.history, "PlaybackSession::transition").push(to);
        drop(state);

        self.info(&format!("{} -> {}", from.as_str(), to.as_str()));
        true
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn install_processes(&self, group: ProcessGroup) {
        lock_mutex(&self.processes, "PlaybackSession::install_processes").append(group);
    }

    pub fn child_pids(&self) -> Vec<u32> {
        lock_mutex(&self.processes, "PlaybackSession::child_pids").pids()
    }

    pub fn try_exit_statuses(&self) -> Option<Vec<(String, ExitStatus)>> {
        lock_mutex(&self.processes, "PlaybackSession::try_exit_statuses").try_statuses()
    }

    pub fn kill_processes(&self) {
        lock_mutex(&self.processes, "PlaybackSession::kill_processes").kill_all();
    }

    /// Stop flag first so the pacer does not mistake the killed pipe for a
    /// clean end of stream, then kill so a blocked read returns.
    pub fn request_stop(&self) {
        if self.phase().is_terminal() {
            return;
        }
        self.info("stop requested");
        self.stop.stop();
        self.kill_processes();
    }

    /// Kills and reaps every process and gives the sink back.
    pub fn cleanup(&self) {
        lock_mutex(&self.processes, "PlaybackSession::cleanup").terminate_all();
        if lock_mutex(&self.lease, "PlaybackSession::cleanup").take().is_some() {
            self.debug("sink released");
        }
    }

    pub fn holds_sink(&self) -> bool {
        lock_mutex(&self.lease, "PlaybackSession::holds_sink").is_some()
    }
}

impl ComponentLogger for PlaybackSession {
    fn log_context(&self) -> LogContext {
        LogContext::new("Session", &self.url).with_session(self.id)
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Caller's handle on a running session.
///
/// Dropping the handle detaches the session; it keeps streaming until the
/// source ends and still reports its terminal event.
pub struct SessionHandle {
    session: Arc<PlaybackSession>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<PlaybackSession>, worker: JoinHandle<()>) -> Self {
        Self {
            session,
            worker: Some(worker),
        }
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn url(&self) -> &str {
        self.session.url()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn history(&self) -> Vec<SessionPhase> {
        self.session.history()
    }

    pub fn child_pids(&self) -> Vec<u32> {
        self.session.child_pids()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(true)
    }

    /// Best effort and idempotent; returns immediately.
    pub fn stop(&self) {
        self.session.request_stop();
    }

    /// Blocks until the worker has cleaned up and returns the final state.
    pub fn wait(mut self) -> SessionState {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                self.session.error("worker thread panicked outside pacing");
                self.session.cleanup();
            }
        }
        self.session.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::OutboundSink;

    fn session() -> PlaybackSession {
        let sink = Arc::new(OutboundSink::new("test", 4));
        let lease = sink.claim_producer().unwrap();
        PlaybackSession::new(1, "file:///tmp/x.pcm", lease)
    }

    #[test]
    fn test_forward_transitions() {
        let s = session();
        assert_eq!(s.phase(), SessionPhase::Idle);
        assert!(s.transition(SessionState::Fetching));
        assert!(s.transition(SessionState::Transcoding));
        assert!(s.transition(SessionState::Streaming));
        assert!(s.transition(SessionState::Stopped));
        assert_eq!(
            s.history(),
            vec![
                SessionPhase::Idle,
                SessionPhase::Fetching,
                SessionPhase::Transcoding,
                SessionPhase::Streaming,
                SessionPhase::Stopped
            ]
        );
        assert_eq!(s.last_active_phase(), SessionPhase::Streaming);
    }

    #[test]
    fn test_no_revisit_or_backwards() {
        let s = session();
        assert!(s.transition(SessionState::Transcoding));
        assert!(!s.transition(SessionState::Fetching));
        assert!(!s.transition(SessionState::Transcoding));
        assert_eq!(s.phase(), SessionPhase::Transcoding);
    }

    #[test]
    fn test_terminal_is_final() {
        let s = session();
        assert!(s.transition(SessionState::Fetching));
        assert!(s.transition(SessionState::Failed(PipelineError::NoAudioFormatAvailable {
            url: "u".into()
        })));
        assert!(!s.transition(SessionState::Stopped));
        assert!(!s.transition(SessionState::Streaming));
        assert_eq!(s.phase(), SessionPhase::Failed);
        assert_eq!(s.last_active_phase(), SessionPhase::Fetching);

        // stop on a finished session is a no-op
        s.request_stop();
        assert!(!s.stop_requested());
    }

    #[test]
    fn test_cleanup_releases_sink() {
        let sink = Arc::new(OutboundSink::new("test", 4));
        let s = PlaybackSession::new(2, "u", sink.claim_producer().unwrap());
        assert!(sink.has_producer());
        assert!(s.holds_sink());

        s.cleanup();
        assert!(!s.holds_sink());
        assert!(!sink.has_producer());

        // second cleanup is harmless
        s.cleanup();
    }
}
