// Pipeline sessions against real child processes; `cat` and `sh` stand in
// for the transcoder so no media tooling is needed.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use voice_relay::config::RelayConfig;
use voice_relay::pipeline::PaceEnd;
use voice_relay::testing::{pcm_fixture, write_temp_pcm};
use voice_relay::{
    FrameGeometry, OutboundSink, PipelineController, PipelineError, SessionEvent, SessionPhase,
    SessionState,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn relay_config(program: &str, args: &[&str]) -> RelayConfig {
    let mut cfg = RelayConfig::default();
    cfg.frame = FrameGeometry::default().with_frame_duration_ms(10);
    cfg.sink.capacity = 1_000;
    cfg.transcoder.program = program.to_string();
    cfg.transcoder.args = Some(args.iter().map(|a| a.to_string()).collect());
    cfg
}

fn passthrough() -> RelayConfig {
    relay_config("cat", &[])
}

fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[test]
fn test_file_source_plays_to_stopped() {
    let cfg = passthrough();
    let frame_bytes = cfg.frame.frame_bytes();
    let data = pcm_fixture(frame_bytes * 5 + 100);
    let path = write_temp_pcm("clean", &data).unwrap();

    let controller = PipelineController::new(cfg);
    let events = controller.subscribe();
    let sink = OutboundSink::from_config("voice", &controller.config().sink);

    let url = format!("file://{}", path.display());
    let handle = controller.start_playback(&url, sink.clone()).unwrap();
    let pids = handle.child_pids();
    assert_eq!(pids.len(), 1);

    let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
    let state = handle.wait();

    match event {
        SessionEvent::Stopped { report, url: u, .. } => {
            assert_eq!(u, url);
            assert_eq!(report.end, PaceEnd::EndOfStream);
            assert_eq!(report.frames_sent, 5);
            assert_eq!(report.discarded_tail_bytes, 100);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(state, SessionState::Stopped);
    assert!(!sink.has_producer());

    let mut seq = 0;
    while let Some(frame) = sink.dequeue() {
        seq += 1;
        assert_eq!(frame.seq(), seq);
        assert_eq!(frame.len(), frame_bytes);
    }
    assert_eq!(seq, 5);

    if cfg!(target_os = "linux") {
        assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    }
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_transcoder_start_failure_never_streams() {
    let cfg = relay_config("/nonexistent/transcoder", &[]);
    let path = write_temp_pcm("nostart", &pcm_fixture(4000)).unwrap();

    let controller = PipelineController::new(cfg);
    let events = controller.subscribe();
    let sink = Arc::new(OutboundSink::new("voice", 4));

    let err = controller
        .start_playback(path.to_str().unwrap(), sink.clone())
        .err()
        .expect("start must fail");
    assert_eq!(err.kind(), "transcode_start_failed");

    match events.recv_timeout(EVENT_TIMEOUT).unwrap() {
        SessionEvent::Failed { phase, error, report, .. } => {
            assert_eq!(phase, SessionPhase::Transcoding);
            assert_eq!(error, err);
            assert!(report.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!sink.has_producer());
    assert!(sink.is_empty());
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_unresolvable_source_fails_while_fetching() {
    let controller = PipelineController::new(passthrough());
    let events = controller.subscribe();
    let sink = Arc::new(OutboundSink::new("voice", 4));

    let err = controller
        .start_playback("ftp://example.org/song.mp3", sink.clone())
        .err()
        .expect("ftp is not supported");
    assert!(matches!(err, PipelineError::SourceUnresolvable { .. }));

    match events.recv_timeout(EVENT_TIMEOUT).unwrap() {
        SessionEvent::Failed { phase, .. } => assert_eq!(phase, SessionPhase::Fetching),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!sink.has_producer());
}

#[test]
fn test_stop_mid_stream_reaps_processes() {
    let mut cfg = passthrough();
    cfg.frame = FrameGeometry::default();
    let bound = cfg.frame.frame_duration() * 2;
    // two minutes of audio, far more than the pipe buffers
    let path = write_temp_pcm("long", &pcm_fixture(cfg.frame.frame_bytes() * 6_000)).unwrap();

    let controller = PipelineController::new(cfg);
    let events = controller.subscribe();
    let sink = Arc::new(OutboundSink::new("voice", 8));

    let handle = controller
        .start_playback(path.to_str().unwrap(), sink.clone())
        .unwrap();
    assert_eq!(handle.phase(), SessionPhase::Streaming);
    let pids = handle.child_pids();

    std::thread::sleep(Duration::from_millis(100));
    let stop_at = Instant::now();
    controller.stop_playback(&handle);

    let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
    let elapsed = stop_at.elapsed();
    let state = handle.wait();

    assert!(matches!(
        event,
        SessionEvent::Stopped { ref report, .. } if report.end == PaceEnd::Stopped
    ));
    assert_eq!(state, SessionState::Stopped);
    assert!(elapsed <= bound, "stop took {:?}", elapsed);
    assert!(!sink.has_producer());
    if cfg!(target_os = "linux") {
        assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    }
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_stop_is_idempotent() {
    let cfg = passthrough();
    let path = write_temp_pcm("idem", &pcm_fixture(cfg.frame.frame_bytes() * 3_000)).unwrap();

    let controller = PipelineController::new(cfg);
    let sink = Arc::new(OutboundSink::new("voice", 8));
    let handle = controller
        .start_playback(path.to_str().unwrap(), sink)
        .unwrap();

    handle.stop();
    handle.stop();
    controller.stop_playback(&handle);
    assert_eq!(handle.wait(), SessionState::Stopped);
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_busy_sink_is_unavailable() {
    let cfg = passthrough();
    let path = write_temp_pcm("busy", &pcm_fixture(cfg.frame.frame_bytes() * 3_000)).unwrap();

    let controller = PipelineController::new(cfg);
    let sink = Arc::new(OutboundSink::new("voice", 8));
    let first = controller
        .start_playback(path.to_str().unwrap(), sink.clone())
        .unwrap();

    let err = controller
        .start_playback(path.to_str().unwrap(), sink.clone())
        .err()
        .expect("sink already has a producer");
    assert!(matches!(err, PipelineError::VoiceChannelUnavailable { .. }));

    first.stop();
    first.wait();

    // released on cleanup, a new session may take over
    let second = controller
        .start_playback(path.to_str().unwrap(), sink.clone())
        .unwrap();
    second.stop();
    assert_eq!(second.wait(), SessionState::Stopped);

    sink.close();
    let err = controller
        .start_playback(path.to_str().unwrap(), sink)
        .err()
        .expect("sink is closed");
    assert!(matches!(err, PipelineError::VoiceChannelUnavailable { .. }));
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_transcoder_abnormal_exit_fails_session() {
    let cfg = relay_config("sh", &["-c", "head -c 3840; exit 3"]);
    let path = write_temp_pcm("abnormal", &pcm_fixture(cfg.frame.frame_bytes() * 10)).unwrap();

    let controller = PipelineController::new(cfg);
    let events = controller.subscribe();
    let sink = Arc::new(OutboundSink::new("voice", 16));
    let handle = controller
        .start_playback(path.to_str().unwrap(), sink.clone())
        .unwrap();

    let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
    match event {
        SessionEvent::Failed {
            phase,
            error,
            report,
            ..
        } => {
            assert_eq!(phase, SessionPhase::Streaming);
            assert_eq!(error, PipelineError::TranscodeAbnormalExit { code: Some(3) });
            // frames already delivered stay delivered
            assert_eq!(report.map(|r| r.frames_sent), Some(2));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        handle.wait(),
        SessionState::Failed(PipelineError::TranscodeAbnormalExit { code: Some(3) })
    );
    assert_eq!(sink.len(), 2);
    let _ = std::fs::remove_file(path);
}
