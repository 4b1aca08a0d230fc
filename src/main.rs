// src/main.rs
//
// Plays one URL into an outbound sink and writes the paced PCM frames to
// stdout, e.g. `voice-relay relay.toml <url> | aplay -f S16_LE -r 48000 -c 2`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam::channel::RecvTimeoutError;
use log::{debug, error, info, warn};

use voice_relay::config;
use voice_relay::io::pcm_pipe_out::run_pcm_pipe_out;
use voice_relay::{OutboundSink, PipelineController, SessionEvent};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "relay.toml".into());
    let url = std::env::args()
        .nth(2)
        .context("usage: voice-relay <config.toml> <url>")?;

    let cfg = config::load(&cfg_path)?;
    info!("[relay] loaded {}", cfg_path);

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        ctrlc::set_handler(move || {
            info!("[relay] shutdown requested");
            r.store(false, Ordering::SeqCst);
        })?;
    }

    // ------------------------------------------------------------
    // Sink + drain
    // ------------------------------------------------------------
    let sink = OutboundSink::from_config("stdout", &cfg.sink);
    let draining = Arc::new(AtomicBool::new(true));
    let drain = {
        let sink = sink.clone();
        let draining = draining.clone();
        std::thread::Builder::new()
            .name("pcm-pipe-out".into())
            .spawn(move || run_pcm_pipe_out(sink, std::io::stdout().lock(), draining))?
    };

    // ------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------
    let controller = PipelineController::new(cfg);
    let events = controller.subscribe();
    let handle = controller.start_playback(&url, sink.clone())?;
    info!("[relay] session {} streaming – Ctrl+C to stop", handle.id());

    let mut last_stats = Instant::now();
    let mut stop_sent = false;

    let outcome = loop {
        if !running.load(Ordering::SeqCst) && !stop_sent {
            controller.stop_playback(&handle);
            stop_sent = true;
        }

        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) if event.session_id() == handle.id() => break event,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("event channel closed"),
        }

        if last_stats.elapsed() >= Duration::from_secs(5) {
            let stats = sink.stats();
            debug!(
                "[relay] sink len={}/{} enqueued={} dropped={}",
                stats.len, stats.capacity, stats.enqueued, stats.dropped
            );
            last_stats = Instant::now();
        }
    };

    handle.wait();

    // ------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------
    // let the consumer play out what is still queued
    while !sink.is_empty() && running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(20));
    }
    draining.store(false, Ordering::SeqCst);
    match drain.join() {
        Ok(Ok(frames)) => debug!("[relay] drain wrote {} frames", frames),
        Ok(Err(e)) => warn!("[relay] drain failed: {}", e),
        Err(_) => warn!("[relay] drain thread panicked"),
    }

    match outcome {
        SessionEvent::Stopped { report, .. } => {
            info!(
                "[relay] stopped: sent={} dropped={} ({:?})",
                report.frames_sent, report.frames_dropped, report.end
            );
            Ok(())
        }
        SessionEvent::Failed { phase, error, .. } => {
            error!("[relay] failed while {}: {}", phase.as_str(), error);
            Err(error.into())
        }
    }
}
