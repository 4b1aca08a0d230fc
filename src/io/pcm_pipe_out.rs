use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use crate::ring::OutboundSink;

const IDLE_POLL: Duration = Duration::from_millis(2);

/// Drains `sink` into `out` as raw PCM until `running` is cleared or the
/// reader closes the pipe. Returns the number of frames written.
pub fn run_pcm_pipe_out<W: Write>(
    sink: Arc<OutboundSink>,
    mut out: W,
    running: Arc<AtomicBool>,
) -> anyhow::Result<u64> {
    let mut written = 0u64;

    while running.load(Ordering::SeqCst) {
        let Some(frame) = sink.dequeue() else {
            std::thread::sleep(IDLE_POLL);
            continue;
        };

        if let Err(e) = out.write_all(frame.bytes()).and_then(|_| out.flush()) {
            if e.kind() == io::ErrorKind::BrokenPipe {
                info!("[pcm_pipe] downstream closed pipe");
                return Ok(written);
            }
            return Err(e.into());
        }
        written += 1;
    }

    let stats = sink.stats();
    if stats.dropped > 0 {
        warn!(
            "[pcm_pipe] {} frames written, sink dropped {}",
            written, stats.dropped
        );
    } else {
        debug!("[pcm_pipe] {} frames written", written);
    }
    Ok(written)
}
