use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn utc_ns_now() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_secs() * 1_000_000_000 + d.subsec_nanos() as u64
}

/// Human readable playback position for `frames` frames of `frame_duration`.
pub fn format_position(frames: u64, frame_duration: Duration) -> String {
    let total_ms = frames as u128 * frame_duration.as_millis();
    let secs = total_ms / 1000;
    format!("{:02}:{:02}.{:03}", secs / 60, secs % 60, total_ms % 1000)
}
