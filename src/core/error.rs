use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Terminal and precondition failures of a playback session.
///
/// Details are kept as strings so the error can be cloned into
/// [`SessionEvent`](crate::pipeline::SessionEvent)s and handed to several
/// observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("source '{url}' could not be resolved: {reason}")]
    SourceUnresolvable { url: String, reason: String },
    #[error("source '{url}' offers no audio-capable format")]
    NoAudioFormatAvailable { url: String },
    #[error("transcoder '{program}' failed to start: {reason}")]
    TranscodeStartFailed { program: String, reason: String },
    #[error("transcoder exited abnormally ({})", describe_exit(*.code))]
    TranscodeAbnormalExit { code: Option<i32> },
    #[error("pcm stream read failed: {reason}")]
    StreamReadError { reason: String },
    #[error("voice channel unavailable: {reason}")]
    VoiceChannelUnavailable { reason: String },
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },
}

impl PipelineError {
    pub fn unresolvable(url: &str, reason: impl Into<String>) -> Self {
        Self::SourceUnresolvable {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transcode_start(program: &str, reason: impl ToString) -> Self {
        Self::TranscodeStartFailed {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn read(reason: impl ToString) -> Self {
        Self::StreamReadError {
            reason: reason.to_string(),
        }
    }

    pub fn channel_unavailable(reason: impl Into<String>) -> Self {
        Self::VoiceChannelUnavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Short machine-friendly label, used in log lines and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnresolvable { .. } => "source_unresolvable",
            Self::NoAudioFormatAvailable { .. } => "no_audio_format",
            Self::TranscodeStartFailed { .. } => "transcode_start_failed",
            Self::TranscodeAbnormalExit { .. } => "transcode_abnormal_exit",
            Self::StreamReadError { .. } => "stream_read_error",
            Self::VoiceChannelUnavailable { .. } => "voice_channel_unavailable",
            Self::InvalidFrame { .. } => "invalid_frame",
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
