// crates/playback-types/src/event.rs
//
// Event / EventKind: the data contract the Controller publishes through the
// event dispatcher. The original library modeled this as a class hierarchy
// (EventArgs, StreamEventArgs, DecoderEventArgs, SeekEventArgs,
// RecordingEventArgs); here it's one tagged enum, which is the idiomatic
// equivalent and lets listeners match exhaustively.

use std::time::SystemTime;

/// Which stream kind an event or operation concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Fixed set of event kinds the Controller publishes. Every payload carries
/// its own kind-specific fields; the common timestamp/source/description/
/// error fields live on the enclosing `Event`.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    // ── Stream lifecycle ──────────────────────────────────────────────────
    StreamOpening { path: String },
    StreamOpened { path: String },
    StreamClose,
    StreamClosed,
    StreamReadData,
    StreamReadError,
    StreamReadRecovery,
    StreamEnded,
    StreamOpenFailed { path: String },

    // ── Decoder lifecycle ─────────────────────────────────────────────────
    DecoderCreateSuccess { kind: MediaKind, codec_name: String, stream_index: usize },
    DecoderCreateFailed { kind: MediaKind },
    DecoderDestroy { kind: MediaKind },
    DecoderStarted { kind: MediaKind, hw: bool },
    DecoderStopped { kind: MediaKind },
    DecoderPaused { kind: MediaKind },
    DecodeFirstFrame { kind: MediaKind },
    DecodeError { kind: MediaKind },
    DecodeRecovery { kind: MediaKind },

    // ── Seek ───────────────────────────────────────────────────────────────
    SeekStarted { target_position: f64 },
    SeekSuccess { current_position: f64, target_position: f64 },
    SeekFailed { target_position: f64 },

    // ── Recording ──────────────────────────────────────────────────────────
    RecordingStarted { output_path: String, format: String },
    RecordingStopped { output_path: String },
    RecordingError { output_path: String },

    // ── Pre-buffer gate ─────────────────────────────────────────────────────
    PreBufferReady,

    // ── Reconnect ────────────────────────────────────────────────────────────
    ReconnectAttempt { attempt: u32 },
    ReconnectGiveUp,
}

/// One published event: the common envelope plus a kind-specific payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub timestamp: SystemTime,
    /// Free-form tag identifying the emitting component (e.g. `"demuxer"`).
    pub source: String,
    pub description: String,
    /// 0 = no error.
    pub error_code: i32,
    pub error_message: String,
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: impl Into<String>, description: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source: source.into(),
            description: description.into(),
            error_code: 0,
            error_message: String::new(),
            kind,
        }
    }

    pub fn with_error(mut self, code: i32, message: impl Into<String>) -> Self {
        self.error_code = code;
        self.error_message = message.into();
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_has_no_error() {
        let e = Event::new("demuxer", "opened source", EventKind::StreamOpened { path: "x.mp4".into() });
        assert!(!e.is_error());
    }

    #[test]
    fn with_error_sets_code_and_message() {
        let e = Event::new("demuxer", "read failed", EventKind::StreamReadError)
            .with_error(-5, "I/O error");
        assert!(e.is_error());
        assert_eq!(e.error_code, -5);
    }
}
