// crates/playback-types/src/frame.rs
//
// Frame: owning wrapper around one decoded unit (video image planes, or audio
// samples), plus the derived fields the sync layer needs.

use std::sync::Arc;

use crate::Serial;

/// Video- or audio-specific format descriptors. `Frame` carries exactly one.
#[derive(Clone, Debug)]
pub enum FrameFormat {
    Video {
        width: u32,
        height: u32,
        pixel_format: i32,
    },
    Audio {
        sample_rate: u32,
        channels: u32,
        sample_format: i32,
        nb_samples: usize,
    },
}

/// A decoded frame, owning its sample/pixel data.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Arc<[u8]>,
    pub format: FrameFormat,
    /// Epoch this frame was produced in.
    pub serial: Serial,
    pub pts_seconds: f64,
    pub duration_seconds: f64,
    /// Set when the frame's backing storage still lives in GPU memory
    /// (hardware-accelerated decode that was not mapped to system memory).
    pub is_hw: bool,
}

impl Frame {
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        format: FrameFormat,
        serial: Serial,
        pts_seconds: f64,
        duration_seconds: f64,
        is_hw: bool,
    ) -> Self {
        Self {
            data: data.into(),
            format,
            serial,
            pts_seconds,
            duration_seconds,
            is_hw,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_video(&self) -> bool {
        matches!(self.format, FrameFormat::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.format, FrameFormat::Audio { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_reports_kind() {
        let f = Frame::new(
            vec![0u8; 4],
            FrameFormat::Video { width: 2, height: 2, pixel_format: 0 },
            1,
            0.0,
            1.0 / 30.0,
            false,
        );
        assert!(f.is_video());
        assert!(!f.is_audio());
    }
}
