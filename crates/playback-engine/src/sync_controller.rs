// crates/playback-engine/src/sync_controller.rs
//
// SyncController: owns the audio/video/external Clocks, picks a master, and
// computes the frame-rate-controlled scheduling delay for video. Audio never
// throttles itself (the resampler speed change is what keeps it time-
// accurate); video either free-runs or, with frame-rate control enabled,
// asks this controller how long to sleep before the next frame.

use std::sync::{Arc, Mutex};

use crate::clock::{monotonic_seconds, Clock, NO_SYNC_THRESHOLD};

const SYNC_THRESHOLD_FLOOR: f64 = 0.01;
const MAX_FRAME_DURATION: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterClock {
    Audio,
    Video,
    External,
}

struct TimerState {
    last_frame_pts: f64,
    frame_timer: f64,
}

/// Coordinates the audio/video/external clocks. Not every slot is populated
/// for every session — a video-only source never sets an audio clock, and
/// `get_master_clock` falls back to whichever clock exists.
pub struct SyncController {
    master: Mutex<MasterClock>,
    audio_clock: Mutex<Option<Arc<Clock>>>,
    video_clock: Mutex<Option<Arc<Clock>>>,
    external_clock: Mutex<Option<Arc<Clock>>>,
    timer: Mutex<TimerState>,
}

impl SyncController {
    pub fn new() -> Self {
        Self {
            master: Mutex::new(MasterClock::Audio),
            audio_clock: Mutex::new(None),
            video_clock: Mutex::new(None),
            external_clock: Mutex::new(None),
            timer: Mutex::new(TimerState { last_frame_pts: 0.0, frame_timer: 0.0 }),
        }
    }

    pub fn set_master_clock_type(&self, kind: MasterClock) {
        *self.master.lock().unwrap() = kind;
    }

    pub fn master_clock_type(&self) -> MasterClock {
        *self.master.lock().unwrap()
    }

    pub fn set_audio_clock(&self, clock: Arc<Clock>) {
        *self.audio_clock.lock().unwrap() = Some(clock);
    }

    pub fn set_video_clock(&self, clock: Arc<Clock>) {
        *self.video_clock.lock().unwrap() = Some(clock);
    }

    pub fn set_external_clock(&self, clock: Arc<Clock>) {
        *self.external_clock.lock().unwrap() = Some(clock);
    }

    /// The clock currently chosen as master, falling back to audio's slot
    /// (which may itself be unset) on an unrecognized selector.
    pub fn get_master_clock(&self) -> Option<Arc<Clock>> {
        match *self.master.lock().unwrap() {
            MasterClock::Audio => self.audio_clock.lock().unwrap().clone(),
            MasterClock::Video => self.video_clock.lock().unwrap().clone(),
            MasterClock::External => self.external_clock.lock().unwrap().clone(),
        }
    }

    /// Re-anchor the video clock to the master, unless video already is the
    /// master.
    pub fn sync_video_to_master(&self) {
        let video = self.video_clock.lock().unwrap().clone();
        let master = self.get_master_clock();
        if let (Some(video), Some(master)) = (video, master) {
            if !Arc::ptr_eq(&video, &master) {
                video.sync_to(&master);
            }
        }
    }

    /// Re-anchor the audio clock to the master, unless audio already is the
    /// master.
    pub fn sync_audio_to_master(&self) {
        let audio = self.audio_clock.lock().unwrap().clone();
        let master = self.get_master_clock();
        if let (Some(audio), Some(master)) = (audio, master) {
            if !Arc::ptr_eq(&audio, &master) {
                audio.sync_to(&master);
            }
        }
    }

    /// How long (seconds) the video decoder should wait before displaying a
    /// frame with presentation time `pts` and nominal `duration`, so that it
    /// lands in step with the master clock. Stateful: tracks the previous
    /// frame's PTS and a running frame timer across calls, so this must be
    /// called once per frame in presentation order.
    pub fn compute_video_delay(&self, pts: f64, duration: f64) -> f64 {
        let mut timer = self.timer.lock().unwrap();

        if timer.last_frame_pts == 0.0 {
            timer.last_frame_pts = pts;
            timer.frame_timer = monotonic_seconds();
            return 0.0;
        }

        let mut diff = pts - timer.last_frame_pts;
        if diff <= 0.0 || diff >= MAX_FRAME_DURATION {
            diff = duration;
        }
        timer.last_frame_pts = pts;

        self.sync_video_to_master();
        self.sync_audio_to_master();

        let sync_threshold = SYNC_THRESHOLD_FLOOR.max(duration);
        let current_time = monotonic_seconds();

        let delay = if let Some(master) = self.get_master_clock() {
            let clock_diff = pts - master.get();
            if !clock_diff.is_nan() && clock_diff.abs() < NO_SYNC_THRESHOLD {
                if clock_diff <= -sync_threshold {
                    0.0
                } else if clock_diff >= sync_threshold {
                    2.0 * duration
                } else {
                    duration
                }
            } else {
                duration
            }
        } else {
            duration
        };

        timer.frame_timer += delay;
        let mut actual_delay = timer.frame_timer - current_time;
        if actual_delay < 0.0 {
            actual_delay = 0.0;
            timer.frame_timer = current_time;
        }
        let _ = diff;
        actual_delay
    }

    /// Reset the frame timer and invalidate every populated clock, as done
    /// around a seek.
    pub fn reset_clocks(&self) {
        let mut timer = self.timer.lock().unwrap();
        timer.frame_timer = 0.0;
        timer.last_frame_pts = 0.0;
        drop(timer);

        if let Some(c) = self.audio_clock.lock().unwrap().as_ref() {
            c.init();
        }
        if let Some(c) = self.video_clock.lock().unwrap().as_ref() {
            c.init();
        }
        if let Some(c) = self.external_clock.lock().unwrap().as_ref() {
            c.init();
        }
    }
}

impl Default for SyncController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_primes_timer_and_returns_zero() {
        let sync = SyncController::new();
        assert_eq!(sync.compute_video_delay(1.0, 1.0 / 30.0), 0.0);
    }

    #[test]
    fn no_master_clock_falls_back_to_duration() {
        let sync = SyncController::new();
        sync.compute_video_delay(1.0, 1.0 / 30.0);
        let delay = sync.compute_video_delay(1.0 + 1.0 / 30.0, 1.0 / 30.0);
        assert!(delay >= 0.0);
    }

    #[test]
    fn master_clock_defaults_to_audio_slot() {
        let sync = SyncController::new();
        assert!(sync.get_master_clock().is_none());
        let audio = Arc::new(Clock::new(|| 0));
        sync.set_audio_clock(Arc::clone(&audio));
        assert!(Arc::ptr_eq(&sync.get_master_clock().unwrap(), &audio));
    }

    #[test]
    fn reset_clocks_invalidates_populated_clocks() {
        let sync = SyncController::new();
        let video = Arc::new(Clock::new(|| 0));
        video.set(1.0, 0);
        sync.set_video_clock(Arc::clone(&video));
        sync.reset_clocks();
        assert!(video.get().is_nan());
    }

    #[test]
    fn sync_video_to_master_is_noop_when_video_is_master() {
        let sync = SyncController::new();
        let video = Arc::new(Clock::new(|| 0));
        video.set(2.0, 0);
        sync.set_video_clock(Arc::clone(&video));
        sync.set_master_clock_type(MasterClock::Video);
        sync.sync_video_to_master();
        assert_eq!(video.get(), 2.0);
    }

    #[test]
    fn compute_video_delay_resyncs_stale_video_clock_to_master() {
        let sync = SyncController::new();
        let audio = Arc::new(Clock::new(|| 0));
        audio.set(5.0, 0);
        sync.set_audio_clock(Arc::clone(&audio));
        sync.set_master_clock_type(MasterClock::Audio);

        let video = Arc::new(Clock::new(|| 0));
        sync.set_video_clock(Arc::clone(&video));
        assert!(video.get().is_nan());

        sync.compute_video_delay(1.0, 1.0 / 30.0);
        sync.compute_video_delay(1.0 + 1.0 / 30.0, 1.0 / 30.0);

        assert!(!video.get().is_nan());
    }
}
