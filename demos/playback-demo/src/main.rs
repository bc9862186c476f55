// demos/playback-demo/src/main.rs
//
// Console exerciser for playback-engine: opens a URL, starts decode with
// audio as the master clock and frame-rate control on, and drains both
// frame queues directly (the way an embedder without a UI event loop would)
// while tracking FPS and timestamp continuity. Runs for a fixed duration or
// frame budget, then tears down and prints a summary.

use std::env;
use std::time::{Duration, Instant};

use tracing::{error, info};

use playback_engine::{Controller, PlaybackState, Timeout};
use playback_types::{Config, FrameFormat};

const MAX_FRAMES: u64 = 10_000;
const TEST_DURATION: Duration = Duration::from_secs(30);
const QUEUE_POLL: Timeout = Timeout(5);

/// Tracks a rolling one-second frame rate, matching the simple
/// reset-every-second counter an embedder's status bar would show.
struct FpsCounter {
    window_start: Instant,
    frames_this_window: u32,
    fps: f64,
}

impl FpsCounter {
    fn new() -> Self {
        Self { window_start: Instant::now(), frames_this_window: 0, fps: 0.0 }
    }

    fn tick(&mut self) {
        self.frames_this_window += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.fps = self.frames_this_window as f64 / elapsed.as_secs_f64();
            self.frames_this_window = 0;
            self.window_start = Instant::now();
        }
    }

    fn fps(&self) -> f64 {
        self.fps
    }
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    ffmpeg_the_third::init().expect("FFmpeg init failed");

    let url = env::args().nth(1).unwrap_or_else(|| "test.mp4".to_string());
    info!(url, "starting decode test");

    let mut config = Config::default();
    config.enable_frame_rate_control = true;

    let controller = Controller::new(config);
    let open_start = Instant::now();
    if let Err(e) = controller.open(&url, config) {
        error!(error = %e, url, "failed to open source");
        std::process::exit(1);
    }
    info!(ms = open_start.elapsed().as_millis(), "source opened");

    if let Err(e) = controller.start_decode() {
        error!(error = %e, "failed to start decode");
        controller.close();
        std::process::exit(1);
    }

    let video_queue = controller.video_frame_queue();
    let audio_queue = controller.audio_frame_queue();

    let mut last_video_pts: Option<f64> = None;
    let mut last_audio_pts: Option<f64> = None;
    let mut video_frame_count: u64 = 0;
    let mut audio_frame_count: u64 = 0;
    let mut discontinuities: u64 = 0;
    let mut total_frames: u64 = 0;

    let mut video_fps = FpsCounter::new();
    let mut audio_fps = FpsCounter::new();

    let test_start = Instant::now();

    while total_frames < MAX_FRAMES && test_start.elapsed() < TEST_DURATION && controller.state() != PlaybackState::Closed {
        let mut got_any = false;

        if let Some(queue) = &video_queue {
            if let Some(frame) = queue.pop(QUEUE_POLL) {
                got_any = true;
                video_fps.tick();

                if let Some(last) = last_video_pts {
                    if frame.pts_seconds <= last {
                        info!(current = frame.pts_seconds, previous = last, "video pts went backwards");
                        discontinuities += 1;
                    }
                }
                last_video_pts = Some(frame.pts_seconds);

                if video_frame_count % 100 == 0 {
                    if let FrameFormat::Video { width, height, pixel_format } = frame.format {
                        info!(
                            frame = video_frame_count,
                            width,
                            height,
                            pixel_format,
                            pts = frame.pts_seconds,
                            hw = frame.is_hw,
                            "video frame"
                        );
                    }
                }
                video_frame_count += 1;
            }
        }

        if let Some(queue) = &audio_queue {
            if let Some(frame) = queue.pop(QUEUE_POLL) {
                got_any = true;
                audio_fps.tick();

                if let Some(last) = last_audio_pts {
                    if frame.pts_seconds <= last {
                        info!(current = frame.pts_seconds, previous = last, "audio pts went backwards");
                        discontinuities += 1;
                    }
                }
                last_audio_pts = Some(frame.pts_seconds);

                if audio_frame_count % 500 == 0 {
                    if let FrameFormat::Audio { sample_rate, channels, nb_samples, .. } = frame.format {
                        info!(frame = audio_frame_count, sample_rate, channels, nb_samples, pts = frame.pts_seconds, "audio frame");
                    }
                }
                audio_frame_count += 1;
            }
        }

        if !got_any {
            std::thread::sleep(Duration::from_millis(1));
        }

        total_frames += 1;
        if total_frames % 100 == 0 {
            info!(
                elapsed_s = test_start.elapsed().as_secs(),
                video_frames = video_frame_count,
                video_fps = video_fps.fps(),
                audio_frames = audio_frame_count,
                audio_fps = audio_fps.fps(),
                discontinuities,
                "decode status"
            );
        }
    }

    let total = test_start.elapsed();
    info!(
        total_s = total.as_secs_f64(),
        video_frames = video_frame_count,
        video_avg_fps = video_frame_count as f64 / total.as_secs_f64(),
        audio_frames = audio_frame_count,
        audio_avg_fps = audio_frame_count as f64 / total.as_secs_f64(),
        discontinuities,
        "decode test complete"
    );

    controller.close();
}
