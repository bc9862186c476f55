// crates/playback-engine/src/controller.rs
//
// Controller: the orchestration hub. Owns the Demuxer, both decoders, the
// SyncController, the Recorder and the EventDispatcher, and drives the state
// machine spec'd as Closed -> Opened -> Decoding <-> {Paused, Seeking,
// Reconnecting}. Everything else in this crate is a worker thread reacting
// to queue state; this is the only component that sequences them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use playback_types::{Config, Error, Event, EventKind, MediaKind};

use crate::demuxer::Demuxer;
use crate::event_dispatcher::{ConnectionType, EventDispatcher, ListenerHandle};
use crate::frame_queue::FrameQueue;
use crate::pre_buffer::{thresholds_met, PreBufferGate, POLL_INTERVAL};
use crate::recorder::Recorder;
use crate::sync_controller::{MasterClock, SyncController};
use crate::{audio_decoder::AudioDecoder, video_decoder::VideoDecoder};

/// `Closed -> Opened -> Decoding <-> {Paused, Seeking, Reconnecting}`, as laid
/// out in spec.md's Controller component. `Reconnecting` is observable via
/// [`Controller::state`] but is driven entirely by the reconnect supervisor
/// thread, not by a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Closed,
    Opened,
    Decoding,
    Paused,
    Seeking,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncOpenStatus {
    Success,
    Failed,
    Cancelled,
}

/// Delivered exactly once to the callback passed to [`Controller::open_async`].
#[derive(Clone, Debug)]
pub struct AsyncOpenResult {
    pub status: AsyncOpenStatus,
    pub open_success: bool,
    pub message: String,
}

struct Shared {
    events: Arc<EventDispatcher>,
    demuxer: Arc<Demuxer>,
    sync: Arc<SyncController>,
    recorder: Arc<Recorder>,
    video_decoder: Mutex<Option<Arc<VideoDecoder>>>,
    audio_decoder: Mutex<Option<Arc<AudioDecoder>>>,
    config: Mutex<Config>,
    state: Mutex<PlaybackState>,
    url: Mutex<String>,

    pre_buffer_gate: Mutex<Arc<PreBufferGate>>,
    pre_buffer_watcher: Mutex<Option<JoinHandle<()>>>,
    pre_buffer_stop: AtomicBool,

    reconnect_stop: Arc<AtomicBool>,
    reconnecting: AtomicBool,
    reconnect_thread: Mutex<Option<JoinHandle<()>>>,

    async_open_cancel: Arc<AtomicBool>,
    async_open_in_progress: AtomicBool,
    async_open_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Orchestrates open/close/start/stop/seek/speed/reconnect/record. Uniquely
/// owns the Demuxer, the SyncController, both decoders, the Recorder and the
/// EventDispatcher; everything downstream of it observes queues and clocks
/// through non-owning `Arc` handles obtained here.
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        let events = Arc::new(EventDispatcher::new());
        let shared = Arc::new(Shared {
            demuxer: Arc::new(Demuxer::new(Arc::clone(&events))),
            sync: Arc::new(SyncController::new()),
            recorder: Arc::new(Recorder::new(Arc::clone(&events))),
            events,
            video_decoder: Mutex::new(None),
            audio_decoder: Mutex::new(None),
            config: Mutex::new(config),
            state: Mutex::new(PlaybackState::Closed),
            url: Mutex::new(String::new()),
            pre_buffer_gate: Mutex::new(Arc::new(PreBufferGate::open_gate())),
            pre_buffer_watcher: Mutex::new(None),
            pre_buffer_stop: AtomicBool::new(false),
            reconnect_stop: Arc::new(AtomicBool::new(false)),
            reconnecting: AtomicBool::new(false),
            reconnect_thread: Mutex::new(None),
            async_open_cancel: Arc::new(AtomicBool::new(false)),
            async_open_in_progress: AtomicBool::new(false),
            async_open_thread: Mutex::new(None),
        });

        let reconnect_target = Arc::clone(&shared);
        shared.events.subscribe(&EventKind::StreamReadError, ConnectionType::Auto, move |_event| {
            maybe_start_reconnect(&reconnect_target);
        });

        Self { shared }
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock().unwrap()
    }

    pub fn events(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.shared.events)
    }

    pub fn subscribe(
        &self,
        sample: &EventKind,
        connection: ConnectionType,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.events.subscribe(sample, connection, listener)
    }

    pub fn subscribe_global(
        &self,
        connection: ConnectionType,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.events.subscribe_global(connection, listener)
    }

    pub fn url(&self) -> String {
        self.shared.url.lock().unwrap().clone()
    }

    pub fn has_video(&self) -> bool {
        self.shared.demuxer.has_video()
    }

    pub fn has_audio(&self) -> bool {
        self.shared.demuxer.has_audio()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recorder.is_recording()
    }

    pub fn video_frame_queue(&self) -> Option<Arc<FrameQueue>> {
        self.shared.video_decoder.lock().unwrap().as_ref().map(|d| d.frame_queue())
    }

    pub fn audio_frame_queue(&self) -> Option<Arc<FrameQueue>> {
        self.shared.audio_decoder.lock().unwrap().as_ref().map(|d| d.frame_queue())
    }

    /// Blocking open. Validates `config`, opens `url` on the Demuxer, and
    /// transitions `Closed -> Opened` on success. Cancels any in-flight
    /// reconnect supervisor first, since a fresh open supersedes it.
    pub fn open(&self, url: &str, config: Config) -> Result<(), Error> {
        config.validate()?;
        self.stop_reconnect();

        *self.shared.config.lock().unwrap() = config;
        *self.shared.url.lock().unwrap() = url.to_string();

        let is_realtime = is_realtime_url(url);
        if self.shared.demuxer.open(url, is_realtime, false) {
            *self.shared.state.lock().unwrap() = PlaybackState::Opened;
            Ok(())
        } else {
            Err(Error::IoOpenFailed { path: url.to_string(), message: "demuxer open failed".into() })
        }
    }

    /// Runs `open` on a worker thread. `callback` fires exactly once: with
    /// `Cancelled` if [`Controller::cancel_async_open`] was observed before
    /// or immediately after the blocking open; with `Success`/`Failed`
    /// otherwise. A success that arrives after cancellation is unwound by
    /// closing the partially-opened source before reporting `Cancelled`.
    pub fn open_async(
        &self,
        url: String,
        config: Config,
        callback: impl FnOnce(AsyncOpenResult) + Send + 'static,
    ) {
        self.shared.async_open_cancel.store(false, Ordering::Release);
        self.shared.async_open_in_progress.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            if shared.async_open_cancel.load(Ordering::Acquire) {
                shared.async_open_in_progress.store(false, Ordering::Release);
                callback(AsyncOpenResult {
                    status: AsyncOpenStatus::Cancelled,
                    open_success: false,
                    message: "cancelled before open started".into(),
                });
                return;
            }

            let controller = Controller { shared: Arc::clone(&shared) };
            let result = controller.open(&url, config);
            let cancelled = shared.async_open_cancel.load(Ordering::Acquire);
            shared.async_open_in_progress.store(false, Ordering::Release);

            if cancelled {
                let open_success = result.is_ok();
                if open_success {
                    controller.close();
                }
                callback(AsyncOpenResult {
                    status: AsyncOpenStatus::Cancelled,
                    open_success,
                    message: "open cancelled".into(),
                });
                return;
            }

            match result {
                Ok(()) => callback(AsyncOpenResult {
                    status: AsyncOpenStatus::Success,
                    open_success: true,
                    message: String::new(),
                }),
                Err(e) => callback(AsyncOpenResult {
                    status: AsyncOpenStatus::Failed,
                    open_success: false,
                    message: e.to_string(),
                }),
            }
        });
        *self.shared.async_open_thread.lock().unwrap() = Some(handle);
    }

    /// Signal cancellation to an in-flight `open_async`. Non-blocking: the
    /// worker thread observes the flag at its own checkpoints and reports
    /// `Cancelled` to the callback; this call does not join it, so it is
    /// always safe to call from inside that same callback.
    pub fn cancel_async_open(&self) {
        self.shared.async_open_cancel.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.stop_reconnect();
        self.cancel_async_open();
        self.stop_decode();
        if self.shared.demuxer.is_recording() {
            self.stop_recording();
        }
        self.shared.demuxer.close();
        *self.shared.state.lock().unwrap() = PlaybackState::Closed;
    }

    pub fn pause(&self) -> bool {
        if !self.shared.demuxer.pause() {
            return false;
        }
        if let Some(v) = self.shared.video_decoder.lock().unwrap().as_ref() {
            v.clock().set_paused(true);
            self.shared.events.dispatch(Event::new(
                "controller",
                "decoder paused",
                EventKind::DecoderPaused { kind: MediaKind::Video },
            ));
        }
        if let Some(a) = self.shared.audio_decoder.lock().unwrap().as_ref() {
            a.clock().set_paused(true);
            self.shared.events.dispatch(Event::new(
                "controller",
                "decoder paused",
                EventKind::DecoderPaused { kind: MediaKind::Audio },
            ));
        }
        *self.shared.state.lock().unwrap() = PlaybackState::Paused;
        true
    }

    pub fn resume(&self) -> bool {
        if !self.shared.demuxer.resume() {
            return false;
        }
        if let Some(v) = self.shared.video_decoder.lock().unwrap().as_ref() {
            v.clock().set_paused(false);
        }
        if let Some(a) = self.shared.audio_decoder.lock().unwrap().as_ref() {
            a.clock().set_paused(false);
        }
        *self.shared.state.lock().unwrap() = PlaybackState::Decoding;
        true
    }

    /// Creates decoders only for streams the demuxer actually detected,
    /// installs the pre-buffer gate (closed, with a watcher thread, when
    /// pre-buffering is enabled; otherwise always-open), sets the master
    /// clock, and starts the decoder threads.
    pub fn start_decode(&self) -> Result<(), Error> {
        let config = *self.shared.config.lock().unwrap();
        config.validate()?;

        let gate: Arc<PreBufferGate> = if config.pre_buffer.enabled {
            Arc::new(PreBufferGate::closed_gate())
        } else {
            Arc::new(PreBufferGate::open_gate())
        };
        *self.shared.pre_buffer_gate.lock().unwrap() = Arc::clone(&gate);
        self.shared.pre_buffer_stop.store(false, Ordering::Release);

        let has_video = self.shared.demuxer.has_video();
        let has_audio = self.shared.demuxer.has_audio();

        if has_video {
            let decoder = Arc::new(VideoDecoder::new(
                Arc::clone(&self.shared.events),
                Arc::clone(&self.shared.sync),
                config,
                self.shared.demuxer.video_queue(),
            ));
            decoder.set_pre_buffer_gate(Arc::clone(&gate));
            if decoder.open(&self.shared.demuxer) {
                *self.shared.video_decoder.lock().unwrap() = Some(decoder);
            } else {
                warn!("video decoder failed to open, continuing audio-only if possible");
            }
        }
        if has_audio {
            let decoder = Arc::new(AudioDecoder::new(
                Arc::clone(&self.shared.events),
                config,
                self.shared.demuxer.audio_queue(),
            ));
            decoder.set_pre_buffer_gate(Arc::clone(&gate));
            if decoder.open(&self.shared.demuxer) {
                self.shared.sync.set_audio_clock(decoder.clock());
                *self.shared.audio_decoder.lock().unwrap() = Some(decoder);
            } else {
                warn!("audio decoder failed to open, continuing video-only if possible");
            }
        }

        self.shared.sync.set_master_clock_type(if self.shared.audio_decoder.lock().unwrap().is_some() {
            MasterClock::Audio
        } else {
            MasterClock::Video
        });

        if config.pre_buffer.enabled {
            spawn_pre_buffer_watcher(Arc::clone(&self.shared));
        }

        if let Some(v) = self.shared.video_decoder.lock().unwrap().as_ref() {
            v.start(self.shared.demuxer.video_queue());
        }
        if let Some(a) = self.shared.audio_decoder.lock().unwrap().as_ref() {
            a.start(self.shared.demuxer.audio_queue());
        }

        *self.shared.state.lock().unwrap() = PlaybackState::Decoding;
        info!(has_video, has_audio, "decode started");
        Ok(())
    }

    pub fn stop_decode(&self) {
        self.shared.pre_buffer_stop.store(true, Ordering::Release);
        if let Some(handle) = self.shared.pre_buffer_watcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(v) = self.shared.video_decoder.lock().unwrap().take() {
            v.close();
        }
        if let Some(a) = self.shared.audio_decoder.lock().unwrap().take() {
            a.close();
        }
        let mut state = self.shared.state.lock().unwrap();
        if *state != PlaybackState::Closed {
            *state = PlaybackState::Opened;
        }
    }

    /// Serialized against decode: pauses the demuxer, seeks (which bumps
    /// both PacketQueue serials), tells both decoders where to drop frames
    /// from, resets every clock to NaN, and resumes. Rejected outright on a
    /// real-time source.
    pub fn seek(&self, position_seconds: f64) -> Result<(), Error> {
        if self.shared.demuxer.is_realtime() {
            return Err(Error::SeekUnsupported);
        }
        if *self.shared.state.lock().unwrap() == PlaybackState::Closed {
            return Err(Error::SeekFailed { target_seconds: position_seconds, message: "source is not open".into() });
        }

        self.shared.events.dispatch(Event::new(
            "controller",
            "seek started",
            EventKind::SeekStarted { target_position: position_seconds },
        ));
        *self.shared.state.lock().unwrap() = PlaybackState::Seeking;

        self.shared.demuxer.pause();
        let ok = self.shared.demuxer.seek(position_seconds);
        if !ok {
            self.shared.demuxer.resume();
            *self.shared.state.lock().unwrap() = PlaybackState::Decoding;
            self.shared.events.dispatch(Event::new(
                "controller",
                "seek failed",
                EventKind::SeekFailed { target_position: position_seconds },
            ));
            return Err(Error::SeekFailed { target_seconds: position_seconds, message: "demuxer seek failed".into() });
        }

        if let Some(v) = self.shared.video_decoder.lock().unwrap().as_ref() {
            v.set_seek_pos(position_seconds);
        }
        if let Some(a) = self.shared.audio_decoder.lock().unwrap().as_ref() {
            a.set_seek_pos(position_seconds);
        }
        self.shared.sync.reset_clocks();
        self.shared.demuxer.resume();

        *self.shared.state.lock().unwrap() = PlaybackState::Decoding;
        self.shared.events.dispatch(Event::new(
            "controller",
            "seek succeeded",
            EventKind::SeekSuccess { current_position: position_seconds, target_position: position_seconds },
        ));
        Ok(())
    }

    /// Rejected for real-time sources and for `speed <= 0`. Propagates to
    /// both decoders (each is itself a no-op if the value hasn't changed)
    /// and to stored configuration; the SyncController is speed-agnostic,
    /// it only ever reads whatever clock value the decoders produce.
    pub fn set_speed(&self, speed: f64) -> Result<(), Error> {
        if speed <= 0.0 {
            return Err(Error::ConfigInvalid { reason: format!("speed must be > 0, got {speed}") });
        }
        if self.shared.demuxer.is_realtime() {
            return Err(Error::ConfigInvalid { reason: "speed change is unsupported on a real-time source".into() });
        }

        self.shared.config.lock().unwrap().speed = speed;
        if let Some(v) = self.shared.video_decoder.lock().unwrap().as_ref() {
            v.set_speed(speed);
        }
        if let Some(a) = self.shared.audio_decoder.lock().unwrap().as_ref() {
            a.set_speed(speed);
        }
        Ok(())
    }

    pub fn start_recording(&self, path: &str) -> Result<(), Error> {
        let Some((streams, video_queue, audio_queue)) = self.shared.demuxer.start_recording() else {
            return Err(Error::RecordOpenFailed {
                path: path.to_string(),
                message: "demuxer is not open or already recording".into(),
            });
        };
        if !self.shared.recorder.start(path, streams, video_queue, audio_queue) {
            self.shared.demuxer.stop_recording();
            return Err(Error::RecordOpenFailed { path: path.to_string(), message: "recorder failed to open output".into() });
        }
        Ok(())
    }

    pub fn stop_recording(&self) {
        self.shared.recorder.stop();
        self.shared.demuxer.stop_recording();
    }

    /// Requests the reconnect supervisor (if one is running) to stop and
    /// joins it. Safe to call whether or not a supervisor is active.
    pub fn stop_reconnect(&self) {
        self.shared.reconnect_stop.store(true, Ordering::Release);
        if let Some(handle) = self.shared.reconnect_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::Acquire)
    }
}

/// A real-time transport per spec.md's list: RTSP/RTMP/UDP/SRT sources get
/// the demuxer's short-timeout, no-buffer, TCP-preferred option set and have
/// seek/speed rejected; a local file or an HTTP VOD URL does not.
fn is_realtime_url(url: &str) -> bool {
    const REALTIME_SCHEMES: &[&str] = &["rtsp://", "rtsps://", "rtmp://", "rtmps://", "udp://", "srt://"];
    REALTIME_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
}

fn maybe_start_reconnect(shared: &Arc<Shared>) {
    if !shared.config.lock().unwrap().enable_auto_reconnect {
        return;
    }
    if shared.reconnecting.swap(true, Ordering::AcqRel) {
        return;
    }
    shared.reconnect_stop.store(false, Ordering::Release);
    *shared.state.lock().unwrap() = PlaybackState::Reconnecting;

    let shared2 = Arc::clone(shared);
    let handle = thread::spawn(move || reconnect_loop(shared2));
    *shared.reconnect_thread.lock().unwrap() = Some(handle);
}

/// Loops `open(url, is_reopen=true)` with `reconnect_interval_ms` between
/// attempts, up to `max_reconnect_attempts` (-1 = forever). Sleeps in 100 ms
/// slices so [`Controller::stop_reconnect`] is observed within that bound
/// regardless of the configured interval.
fn reconnect_loop(shared: Arc<Shared>) {
    let mut attempts: u32 = 0;
    loop {
        let interval_ms = shared.config.lock().unwrap().reconnect_interval_ms;
        if !sleep_interruptible(&shared.reconnect_stop, interval_ms) {
            break;
        }

        attempts += 1;
        shared.events.dispatch(Event::new(
            "controller",
            "reconnect attempt",
            EventKind::ReconnectAttempt { attempt: attempts },
        ));

        let url = shared.url.lock().unwrap().clone();
        let is_realtime = shared.demuxer.is_realtime();
        if shared.demuxer.open(&url, is_realtime, true) {
            *shared.state.lock().unwrap() = PlaybackState::Decoding;
            break;
        }

        let max = shared.config.lock().unwrap().max_reconnect_attempts;
        if max >= 0 && attempts >= max as u32 {
            shared.events.dispatch(Event::new("controller", "reconnect attempts exhausted", EventKind::ReconnectGiveUp));
            break;
        }
    }
    shared.reconnecting.store(false, Ordering::Release);
}

/// Sleeps up to `total_ms` in 100 ms slices, returning `false` the moment
/// `stop` is observed set so the caller can distinguish "slept the full
/// interval" from "asked to stop partway through".
fn sleep_interruptible(stop: &AtomicBool, total_ms: u64) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = Duration::from_millis(total_ms);
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        if remaining.is_zero() {
            return true;
        }
        let step = slice.min(remaining);
        thread::sleep(step);
        remaining -= step;
    }
}

/// Polls the demuxer's packet-queue lengths against the configured
/// pre-buffer thresholds and opens `gate` the moment they're met, firing
/// `PreBufferReady` exactly once. Exits early (without opening the gate) if
/// `stop_decode` asks it to give up before that happens.
fn spawn_pre_buffer_watcher(shared: Arc<Shared>) {
    let gate = Arc::clone(&*shared.pre_buffer_gate.lock().unwrap());
    let cfg = shared.config.lock().unwrap().pre_buffer;
    let handle = thread::spawn(move || loop {
        if gate.is_ready() {
            return;
        }
        if shared.pre_buffer_stop.load(Ordering::Acquire) {
            return;
        }

        let has_video = shared.demuxer.has_video();
        let has_audio = shared.demuxer.has_audio();
        let video_len = shared.demuxer.video_queue().len();
        let audio_len = shared.demuxer.audio_queue().len();

        if thresholds_met(
            has_video,
            video_len,
            cfg.video_frames as usize,
            has_audio,
            audio_len,
            cfg.audio_packets as usize,
            cfg.require_both_streams,
        ) {
            gate.open();
            shared.events.dispatch(Event::new("controller", "pre-buffer ready", EventKind::PreBufferReady));
            return;
        }

        thread::sleep(POLL_INTERVAL);
    });
    *shared.pre_buffer_watcher.lock().unwrap() = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_tracing;

    #[test]
    fn fresh_controller_is_closed() {
        init_tracing();
        let controller = Controller::new(Config::default());
        assert_eq!(controller.state(), PlaybackState::Closed);
        assert!(!controller.has_video());
        assert!(!controller.has_audio());
        assert!(!controller.is_recording());
    }

    #[test]
    fn pause_resume_are_no_ops_before_open() {
        let controller = Controller::new(Config::default());
        assert!(!controller.pause());
        assert!(!controller.resume());
    }

    #[test]
    fn seek_before_open_fails() {
        let controller = Controller::new(Config::default());
        assert!(matches!(controller.seek(1.0), Err(Error::SeekFailed { .. })));
    }

    #[test]
    fn set_speed_rejects_non_positive() {
        let controller = Controller::new(Config::default());
        assert!(matches!(controller.set_speed(0.0), Err(Error::ConfigInvalid { .. })));
        assert!(matches!(controller.set_speed(-2.0), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn start_recording_before_open_fails() {
        let controller = Controller::new(Config::default());
        assert!(matches!(controller.start_recording("/tmp/out.mp4"), Err(Error::RecordOpenFailed { .. })));
    }

    #[test]
    fn open_with_invalid_config_is_rejected_before_touching_the_demuxer() {
        let controller = Controller::new(Config::default());
        let mut bad = Config::default();
        bad.speed = -1.0;
        assert!(matches!(controller.open("file:///dev/null", bad), Err(Error::ConfigInvalid { .. })));
        assert_eq!(controller.state(), PlaybackState::Closed);
    }

    #[test]
    fn realtime_scheme_detection() {
        assert!(is_realtime_url("rtsp://example.com/stream"));
        assert!(is_realtime_url("rtmp://example.com/live"));
        assert!(!is_realtime_url("/home/user/video.mp4"));
        assert!(!is_realtime_url("https://example.com/video.mp4"));
    }

    #[test]
    fn stop_reconnect_is_a_no_op_when_nothing_is_reconnecting() {
        let controller = Controller::new(Config::default());
        controller.stop_reconnect();
        assert!(!controller.is_reconnecting());
    }

    #[test]
    fn close_before_open_does_not_panic() {
        let controller = Controller::new(Config::default());
        controller.close();
        assert_eq!(controller.state(), PlaybackState::Closed);
    }
}
