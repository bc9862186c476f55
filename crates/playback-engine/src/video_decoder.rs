// crates/playback-engine/src/video_decoder.rs
//
// VideoDecoder: owns a codec context built from the Demuxer's snapshotted
// video stream parameters, and runs the decode loop on its own thread.
// Pulls Packets from the Demuxer's video PacketQueue, decodes, optionally
// scales to the configured output pixel format, updates the video Clock,
// and pushes Frames into its own FrameQueue — sleeping between frames per
// SyncController's scheduling delay when frame-rate control is enabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context as _;
use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags as ScaleFlags};
use tracing::{debug, warn};

use playback_types::{Config, Event, EventKind, Frame, FrameFormat, MediaKind, VideoOutFormat};

use crate::clock::Clock;
use crate::demuxer::Demuxer;
use crate::event_dispatcher::EventDispatcher;
use crate::frame_queue::FrameQueue;
use crate::hwaccel::HwAccelContext;
use crate::packet_queue::{PacketQueue, Timeout};
use crate::pre_buffer::PreBufferGate;
use crate::sync_controller::SyncController;

const FRAME_QUEUE_CAPACITY: usize = 3;
const STATS_INTERVAL: u64 = 100;

struct Shared {
    events: Arc<EventDispatcher>,
    sync: Arc<SyncController>,
    frame_queue: Arc<FrameQueue>,
    clock: Arc<Clock>,
    config: Mutex<Config>,
    seek_pos: Mutex<f64>,
    running: AtomicBool,
    codec_name: Mutex<String>,
    hw_active: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    pre_buffer: Mutex<Arc<PreBufferGate>>,
}

/// Decodes the video stream of a `Demuxer` into `Frame`s, one per
/// `FrameQueue` slot, applying HW-accelerated decode and frame-rate-aware
/// scheduling where configured.
pub struct VideoDecoder {
    shared: Arc<Shared>,
    codec_ctx: Mutex<Option<ffmpeg::codec::context::Context>>,
    stream_index: Mutex<Option<usize>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoDecoder {
    /// `packet_queue` is the same `PacketQueue` that will later be passed to
    /// `start` — the decode loop anchors the clock against that queue's
    /// serial (bumped by the Demuxer's `seek` flush), so the clock must read
    /// its liveness from the same source, not from this decoder's own
    /// `FrameQueue` (whose serial nothing ever bumps).
    pub fn new(events: Arc<EventDispatcher>, sync: Arc<SyncController>, config: Config, packet_queue: Arc<PacketQueue>) -> Self {
        let frame_queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY, true));
        let clock = Arc::new(Clock::new(move || packet_queue.serial()));
        sync.set_video_clock(Arc::clone(&clock));

        Self {
            shared: Arc::new(Shared {
                events,
                sync,
                frame_queue,
                clock,
                config: Mutex::new(config),
                seek_pos: Mutex::new(0.0),
                running: AtomicBool::new(false),
                codec_name: Mutex::new(String::new()),
                hw_active: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
                pre_buffer: Mutex::new(Arc::new(PreBufferGate::open_gate())),
            }),
            codec_ctx: Mutex::new(None),
            stream_index: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn frame_queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.shared.frame_queue)
    }

    pub fn clock(&self) -> Arc<Clock> {
        Arc::clone(&self.shared.clock)
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        self.shared.hw_active.load(Ordering::Acquire)
    }

    /// Install the pre-buffer gate the decode loop must wait on before its
    /// first `commit`. Called by the Controller before `start` when
    /// pre-buffering is enabled; decoders otherwise keep the always-open
    /// gate they were constructed with.
    pub fn set_pre_buffer_gate(&self, gate: Arc<PreBufferGate>) {
        *self.shared.pre_buffer.lock().unwrap() = gate;
    }

    /// Build the codec context from `demuxer`'s snapshotted video stream
    /// parameters. Must be called (and succeed) before `start`.
    pub fn open(&self, demuxer: &Demuxer) -> bool {
        let Some(params) = demuxer.video_params() else {
            self.shared.events.dispatch(Event::new(
                "video_decoder",
                "no video stream to open",
                EventKind::DecoderCreateFailed { kind: MediaKind::Video },
            ));
            return false;
        };

        let config = self.shared.config.lock().unwrap().clone();
        let (ctx, hw, codec_name) = match build_video_codec(params.parameters, &config) {
            Ok(built) => built,
            Err(e) => {
                warn!(error = %e, "video codec setup failed");
                self.shared.events.dispatch(Event::new(
                    "video_decoder",
                    "codec setup failed",
                    EventKind::DecoderCreateFailed { kind: MediaKind::Video },
                ).with_error(-1, format!("{e:#}")));
                return false;
            }
        };

        *self.shared.codec_name.lock().unwrap() = codec_name.clone();
        self.shared.hw_active.store(hw.is_some(), Ordering::Release);
        *self.stream_index.lock().unwrap() = Some(params.stream_index);
        *self.codec_ctx.lock().unwrap() = Some(ctx);

        self.shared.events.dispatch(Event::new(
            "video_decoder",
            "decoder created",
            EventKind::DecoderCreateSuccess {
                kind: MediaKind::Video,
                codec_name,
                stream_index: params.stream_index,
            },
        ));
        true
    }

    /// Spawn the decode loop thread. No-op if already running or `open` was
    /// never called (or failed).
    pub fn start(&self, packet_queue: Arc<PacketQueue>) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(ctx) = self.codec_ctx.lock().unwrap().take() else {
            self.shared.running.store(false, Ordering::Release);
            return;
        };
        let stream_index = self.stream_index.lock().unwrap().unwrap_or(0);
        let config = self.shared.config.lock().unwrap().clone();
        let hw = HwAccelContext::try_new(config.hw_accel, config.hw_device_index, config.require_frame_in_system_memory);

        self.shared.frame_queue.set_aborted(false);
        *self.shared.seek_pos.lock().unwrap() = 0.0;

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || decode_loop(shared, ctx, hw, packet_queue, stream_index));
        *self.thread.lock().unwrap() = Some(handle);

        self.shared.events.dispatch(Event::new(
            "video_decoder",
            "decode started",
            EventKind::DecoderStarted { kind: MediaKind::Video, hw: self.shared.hw_active.load(Ordering::Acquire) },
        ));
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.frame_queue.set_aborted(true);
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.events.dispatch(Event::new(
            "video_decoder",
            "decode stopped",
            EventKind::DecoderStopped { kind: MediaKind::Video },
        ));
    }

    pub fn close(&self) {
        self.stop();
        self.codec_ctx.lock().unwrap().take();
        self.shared.events.dispatch(Event::new(
            "video_decoder",
            "decoder destroyed",
            EventKind::DecoderDestroy { kind: MediaKind::Video },
        ));
    }

    pub fn set_speed(&self, speed: f64) -> bool {
        if speed <= 0.0 {
            return false;
        }
        let mut config = self.shared.config.lock().unwrap();
        if (config.speed - speed).abs() < f64::EPSILON {
            return false;
        }
        config.speed = speed;
        true
    }

    pub fn set_seek_pos(&self, pos: f64) {
        *self.shared.seek_pos.lock().unwrap() = pos;
    }
}

fn decode_loop(
    shared: Arc<Shared>,
    ctx: ffmpeg::codec::context::Context,
    hw: Option<HwAccelContext>,
    packet_queue: Arc<PacketQueue>,
    stream_index: usize,
) {
    let mut decoder = match ctx.decoder().video() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, stream_index, "video decoder rebuild on loop thread failed");
            return;
        }
    };

    let mut scaler: Option<SwsContext> = None;
    let mut serial = packet_queue.serial();
    shared.frame_queue.set_serial(serial);
    shared.clock.init();

    let mut read_first_frame = false;
    let mut occurred_error = false;
    let mut error_count: u32 = 0;
    let mut frames_decoded: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        if serial != packet_queue.serial() {
            unsafe { ffmpeg::ffi::avcodec_flush_buffers(decoder.as_mut_ptr()) };
            serial = packet_queue.serial();
            shared.frame_queue.set_serial(serial);
            shared.clock.init();
        }

        if !shared.frame_queue.reserve_writable(Timeout(50)) {
            if shared.frame_queue.is_aborted() {
                break;
            }
            continue;
        }

        let Some(packet) = packet_queue.pop(Timeout(1)) else {
            if packet_queue.is_aborted() {
                break;
            }
            continue;
        };
        if packet.serial != serial {
            continue;
        }
        if packet.is_eof() {
            continue;
        }

        let raw = ffmpeg::Packet::copy(packet.data());
        if let Err(e) = decoder.send_packet(&raw) {
            if is_transient(&e) {
                continue;
            }
            error_count += 1;
            if !occurred_error {
                occurred_error = true;
                warn!(error = %e, error_count, "video decode error");
                shared.events.dispatch(Event::new(
                    "video_decoder",
                    "decode error",
                    EventKind::DecodeError { kind: MediaKind::Video },
                ).with_error(-1, e.to_string()));
            }
            continue;
        }

        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let frame_rate = unsafe { (*decoder.as_ptr()).framerate };
            let duration = if frame_rate.num != 0 && frame_rate.den != 0 {
                frame_rate.den as f64 / frame_rate.num as f64
            } else {
                0.0
            };

            let pts_raw = decoded.pts().or_else(|| unsafe { best_effort_timestamp(&decoded) });
            let time_base = unsafe { (*ctx.as_ptr()).time_base };
            let pts = match pts_raw {
                Some(p) if time_base.den != 0 => p as f64 * time_base.num as f64 / time_base.den as f64,
                _ => f64::NAN,
            };

            if !pts.is_nan() {
                shared.clock.set(pts, serial);
            }

            let seek_pos = *shared.seek_pos.lock().unwrap();
            if !pts.is_nan() && pts < seek_pos {
                continue;
            }

            let (host_frame, is_hw) = match &hw {
                Some(h) if h.is_transfer_to_host_required() => match HwAccelContext::transfer_to_host(&decoded) {
                    Ok(Some(host)) => (host, false),
                    Ok(None) => (decoded.clone(), false),
                    Err(e) => {
                        warn!(error = %e, "hwframe transfer to host failed");
                        (decoded.clone(), true)
                    }
                },
                Some(_) => (decoded.clone(), unsafe { !(*decoded.as_ptr()).hw_frames_ctx.is_null() }),
                None => (decoded.clone(), false),
            };

            let config = shared.config.lock().unwrap().clone();
            let (out_frame, width, height, pixel_format) = match config.video_out_format {
                VideoOutFormat::Native => {
                    let w = host_frame.width();
                    let h = host_frame.height();
                    let fmt = host_frame.format() as i32;
                    (host_frame, w, h, fmt)
                }
                VideoOutFormat::Rgba | VideoOutFormat::Yuv420p => {
                    let target = match config.video_out_format {
                        VideoOutFormat::Rgba => ffmpeg::format::Pixel::RGBA,
                        _ => ffmpeg::format::Pixel::YUV420P,
                    };
                    let sc = scaler.get_or_insert_with(|| {
                        SwsContext::get(
                            host_frame.format(), host_frame.width(), host_frame.height(),
                            target, host_frame.width(), host_frame.height(),
                            ScaleFlags::BILINEAR,
                        ).expect("create video scaler")
                    });
                    let mut scaled = ffmpeg::util::frame::video::Video::empty();
                    if sc.run(&host_frame, &mut scaled).is_err() {
                        continue;
                    }
                    let w = scaled.width();
                    let h = scaled.height();
                    (scaled, w, h, target as i32)
                }
            };

            let data = copy_planes(&out_frame, height);

            if !read_first_frame {
                read_first_frame = true;
                shared.events.dispatch(Event::new(
                    "video_decoder",
                    "first frame decoded",
                    EventKind::DecodeFirstFrame { kind: MediaKind::Video },
                ));
            }
            if occurred_error {
                occurred_error = false;
                error_count = 0;
                shared.events.dispatch(Event::new(
                    "video_decoder",
                    "decode recovered",
                    EventKind::DecodeRecovery { kind: MediaKind::Video },
                ));
            }

            let frame = Frame::new(
                data,
                FrameFormat::Video { width, height, pixel_format },
                serial,
                if pts.is_nan() { 0.0 } else { pts },
                duration,
                is_hw,
            );

            if config.enable_frame_rate_control && !pts.is_nan() {
                let delay = shared.sync.compute_video_delay(pts, duration.max(1.0 / 60.0));
                if delay > 0.0 {
                    let guard = shared.wake_lock.lock().unwrap();
                    let _ = shared
                        .wake
                        .wait_timeout_while(guard, Duration::from_secs_f64(delay), |_| {
                            shared.running.load(Ordering::Acquire)
                        });
                    if !shared.running.load(Ordering::Acquire) {
                        return;
                    }
                }
            }

            let gate = Arc::clone(&*shared.pre_buffer.lock().unwrap());
            if !gate.block_until_ready(&shared.running) {
                return;
            }

            shared.frame_queue.commit(frame);

            frames_decoded += 1;
            if frames_decoded % STATS_INTERVAL == 0 {
                debug!(frames_decoded, "video decode stats");
            }
        }
    }

}

/// Chains the context-creation / hwaccel-attach / trial-open steps that
/// `open` needs, collapsing whichever one fails into a single `anyhow::Error`
/// with context describing which step it was — `open` flattens that chain to
/// one `DecoderCreateFailed` event rather than exposing it to callers.
fn build_video_codec(
    parameters: ffmpeg::codec::Parameters,
    config: &Config,
) -> anyhow::Result<(ffmpeg::codec::context::Context, Option<HwAccelContext>, String)> {
    let mut ctx = ffmpeg::codec::context::Context::from_parameters(parameters)
        .context("building codec context from stream parameters")?;

    let hw = HwAccelContext::try_new(config.hw_accel, config.hw_device_index, config.require_frame_in_system_memory);
    if let Some(hw) = &hw {
        hw.attach(&mut ctx);
    }

    let codec_name = codec_name_of(&ctx);

    // Validate the context opens on a throwaway clone; the real `ctx`
    // moves to the loop thread fresh so the codec context (full of raw
    // FFmpeg pointers) never crosses a thread boundary already opened.
    ctx.clone().decoder().video().context("trial-opening the video decoder")?;

    Ok((ctx, hw, codec_name))
}

fn codec_name_of(ctx: &ffmpeg::codec::context::Context) -> String {
    ctx.id().name().to_string()
}

/// `EAGAIN`/`EOF` from `send_packet` mean "try again later", not a codec
/// fault — the decode loop treats everything else as a `DecodeError`.
fn is_transient(e: &ffmpeg::Error) -> bool {
    const EAGAIN: i32 = 11;
    matches!(e, ffmpeg::Error::Eof) || matches!(e, ffmpeg::Error::Other { errno } if *errno == EAGAIN)
}

unsafe fn best_effort_timestamp(frame: &ffmpeg::util::frame::video::Video) -> Option<i64> {
    let v = (*frame.as_ptr()).pkt_dts;
    if v == ffmpeg::ffi::AV_NOPTS_VALUE {
        None
    } else {
        Some(v)
    }
}

fn copy_planes(frame: &ffmpeg::util::frame::video::Video, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for plane in 0..frame.planes() {
        let stride = frame.stride(plane);
        let raw = frame.data(plane);
        let plane_height = if plane == 0 {
            height as usize
        } else {
            match frame.format() {
                ffmpeg::format::Pixel::YUV420P => (height as usize).div_ceil(2),
                _ => height as usize,
            }
        };
        let rows = plane_height.min(raw.len() / stride.max(1));
        for row in 0..rows {
            out.extend_from_slice(&raw[row * stride..row * stride + stride.min(raw.len() - row * stride)]);
        }
    }
    out
}

impl From<MediaType> for MediaKind {
    fn from(value: MediaType) -> Self {
        match value {
            MediaType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_dispatcher::EventDispatcher;

    #[test]
    fn open_without_video_stream_fails_and_emits_event() {
        let events = Arc::new(EventDispatcher::new());
        let sync = Arc::new(SyncController::new());
        let decoder = VideoDecoder::new(events, sync, Config::default(), Arc::new(PacketQueue::new(4)));
        let demuxer = Demuxer::new(Arc::new(EventDispatcher::new()));
        assert!(!decoder.open(&demuxer));
    }

    #[test]
    fn set_speed_rejects_non_positive() {
        let events = Arc::new(EventDispatcher::new());
        let sync = Arc::new(SyncController::new());
        let decoder = VideoDecoder::new(events, sync, Config::default(), Arc::new(PacketQueue::new(4)));
        assert!(!decoder.set_speed(0.0));
        assert!(!decoder.set_speed(-1.0));
    }

    #[test]
    fn video_clock_is_registered_with_sync_controller() {
        let events = Arc::new(EventDispatcher::new());
        let sync = Arc::new(SyncController::new());
        let decoder = VideoDecoder::new(events, sync.clone(), Config::default(), Arc::new(PacketQueue::new(4)));
        sync.set_master_clock_type(crate::sync_controller::MasterClock::Video);
        assert!(Arc::ptr_eq(&sync.get_master_clock().unwrap(), &decoder.clock()));
    }

    #[test]
    fn video_clock_tracks_packet_queue_serial_not_frame_queue() {
        let events = Arc::new(EventDispatcher::new());
        let sync = Arc::new(SyncController::new());
        let pq = Arc::new(PacketQueue::new(4));
        let decoder = VideoDecoder::new(events, sync, Config::default(), Arc::clone(&pq));
        decoder.clock().set(1.0, pq.serial());
        assert!(!decoder.clock().get().is_nan());
        pq.flush();
        assert!(decoder.clock().get().is_nan());
    }

    #[test]
    fn eof_and_eagain_are_transient_everything_else_is_fatal() {
        assert!(is_transient(&ffmpeg::Error::Eof));
        assert!(is_transient(&ffmpeg::Error::Other { errno: 11 }));
        assert!(!is_transient(&ffmpeg::Error::Other { errno: 22 }));
        assert!(!is_transient(&ffmpeg::Error::InvalidData));
    }
}
