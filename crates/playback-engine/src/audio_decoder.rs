// crates/playback-engine/src/audio_decoder.rs
//
// AudioDecoder: mirrors VideoDecoder's structure but decodes the audio
// stream and runs every frame through a SpeedResampler instead of a pixel
// scaler. Audio is never frame-rate-throttled — the video decoder's
// scheduling delay is the only throttle in the pipeline; audio keeps the
// resampled sample rate in lock-step with speed instead (see
// SyncController's design notes).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use ffmpeg_the_third as ffmpeg;
use tracing::{debug, warn};

use playback_types::{Config, Event, EventKind, Frame, FrameFormat, MediaKind};

use crate::clock::Clock;
use crate::demuxer::Demuxer;
use crate::event_dispatcher::EventDispatcher;
use crate::frame_queue::FrameQueue;
use crate::packet_queue::{PacketQueue, Timeout};
use crate::pre_buffer::PreBufferGate;
use crate::resampler::SpeedResampler;

const FRAME_QUEUE_CAPACITY: usize = 9;
const STATS_INTERVAL: u64 = 100;

struct Shared {
    events: Arc<EventDispatcher>,
    frame_queue: Arc<FrameQueue>,
    clock: Arc<Clock>,
    config: Mutex<Config>,
    seek_pos: Mutex<f64>,
    running: AtomicBool,
    codec_name: Mutex<String>,
    pre_buffer: Mutex<Arc<PreBufferGate>>,
}

/// Decodes the audio stream of a `Demuxer` into `Frame`s, resampling to
/// track the configured playback speed.
pub struct AudioDecoder {
    shared: Arc<Shared>,
    codec_ctx: Mutex<Option<ffmpeg::codec::context::Context>>,
    stream_index: Mutex<Option<usize>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioDecoder {
    /// `packet_queue` is the same `PacketQueue` that will later be passed to
    /// `start` — the decode loop anchors the clock against that queue's
    /// serial (bumped by the Demuxer's `seek` flush), so the clock must read
    /// its liveness from the same source, not from this decoder's own
    /// `FrameQueue` (whose serial nothing ever bumps).
    pub fn new(events: Arc<EventDispatcher>, config: Config, packet_queue: Arc<PacketQueue>) -> Self {
        let frame_queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY, false));
        let clock = Arc::new(Clock::new(move || packet_queue.serial()));

        Self {
            shared: Arc::new(Shared {
                events,
                frame_queue,
                clock,
                config: Mutex::new(config),
                seek_pos: Mutex::new(0.0),
                running: AtomicBool::new(false),
                codec_name: Mutex::new(String::new()),
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

    pub fn set_pre_buffer_gate(&self, gate: Arc<PreBufferGate>) {
        *self.shared.pre_buffer.lock().unwrap() = gate;
    }

    /// Build the codec context from `demuxer`'s snapshotted audio stream
    /// parameters. Must be called (and succeed) before `start`.
    pub fn open(&self, demuxer: &Demuxer) -> bool {
        let Some(params) = demuxer.audio_params() else {
            self.shared.events.dispatch(Event::new(
                "audio_decoder",
                "no audio stream to open",
                EventKind::DecoderCreateFailed { kind: MediaKind::Audio },
            ));
            return false;
        };

        let ctx = match ffmpeg::codec::context::Context::from_parameters(params.parameters) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "audio codec context creation failed");
                self.shared.events.dispatch(Event::new(
                    "audio_decoder",
                    "codec context creation failed",
                    EventKind::DecoderCreateFailed { kind: MediaKind::Audio },
                ).with_error(-1, e.to_string()));
                return false;
            }
        };

        let codec_name = codec_name_of(&ctx);

        if let Err(e) = ctx.clone().decoder().audio() {
            warn!(error = %e, "audio decoder open failed");
            self.shared.events.dispatch(Event::new(
                "audio_decoder",
                "decoder open failed",
                EventKind::DecoderCreateFailed { kind: MediaKind::Audio },
            ).with_error(-1, e.to_string()));
            return false;
        }

        *self.shared.codec_name.lock().unwrap() = codec_name.clone();
        *self.stream_index.lock().unwrap() = Some(params.stream_index);
        *self.codec_ctx.lock().unwrap() = Some(ctx);

        self.shared.events.dispatch(Event::new(
            "audio_decoder",
            "decoder created",
            EventKind::DecoderCreateSuccess {
                kind: MediaKind::Audio,
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

        self.shared.frame_queue.set_aborted(false);
        *self.shared.seek_pos.lock().unwrap() = 0.0;

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || decode_loop(shared, ctx, packet_queue, stream_index));
        *self.thread.lock().unwrap() = Some(handle);

        self.shared.events.dispatch(Event::new(
            "audio_decoder",
            "decode started",
            EventKind::DecoderStarted { kind: MediaKind::Audio, hw: false },
        ));
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.frame_queue.set_aborted(true);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.events.dispatch(Event::new(
            "audio_decoder",
            "decode stopped",
            EventKind::DecoderStopped { kind: MediaKind::Audio },
        ));
    }

    pub fn close(&self) {
        self.stop();
        self.codec_ctx.lock().unwrap().take();
        self.shared.events.dispatch(Event::new(
            "audio_decoder",
            "decoder destroyed",
            EventKind::DecoderDestroy { kind: MediaKind::Audio },
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
    packet_queue: Arc<PacketQueue>,
    stream_index: usize,
) {
    let mut decoder = match ctx.decoder().audio() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, stream_index, "audio decoder rebuild on loop thread failed");
            return;
        }
    };

    let mut resampler = SpeedResampler::new(decoder.format(), decoder.channel_layout(), decoder.rate());
    let mut serial = packet_queue.serial();
    shared.frame_queue.set_serial(serial);
    shared.clock.init();

    let mut read_first_frame = false;
    let mut occurred_error = false;
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
            if !occurred_error {
                occurred_error = true;
                warn!(error = %e, "audio decode error");
                shared.events.dispatch(Event::new(
                    "audio_decoder",
                    "decode error",
                    EventKind::DecodeError { kind: MediaKind::Audio },
                ).with_error(-1, e.to_string()));
            }
            continue;
        }

        let mut decoded = ffmpeg::util::frame::audio::Audio::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let sample_rate = decoded.rate().max(1);
            let duration = decoded.samples() as f64 / sample_rate as f64;

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

            let speed = shared.config.lock().unwrap().speed;
            let resampled = match resampler.run(&decoded, speed) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "audio resample failed");
                    continue;
                }
            };

            let channels = resampled.channels() as u32;
            let sample_format = resampled.format() as i32;
            let nb_samples = resampled.samples() as u32;
            let data = copy_samples(&resampled);

            if !read_first_frame {
                read_first_frame = true;
                shared.events.dispatch(Event::new(
                    "audio_decoder",
                    "first frame decoded",
                    EventKind::DecodeFirstFrame { kind: MediaKind::Audio },
                ));
            }
            if occurred_error {
                occurred_error = false;
                shared.events.dispatch(Event::new(
                    "audio_decoder",
                    "decode recovered",
                    EventKind::DecodeRecovery { kind: MediaKind::Audio },
                ));
            }

            let frame = Frame::new(
                data,
                FrameFormat::Audio { sample_rate, channels, sample_format, nb_samples },
                serial,
                if pts.is_nan() { 0.0 } else { pts },
                duration,
                false,
            );

            let gate = Arc::clone(&*shared.pre_buffer.lock().unwrap());
            if !gate.block_until_ready(&shared.running) {
                return;
            }

            shared.frame_queue.commit(frame);

            frames_decoded += 1;
            if frames_decoded % STATS_INTERVAL == 0 {
                debug!(frames_decoded, "audio decode stats");
            }
        }
    }
}

unsafe fn best_effort_timestamp(frame: &ffmpeg::util::frame::audio::Audio) -> Option<i64> {
    let v = (*frame.as_ptr()).pkt_dts;
    if v == ffmpeg::ffi::AV_NOPTS_VALUE {
        None
    } else {
        Some(v)
    }
}

fn copy_samples(frame: &ffmpeg::util::frame::audio::Audio) -> Vec<u8> {
    let mut out = Vec::new();
    if frame.is_planar() {
        for plane in 0..frame.planes() {
            out.extend_from_slice(frame.data(plane));
        }
    } else {
        out.extend_from_slice(frame.data(0));
    }
    out
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_without_audio_stream_fails_and_emits_event() {
        let events = Arc::new(EventDispatcher::new());
        let decoder = AudioDecoder::new(events, Config::default(), Arc::new(PacketQueue::new(4)));
        let demuxer = Demuxer::new(Arc::new(EventDispatcher::new()));
        assert!(!decoder.open(&demuxer));
    }

    #[test]
    fn set_speed_rejects_non_positive() {
        let events = Arc::new(EventDispatcher::new());
        let decoder = AudioDecoder::new(events, Config::default(), Arc::new(PacketQueue::new(4)));
        assert!(!decoder.set_speed(0.0));
        assert!(!decoder.set_speed(-1.0));
    }

    #[test]
    fn set_speed_is_noop_when_unchanged() {
        let events = Arc::new(EventDispatcher::new());
        let decoder = AudioDecoder::new(events, Config::default(), Arc::new(PacketQueue::new(4)));
        assert!(!decoder.set_speed(1.0));
    }

    #[test]
    fn audio_clock_tracks_packet_queue_serial_not_frame_queue() {
        let events = Arc::new(EventDispatcher::new());
        let pq = Arc::new(PacketQueue::new(4));
        let decoder = AudioDecoder::new(events, Config::default(), Arc::clone(&pq));
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
