// crates/playback-engine/src/recorder.rs
//
// Recorder: drains the Demuxer's tee'd packet queues and writes a remuxed
// output container. Pure stream copy — no encode/decode — so the only real
// work is stream-index mapping, keyframe gating, and timestamp rescaling
// from each input stream's timebase to the timebase the muxer assigns its
// output stream. Survives a seek: a serial change on either tee queue resets
// the keyframe gate so the next GOP starts cleanly, but the output file and
// its header are untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use tracing::{info, warn};

use playback_types::{Event, EventKind, MediaKind, Serial};

use crate::demuxer::RecordStreamMeta;
use crate::event_dispatcher::EventDispatcher;
use crate::packet_queue::{PacketQueue, Timeout};

struct OutputStream {
    input_index: usize,
    output_index: usize,
    media_kind: MediaKind,
    in_time_base: ffmpeg::Rational,
    out_time_base: ffmpeg::Rational,
}

struct Shared {
    events: Arc<EventDispatcher>,
    running: AtomicBool,
    recording: AtomicBool,
    output_path: Mutex<String>,
}

/// Consumes a Demuxer's recording tee queues and remuxes them to `path`.
pub struct Recorder {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                events,
                running: AtomicBool::new(false),
                recording: AtomicBool::new(false),
                output_path: Mutex::new(String::new()),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    pub fn output_path(&self) -> String {
        self.shared.output_path.lock().unwrap().clone()
    }

    /// Opens `path` as an mp4 container, adds one output stream per video/
    /// audio input stream in `streams` (input order), writes the header, and
    /// starts the record loop thread draining `video_queue`/`audio_queue`.
    pub fn start(
        &self,
        path: &str,
        streams: Vec<RecordStreamMeta>,
        video_queue: Arc<PacketQueue>,
        audio_queue: Arc<PacketQueue>,
    ) -> bool {
        if self.shared.recording.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut octx = match ffmpeg::format::output(path) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(path, error = %e, "recorder output open failed");
                self.shared.events.dispatch(Event::new(
                    "recorder",
                    "output open failed",
                    EventKind::RecordingError { output_path: path.to_string() },
                ).with_error(-1, e.to_string()));
                self.shared.recording.store(false, Ordering::Release);
                return false;
            }
        };

        let mut mapping = Vec::new();
        for meta in &streams {
            let codec: Option<ffmpeg::codec::Codec> = None;
            let ost = match octx.add_stream(codec) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "recorder add_stream failed");
                    self.shared.events.dispatch(Event::new(
                        "recorder",
                        "add stream failed",
                        EventKind::RecordingError { output_path: path.to_string() },
                    ).with_error(-1, e.to_string()));
                    self.shared.recording.store(false, Ordering::Release);
                    return false;
                }
            };
            let output_index = ost.index();
            mapping.push(OutputStream {
                input_index: meta.input_index,
                output_index,
                media_kind: meta.media_kind,
                in_time_base: meta.time_base,
                out_time_base: meta.time_base,
            });
            unsafe {
                let ret = ffmpeg::ffi::avcodec_parameters_copy(
                    (**(*octx.as_mut_ptr()).streams.add(output_index)).codecpar,
                    meta.parameters.as_ptr(),
                );
                if ret < 0 {
                    warn!(ret, "avcodec_parameters_copy failed");
                }
            }
        }

        if let Err(e) = octx.write_header() {
            warn!(error = %e, "recorder write_header failed");
            self.shared.events.dispatch(Event::new(
                "recorder",
                "write header failed",
                EventKind::RecordingError { output_path: path.to_string() },
            ).with_error(-1, e.to_string()));
            self.shared.recording.store(false, Ordering::Release);
            return false;
        }

        for m in &mut mapping {
            if let Some(s) = octx.stream(m.output_index) {
                m.out_time_base = s.time_base();
            }
        }

        *self.shared.output_path.lock().unwrap() = path.to_string();
        self.shared.running.store(true, Ordering::Release);
        video_queue.resume();
        audio_queue.resume();

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || record_loop(shared, octx, mapping, video_queue, audio_queue));
        *self.thread.lock().unwrap() = Some(handle);

        self.shared.events.dispatch(Event::new(
            "recorder",
            "recording started",
            EventKind::RecordingStarted { output_path: path.to_string(), format: "mp4".to_string() },
        ));
        true
    }

    /// Stops the record loop, which writes the trailer and releases the
    /// output context on its own thread before this call returns.
    pub fn stop(&self) {
        if !self.shared.recording.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let path = self.output_path();
        self.shared.events.dispatch(Event::new(
            "recorder",
            "recording stopped",
            EventKind::RecordingStopped { output_path: path },
        ));
    }
}

fn record_loop(
    shared: Arc<Shared>,
    mut octx: ffmpeg::format::context::Output,
    mapping: Vec<OutputStream>,
    video_queue: Arc<PacketQueue>,
    audio_queue: Arc<PacketQueue>,
) {
    let by_input: HashMap<usize, usize> = mapping.iter().map(|m| (m.input_index, m.output_index)).collect();
    let time_bases: HashMap<usize, (ffmpeg::Rational, ffmpeg::Rational)> =
        mapping.iter().map(|m| (m.output_index, (m.in_time_base, m.out_time_base))).collect();

    let mut has_key_frame = false;
    let mut current_serial: Option<Serial> = None;
    let mut packets_written: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        let mut wrote_any = false;

        if let Some(pkt) = video_queue.pop(Timeout(5)) {
            if !pkt.is_eof() {
                if current_serial != Some(pkt.serial) {
                    current_serial = Some(pkt.serial);
                    has_key_frame = false;
                }
                if pkt.is_keyframe {
                    has_key_frame = true;
                }
                if has_key_frame {
                    if write_packet(&mut octx, &by_input, &time_bases, &pkt) {
                        packets_written += 1;
                    }
                    wrote_any = true;
                }
            }
        }

        if has_key_frame {
            if let Some(pkt) = audio_queue.pop(Timeout::NONBLOCKING) {
                if !pkt.is_eof() {
                    if current_serial != Some(pkt.serial) {
                        current_serial = Some(pkt.serial);
                    }
                    if write_packet(&mut octx, &by_input, &time_bases, &pkt) {
                        packets_written += 1;
                    }
                    wrote_any = true;
                }
            }
        }

        if !wrote_any {
            thread::sleep(Duration::from_millis(1));
        }
    }

    if let Err(e) = octx.write_trailer() {
        warn!(error = %e, "recorder write_trailer failed");
    }
    info!(packets_written, "recording finished");
}

fn write_packet(
    octx: &mut ffmpeg::format::context::Output,
    by_input: &HashMap<usize, usize>,
    time_bases: &HashMap<usize, (ffmpeg::Rational, ffmpeg::Rational)>,
    pkt: &playback_types::Packet,
) -> bool {
    let Some(&output_index) = by_input.get(&pkt.stream_index) else {
        return false;
    };
    let Some(&(in_tb, out_tb)) = time_bases.get(&output_index) else {
        return false;
    };

    let mut out = ffmpeg::Packet::copy(pkt.data());
    out.set_stream(output_index);
    out.set_pts(pkt.pts);
    out.set_dts(pkt.dts);
    out.set_duration(pkt.duration);
    if pkt.is_keyframe {
        out.set_flags(ffmpeg::codec::packet::Flags::KEY);
    }
    out.rescale_ts(in_tb, out_tb);

    if let Err(e) = out.write_interleaved(octx) {
        warn!(error = %e, "recorder write_interleaved failed");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_recorder_is_not_recording() {
        let events = Arc::new(EventDispatcher::new());
        let recorder = Recorder::new(events);
        assert!(!recorder.is_recording());
        assert_eq!(recorder.output_path(), "");
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let events = Arc::new(EventDispatcher::new());
        let recorder = Recorder::new(events);
        recorder.stop();
        assert!(!recorder.is_recording());
    }
}
