// crates/playback-engine/src/demuxer.rs
//
// Demuxer: opens a source, runs the read loop on its own thread (which is
// also the only thread allowed to touch the FFmpeg format context), and
// fans packets into the video/audio PacketQueues and, while recording, into
// a pair of tee queues a Recorder drains independently. Seek and recording
// control flow into the loop thread as commands rather than reaching across
// threads into the context directly — the context has exactly one owner for
// its whole lifetime.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type as MediaType;
use tracing::{debug, error, info, warn};

use playback_types::{Event, EventKind, MediaKind, Packet};

use crate::event_dispatcher::EventDispatcher;
use crate::packet_queue::{PacketQueue, Timeout};

const READ_ERROR_MAX_COUNT: u32 = 5;
const RECORD_QUEUE_CAPACITY: usize = 64;
const NO_STREAM: i64 = -1;

/// One open stream's static metadata, snapshotted while the demux thread
/// still owns the input context, so the Recorder can build its output
/// container without sharing that context across threads.
#[derive(Clone)]
pub struct RecordStreamMeta {
    pub input_index: usize,
    pub media_kind: MediaKind,
    pub time_base: ffmpeg::Rational,
    pub parameters: ffmpeg::codec::Parameters,
}

/// Snapshot of one primary (non-recording) stream's static properties, taken
/// while the demux thread still owns the format context, so a decoder can
/// build its own `codec::context::Context` without ever touching it.
#[derive(Clone)]
pub struct DecoderStreamParams {
    pub stream_index: usize,
    pub time_base: ffmpeg::Rational,
    pub parameters: ffmpeg::codec::Parameters,
    pub frame_rate: Option<ffmpeg::Rational>,
}

enum DemuxCommand {
    Seek { position_seconds: f64, reply: Sender<bool> },
    StartRecording { path: String, reply: Sender<Option<(Vec<RecordStreamMeta>, Arc<PacketQueue>, Arc<PacketQueue>)>> },
    StopRecording,
}

struct Shared {
    events: Arc<EventDispatcher>,
    video_queue: Arc<PacketQueue>,
    audio_queue: Arc<PacketQueue>,
    video_stream_index: AtomicI64,
    audio_stream_index: AtomicI64,
    running: AtomicBool,
    paused: AtomicBool,
    is_realtime: AtomicBool,
    url: Mutex<String>,
    commands: Mutex<Option<Sender<DemuxCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    record_queues: Mutex<Option<(Arc<PacketQueue>, Arc<PacketQueue>)>>,
    recording: AtomicBool,
    video_params: Mutex<Option<DecoderStreamParams>>,
    audio_params: Mutex<Option<DecoderStreamParams>>,
}

/// Opens a source and demultiplexes it into bounded packet queues.
pub struct Demuxer {
    shared: Arc<Shared>,
}

impl Demuxer {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                events,
                video_queue: Arc::new(PacketQueue::new(usize::MAX)),
                audio_queue: Arc::new(PacketQueue::new(usize::MAX)),
                video_stream_index: AtomicI64::new(NO_STREAM),
                audio_stream_index: AtomicI64::new(NO_STREAM),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                is_realtime: AtomicBool::new(false),
                url: Mutex::new(String::new()),
                commands: Mutex::new(None),
                thread: Mutex::new(None),
                record_queues: Mutex::new(None),
                recording: AtomicBool::new(false),
                video_params: Mutex::new(None),
                audio_params: Mutex::new(None),
            }),
        }
    }

    pub fn video_queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.shared.video_queue)
    }

    pub fn audio_queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.shared.audio_queue)
    }

    pub fn video_stream_index(&self) -> Option<usize> {
        index_or_none(self.shared.video_stream_index.load(Ordering::Acquire))
    }

    pub fn audio_stream_index(&self) -> Option<usize> {
        index_or_none(self.shared.audio_stream_index.load(Ordering::Acquire))
    }

    pub fn has_video(&self) -> bool {
        self.video_stream_index().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_stream_index().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn is_realtime(&self) -> bool {
        self.shared.is_realtime.load(Ordering::Acquire)
    }

    pub fn url(&self) -> String {
        self.shared.url.lock().unwrap().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    /// Static properties of the video stream, snapshotted at `open()` time.
    /// `None` before a stream is open or when the source has no video.
    pub fn video_params(&self) -> Option<DecoderStreamParams> {
        self.shared.video_params.lock().unwrap().clone()
    }

    pub fn audio_params(&self) -> Option<DecoderStreamParams> {
        self.shared.audio_params.lock().unwrap().clone()
    }

    /// Opens `url`, probes it for the best video/audio streams, and starts
    /// the demux loop thread. Options mirror real-time-friendly defaults:
    /// short timeout, TCP transport for RTSP, minimal buffering when
    /// `is_realtime`.
    pub fn open(&self, url: &str, is_realtime: bool, is_reopen: bool) -> bool {
        self.shared.events.dispatch(Event::new(
            "demuxer",
            "stream opening",
            EventKind::StreamOpening { path: url.to_string() },
        ));

        let mut options = ffmpeg::Dictionary::new();
        options.set("timeout", "3000000");
        options.set("rtsp_transport", "tcp");
        options.set("max_delay", "0");
        options.set("buffer_size", "1048576");
        if is_realtime {
            options.set("fflags", "nobuffer");
        }

        let ictx = match ffmpeg::format::input_with_dictionary(url, options) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(url, error = %e, "failed to open source");
                self.shared.events.dispatch(Event::new(
                    "demuxer",
                    "stream open failed",
                    EventKind::StreamOpenFailed { path: url.to_string() },
                ).with_error(-1, e.to_string()));
                return false;
            }
        };

        let video_index = ictx.streams().best(MediaType::Video).map(|s| s.index());
        let audio_index = ictx.streams().best(MediaType::Audio).map(|s| s.index());

        *self.shared.video_params.lock().unwrap() = video_index.and_then(|idx| {
            ictx.stream(idx).map(|s| {
                let raw = unsafe { (*s.as_ptr()).avg_frame_rate };
                let frame_rate = if raw.num != 0 && raw.den != 0 {
                    Some(ffmpeg::Rational::new(raw.num, raw.den))
                } else {
                    None
                };
                DecoderStreamParams {
                    stream_index: idx,
                    time_base: s.time_base(),
                    parameters: s.parameters(),
                    frame_rate,
                }
            })
        });
        *self.shared.audio_params.lock().unwrap() = audio_index.and_then(|idx| {
            ictx.stream(idx).map(|s| DecoderStreamParams {
                stream_index: idx,
                time_base: s.time_base(),
                parameters: s.parameters(),
                frame_rate: None,
            })
        });

        self.shared.video_stream_index.store(index_to_raw(video_index), Ordering::Release);
        self.shared.audio_stream_index.store(index_to_raw(audio_index), Ordering::Release);
        *self.shared.url.lock().unwrap() = url.to_string();
        self.shared.is_realtime.store(is_realtime, Ordering::Release);

        self.start(ictx);

        info!(url, ?video_index, ?audio_index, "stream opened");
        self.shared.events.dispatch(Event::new(
            "demuxer",
            "stream opened",
            EventKind::StreamOpened { path: url.to_string() },
        ));
        if is_reopen {
            self.shared.events.dispatch(Event::new(
                "demuxer",
                "stream recovered after reopen",
                EventKind::StreamReadRecovery,
            ));
        }
        true
    }

    pub fn close(&self) {
        let url = self.url();
        self.shared.events.dispatch(Event::new("demuxer", "stream close", EventKind::StreamClose));

        if self.is_recording() {
            self.stop_recording();
        }

        self.stop();

        self.shared.url.lock().unwrap().clear();
        self.shared.video_stream_index.store(NO_STREAM, Ordering::Release);
        self.shared.audio_stream_index.store(NO_STREAM, Ordering::Release);

        self.shared.events.dispatch(Event::new("demuxer", "stream closed", EventKind::StreamClosed));
        let _ = url;
    }

    pub fn pause(&self) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        self.shared.paused.store(true, Ordering::Release);
        true
    }

    pub fn resume(&self) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        self.shared.paused.store(false, Ordering::Release);
        true
    }

    /// Range-seeks on the video stream if present, else audio, then flushes
    /// both packet queues so in-flight packets are discarded by the
    /// decoders. Sent as a command to the loop thread, which is the only
    /// thread allowed to touch the format context.
    pub fn seek(&self, position_seconds: f64) -> bool {
        let Some(tx) = self.shared.commands.lock().unwrap().clone() else {
            return false;
        };
        let (reply_tx, reply_rx) = bounded(1);
        if tx.send(DemuxCommand::Seek { position_seconds, reply: reply_tx }).is_err() {
            return false;
        }
        let ok = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false);
        if ok {
            self.shared.video_queue.flush();
            self.shared.audio_queue.flush();
        }
        ok
    }

    /// Creates bounded tee queues and hands the caller everything a Recorder
    /// needs to build its own output container: per-stream metadata copied
    /// out of the input context, plus handles to the tee queues.
    pub fn start_recording(&self) -> Option<(Vec<RecordStreamMeta>, Arc<PacketQueue>, Arc<PacketQueue>)> {
        if self.is_recording() {
            return None;
        }
        let tx = self.shared.commands.lock().unwrap().clone()?;
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(DemuxCommand::StartRecording { path: String::new(), reply: reply_tx }).ok()?;
        let result = reply_rx.recv_timeout(Duration::from_secs(5)).ok().flatten()?;
        self.shared.record_queues.lock().unwrap().replace((Arc::clone(&result.1), Arc::clone(&result.2)));
        self.shared.recording.store(true, Ordering::Release);
        Some(result)
    }

    pub fn stop_recording(&self) {
        if !self.is_recording() {
            return;
        }
        if let Some(tx) = self.shared.commands.lock().unwrap().clone() {
            let _ = tx.send(DemuxCommand::StopRecording);
        }
        self.shared.record_queues.lock().unwrap().take();
        self.shared.recording.store(false, Ordering::Release);
    }

    fn start(&self, ictx: ffmpeg::format::context::Input) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.video_queue.resume();
        self.shared.audio_queue.resume();

        let (cmd_tx, cmd_rx) = bounded(8);
        *self.shared.commands.lock().unwrap() = Some(cmd_tx);

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || demux_loop(shared, ictx, cmd_rx));
        *self.shared.thread.lock().unwrap() = Some(handle);
    }

    fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.video_queue.abort();
        self.shared.audio_queue.abort();
        *self.shared.commands.lock().unwrap() = None;
        if let Some(handle) = self.shared.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn index_or_none(raw: i64) -> Option<usize> {
    if raw < 0 {
        None
    } else {
        Some(raw as usize)
    }
}

fn index_to_raw(index: Option<usize>) -> i64 {
    index.map(|i| i as i64).unwrap_or(NO_STREAM)
}

fn demux_loop(shared: Arc<Shared>, mut ictx: ffmpeg::format::context::Input, commands: Receiver<DemuxCommand>) {
    let mut error_times: u32 = 0;
    let mut reopened = false;
    let mut read_first_packet = false;

    let video_index = index_or_none(shared.video_stream_index.load(Ordering::Acquire));
    let audio_index = index_or_none(shared.audio_stream_index.load(Ordering::Acquire));

    while shared.running.load(Ordering::Acquire) {
        if let Ok(cmd) = commands.try_recv() {
            handle_command(&shared, &mut ictx, cmd, video_index, audio_index);
        }

        if shared.paused.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        let video_full = video_index.is_some() && shared.video_queue.is_full();
        let audio_full = audio_index.is_some() && shared.audio_queue.is_full();
        if video_full || audio_full {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        match ictx.packets().next() {
            None => {
                push_eof(&shared, video_index, audio_index);
                shared.events.dispatch(Event::new("demuxer", "stream ended", EventKind::StreamEnded));
                thread::sleep(Duration::from_millis(1));
            }
            Some(Err(ffmpeg::Error::Eof)) => {
                push_eof(&shared, video_index, audio_index);
                shared.events.dispatch(Event::new("demuxer", "stream ended", EventKind::StreamEnded));
                thread::sleep(Duration::from_millis(1));
            }
            Some(Err(e)) => {
                error_times += 1;
                debug!(error = %e, error_times, "read_frame error");
                if error_times >= READ_ERROR_MAX_COUNT {
                    error!(error_times, "consecutive read errors, giving up");
                    shared.events.dispatch(Event::new(
                        "demuxer",
                        "stream read error",
                        EventKind::StreamReadError,
                    ).with_error(-1, e.to_string()));
                    break;
                }
            }
            Some(Ok((stream, packet))) => {
                error_times = 0;

                if reopened {
                    shared.events.dispatch(Event::new(
                        "demuxer",
                        "stream recovered",
                        EventKind::StreamReadRecovery,
                    ));
                    reopened = false;
                }
                if !read_first_packet {
                    read_first_packet = true;
                    shared.events.dispatch(Event::new("demuxer", "stream read data", EventKind::StreamReadData));
                }

                route_packet(&shared, stream.index(), video_index, audio_index, &packet);
            }
        }
    }
}

fn handle_command(
    shared: &Arc<Shared>,
    ictx: &mut ffmpeg::format::context::Input,
    cmd: DemuxCommand,
    video_index: Option<usize>,
    audio_index: Option<usize>,
) {
    match cmd {
        DemuxCommand::Seek { position_seconds, reply } => {
            let ok = do_seek(ictx, position_seconds, video_index, audio_index);
            let _ = reply.send(ok);
        }
        DemuxCommand::StartRecording { path: _, reply } => {
            let meta = snapshot_stream_meta(ictx);
            let video_q = Arc::new(PacketQueue::new(RECORD_QUEUE_CAPACITY));
            let audio_q = Arc::new(PacketQueue::new(RECORD_QUEUE_CAPACITY));
            let _ = reply.send(Some((meta, Arc::clone(&video_q), Arc::clone(&audio_q))));
            *shared.record_queues.lock().unwrap() = Some((video_q, audio_q));
        }
        DemuxCommand::StopRecording => {
            shared.record_queues.lock().unwrap().take();
        }
    }
}

fn do_seek(
    ictx: &mut ffmpeg::format::context::Input,
    position_seconds: f64,
    video_index: Option<usize>,
    audio_index: Option<usize>,
) -> bool {
    let Some(stream_index) = video_index.or(audio_index) else {
        return false;
    };
    let time_base = match ictx.stream(stream_index) {
        Some(s) => s.time_base(),
        None => return false,
    };
    let target = (position_seconds * time_base.denominator() as f64 / time_base.numerator() as f64) as i64;
    ictx.seek(target, ..target).is_ok()
}

fn snapshot_stream_meta(ictx: &ffmpeg::format::context::Input) -> Vec<RecordStreamMeta> {
    ictx.streams()
        .filter_map(|s| {
            let kind = match s.parameters().medium() {
                MediaType::Video => MediaKind::Video,
                MediaType::Audio => MediaKind::Audio,
                _ => return None,
            };
            Some(RecordStreamMeta {
                input_index: s.index(),
                media_kind: kind,
                time_base: s.time_base(),
                parameters: s.parameters(),
            })
        })
        .collect()
}

fn push_eof(shared: &Arc<Shared>, video_index: Option<usize>, audio_index: Option<usize>) {
    if let Some(idx) = video_index {
        let eof = Packet::eof(idx, shared.video_queue.serial());
        shared.video_queue.push(eof.clone(), Timeout::BLOCKING);
        if let Some((video_tee, _)) = shared.record_queues.lock().unwrap().as_ref() {
            video_tee.push(eof, Timeout::NONBLOCKING);
        }
    }
    if let Some(idx) = audio_index {
        let eof = Packet::eof(idx, shared.audio_queue.serial());
        shared.audio_queue.push(eof.clone(), Timeout::BLOCKING);
        if let Some((_, audio_tee)) = shared.record_queues.lock().unwrap().as_ref() {
            audio_tee.push(eof, Timeout::NONBLOCKING);
        }
    }
}

fn route_packet(
    shared: &Arc<Shared>,
    stream_index: usize,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    packet: &ffmpeg::Packet,
) {
    if Some(stream_index) == video_index {
        let pkt = to_packet(packet, stream_index, shared.video_queue.serial());
        let tee = pkt.clone();
        shared.video_queue.push(pkt, Timeout::BLOCKING);
        if let Some((video_tee, _)) = shared.record_queues.lock().unwrap().as_ref() {
            video_tee.push(tee, Timeout::NONBLOCKING);
        }
    } else if Some(stream_index) == audio_index {
        let pkt = to_packet(packet, stream_index, shared.audio_queue.serial());
        let tee = pkt.clone();
        shared.audio_queue.push(pkt, Timeout::BLOCKING);
        if let Some((_, audio_tee)) = shared.record_queues.lock().unwrap().as_ref() {
            audio_tee.push(tee, Timeout::NONBLOCKING);
        }
    }
}

fn to_packet(packet: &ffmpeg::Packet, stream_index: usize, serial: playback_types::Serial) -> Packet {
    let data = packet.data().unwrap_or(&[]).to_vec();
    Packet::new(
        data,
        stream_index,
        packet.pts(),
        packet.dts(),
        packet.duration(),
        packet.is_key(),
        serial,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_demuxer_has_no_streams() {
        let events = Arc::new(EventDispatcher::new());
        let demuxer = Demuxer::new(events);
        assert!(!demuxer.has_video());
        assert!(!demuxer.has_audio());
        assert!(!demuxer.is_recording());
    }

    #[test]
    fn pause_resume_no_op_before_open() {
        let events = Arc::new(EventDispatcher::new());
        let demuxer = Demuxer::new(events);
        assert!(!demuxer.pause());
        assert!(!demuxer.resume());
    }
}
