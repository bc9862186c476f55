// crates/playback-engine/src/lib.rs
//
// playback-engine: the pipelined demux/decode/sync/record fabric plus the
// Controller that sequences it. Each module below owns one stage of the
// pipeline and runs it on its own OS thread; `playback_types` carries the
// data and error types shared across the stage boundaries.

pub mod audio_decoder;
pub mod clock;
pub mod controller;
pub mod demuxer;
pub mod event_dispatcher;
pub mod frame_queue;
pub mod hwaccel;
pub mod packet_queue;
pub mod pre_buffer;
pub mod recorder;
pub mod resampler;
pub mod sync_controller;
pub mod video_decoder;

#[cfg(test)]
pub(crate) mod test_support;

pub use audio_decoder::AudioDecoder;
pub use clock::Clock;
pub use controller::{AsyncOpenResult, AsyncOpenStatus, Controller, PlaybackState};
pub use demuxer::{DecoderStreamParams, Demuxer, RecordStreamMeta};
pub use event_dispatcher::{ConnectionType, EventDispatcher, ListenerHandle};
pub use frame_queue::FrameQueue;
pub use hwaccel::HwAccelContext;
pub use packet_queue::{PacketQueue, Timeout};
pub use pre_buffer::PreBufferGate;
pub use recorder::Recorder;
pub use resampler::SpeedResampler;
pub use sync_controller::{MasterClock, SyncController};
pub use video_decoder::VideoDecoder;
