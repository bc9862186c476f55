// crates/playback-types/src/packet.rs
//
// Packet: owning wrapper around one compressed unit read from the demuxer.
//
// This is plain data — no FFmpeg handle lives here. playback-engine wraps a
// real `ffmpeg_the_third::Packet` and fills one of these in at the queue
// boundary (and does the reverse on dequeue for FFI calls that still want the
// native type, e.g. the recorder's `write_interleaved`).

use std::sync::Arc;

use crate::Serial;

/// A compressed packet plus enough metadata to decode, reorder, and — for the
/// recorder — remux it.
///
/// Cloning a `Packet` bumps a reference count on the underlying buffer rather
/// than copying bytes, mirroring the native codec library's refcounted
/// `AVPacket` buffers.
#[derive(Clone, Debug)]
pub struct Packet {
    data: Arc<[u8]>,
    /// Index into the source's stream list this packet belongs to.
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in the stream's time base.
    pub duration: i64,
    pub is_keyframe: bool,
    /// Epoch this packet was produced in; queues stamp this at push time.
    pub serial: Serial,
}

impl Packet {
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        stream_index: usize,
        pts: Option<i64>,
        dts: Option<i64>,
        duration: i64,
        is_keyframe: bool,
        serial: Serial,
    ) -> Self {
        Self {
            data: data.into(),
            stream_index,
            pts,
            dts,
            duration,
            is_keyframe,
            serial,
        }
    }

    /// An empty packet, used as the EOF sentinel pushed into a queue when the
    /// source is exhausted.
    pub fn eof(stream_index: usize, serial: Serial) -> Self {
        Self {
            data: Arc::from([]),
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            is_keyframe: false,
            serial,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_packet_has_no_bytes() {
        let p = Packet::eof(0, 3);
        assert!(p.is_eof());
        assert_eq!(p.size(), 0);
        assert_eq!(p.serial, 3);
    }

    #[test]
    fn clone_is_cheap_refcount_bump() {
        let p = Packet::new(vec![1, 2, 3], 0, Some(10), Some(10), 5, true, 1);
        let q = p.clone();
        assert_eq!(p.data().as_ptr(), q.data().as_ptr());
    }
}
