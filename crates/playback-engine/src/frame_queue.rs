// crates/playback-engine/src/frame_queue.rs
//
// FrameQueue: bounded ring buffer of Frame with a writer-reserves/commits and
// reader-peeks/next protocol, plus a simpler blocking pop() for consumers
// that don't need to peek ahead. `keep_last` holds the most recently shown
// slot peekable (for repaint) without double-releasing it.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use playback_types::{Frame, Serial};

use crate::packet_queue::Timeout;

struct State {
    slots: Vec<Option<Frame>>,
    capacity: usize,
    read_index: usize,
    write_index: usize,
    /// 0 until the first frame has been shown; once set (keep_last queues
    /// only) it stays 1 for the life of the queue.
    shown: usize,
    size: usize,
    serial: Serial,
    aborted: bool,
}

/// Bounded ring of [`Frame`]. Like [`crate::packet_queue::PacketQueue`], each
/// instance owns its own mutex + condvar.
pub struct FrameQueue {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    keep_last: bool,
}

impl FrameQueue {
    pub fn new(capacity: usize, keep_last: bool) -> Self {
        assert!(capacity > 0);
        Self {
            state: Mutex::new(State {
                slots: (0..capacity).map(|_| None).collect(),
                capacity,
                read_index: 0,
                write_index: 0,
                shown: 0,
                size: 0,
                serial: 0,
                aborted: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            keep_last,
        }
    }

    /// Block until a writable slot is free, per `timeout`'s semantics.
    /// Returns `false` if aborted or the timeout elapsed still full.
    pub fn reserve_writable(&self, timeout: Timeout) -> bool {
        let guard = self.state.lock().unwrap();
        let (guard, ok) = wait_while(&self.not_full, guard, timeout, |s| {
            s.size >= s.capacity && !s.aborted
        });
        ok && !guard.aborted
    }

    /// Publish `frame` into the slot reserved by [`FrameQueue::reserve_writable`]
    /// and wake a waiting reader. Must only be called after a successful
    /// reservation; never blocks.
    pub fn commit(&self, frame: Frame) {
        let mut guard = self.state.lock().unwrap();
        let idx = guard.write_index;
        guard.slots[idx] = Some(frame);
        guard.write_index = (idx + 1) % guard.capacity;
        guard.size += 1;
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Block until a readable frame is available, per `timeout`'s semantics.
    pub fn reserve_readable(&self, timeout: Timeout) -> bool {
        let guard = self.state.lock().unwrap();
        let (guard, ok) = wait_while(&self.not_empty, guard, timeout, |s| {
            s.size.saturating_sub(s.shown) == 0 && !s.aborted
        });
        ok && guard.size.saturating_sub(guard.shown) > 0
    }

    /// The currently displayed/next-to-display frame, without consuming it.
    pub fn peek(&self) -> Option<Frame> {
        let guard = self.state.lock().unwrap();
        let idx = (guard.read_index + guard.shown) % guard.capacity;
        guard.slots[idx].clone()
    }

    /// The frame after the one [`FrameQueue::peek`] returns, if any.
    pub fn peek_next(&self) -> Option<Frame> {
        let guard = self.state.lock().unwrap();
        if guard.size.saturating_sub(guard.shown) < 2 {
            return None;
        }
        let idx = (guard.read_index + guard.shown + 1) % guard.capacity;
        guard.slots[idx].clone()
    }

    /// The last frame released to the reader (only meaningful in `keep_last`
    /// mode, where it stays alive for repaint).
    pub fn peek_last(&self) -> Option<Frame> {
        let guard = self.state.lock().unwrap();
        guard.slots[guard.read_index].clone()
    }

    /// Release the current readable slot and advance. In `keep_last` mode the
    /// very first call only marks a frame as shown, without releasing it, so
    /// a late repaint still has something to draw; every call after that (and
    /// every call when `keep_last` is off) releases and advances normally.
    pub fn next(&self) {
        let mut guard = self.state.lock().unwrap();
        if self.keep_last && guard.shown == 0 {
            guard.shown = 1;
            return;
        }
        let idx = guard.read_index;
        guard.slots[idx] = None;
        guard.read_index = (idx + 1) % guard.capacity;
        guard.size -= 1;
        drop(guard);
        self.not_full.notify_one();
    }

    /// Simple blocking consume: wait for a frame, take ownership, advance.
    /// Equivalent to `reserve_readable` + `peek` + `next` for consumers that
    /// don't need the peek-ahead/keep-last protocol.
    pub fn pop(&self, timeout: Timeout) -> Option<Frame> {
        let guard = self.state.lock().unwrap();
        let (mut guard, ok) = wait_while(&self.not_empty, guard, timeout, |s| {
            s.size.saturating_sub(s.shown) == 0 && !s.aborted
        });
        if !ok || guard.size.saturating_sub(guard.shown) == 0 {
            return None;
        }
        let idx = (guard.read_index + guard.shown) % guard.capacity;
        let frame = guard.slots[idx].take();
        guard.slots[idx] = None;
        guard.read_index = (idx + 1) % guard.capacity;
        guard.size -= 1;
        guard.shown = 0;
        drop(guard);
        self.not_full.notify_one();
        frame
    }

    /// Frames readable right now, not counting a held `keep_last` slot.
    pub fn remaining(&self) -> usize {
        let guard = self.state.lock().unwrap();
        guard.size.saturating_sub(guard.shown)
    }

    pub fn serial(&self) -> Serial {
        self.state.lock().unwrap().serial
    }

    /// Stamp the queue's current serial directly, without draining slots or
    /// waking waiters. Unlike `flush`, this does not imply a reset — it
    /// exists for callers that track the owning epoch externally (e.g. a
    /// decoder re-anchoring to its `PacketQueue`'s serial) and need the
    /// `FrameQueue` to agree without also discarding buffered frames.
    pub fn set_serial(&self, serial: Serial) {
        self.state.lock().unwrap().serial = serial;
    }

    pub fn set_aborted(&self, aborted: bool) {
        let mut guard = self.state.lock().unwrap();
        guard.aborted = aborted;
        drop(guard);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    /// Drain all slots, reset read/write/shown/size, and bump the serial.
    pub fn flush(&self) {
        let mut guard = self.state.lock().unwrap();
        for slot in guard.slots.iter_mut() {
            *slot = None;
        }
        guard.read_index = 0;
        guard.write_index = 0;
        guard.shown = 0;
        guard.size = 0;
        guard.serial += 1;
        drop(guard);
        self.not_full.notify_all();
    }
}

fn wait_while<'a>(
    cvar: &Condvar,
    mut guard: std::sync::MutexGuard<'a, State>,
    timeout: Timeout,
    predicate: impl Fn(&State) -> bool,
) -> (std::sync::MutexGuard<'a, State>, bool) {
    if timeout.0 == 0 {
        let ok = !predicate(&guard);
        return (guard, ok);
    }
    if timeout.0 < 0 {
        while predicate(&guard) {
            guard = cvar.wait(guard).unwrap();
        }
        return (guard, true);
    }
    let deadline = Instant::now() + Duration::from_millis(timeout.0 as u64);
    loop {
        if !predicate(&guard) {
            return (guard, true);
        }
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        let (g, timeout_result) = cvar.wait_timeout(guard, deadline - now).unwrap();
        guard = g;
        if timeout_result.timed_out() && predicate(&guard) {
            return (guard, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playback_types::FrameFormat;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn frame(pts: f64, serial: Serial) -> Frame {
        Frame::new(
            vec![0u8; 4],
            FrameFormat::Video { width: 2, height: 2, pixel_format: 0 },
            serial,
            pts,
            1.0 / 30.0,
            false,
        )
    }

    #[test]
    fn reserve_writable_blocks_once_full() {
        let q = FrameQueue::new(1, false);
        assert!(q.reserve_writable(Timeout::NONBLOCKING));
        q.commit(frame(0.0, 0));
        assert!(!q.reserve_writable(Timeout::NONBLOCKING));
    }

    #[test]
    fn pop_without_keep_last_releases_every_call() {
        let q = FrameQueue::new(2, false);
        q.reserve_writable(Timeout::NONBLOCKING);
        q.commit(frame(0.0, 0));
        q.reserve_writable(Timeout::NONBLOCKING);
        q.commit(frame(1.0 / 30.0, 0));
        assert_eq!(q.remaining(), 2);
        let f0 = q.pop(Timeout::NONBLOCKING).unwrap();
        assert_eq!(f0.pts_seconds, 0.0);
        assert_eq!(q.remaining(), 1);
        let f1 = q.pop(Timeout::NONBLOCKING).unwrap();
        assert_eq!(f1.pts_seconds, 1.0 / 30.0);
        assert_eq!(q.remaining(), 0);
    }

    #[test]
    fn keep_last_first_next_does_not_release_slot() {
        let q = FrameQueue::new(3, true);
        q.reserve_writable(Timeout::NONBLOCKING);
        q.commit(frame(0.0, 0));
        q.reserve_writable(Timeout::NONBLOCKING);
        q.commit(frame(1.0 / 30.0, 0));

        assert_eq!(q.peek().unwrap().pts_seconds, 0.0);
        q.next();
        // first next() only marks shown, the slot is still the one peeked
        assert_eq!(q.peek_last().unwrap().pts_seconds, 0.0);
        assert_eq!(q.peek().unwrap().pts_seconds, 1.0 / 30.0);

        q.next();
        // second next() releases the first slot and advances
        assert_eq!(q.peek_last().unwrap().pts_seconds, 1.0 / 30.0);
    }

    #[test]
    fn flush_bumps_serial_and_clears_slots() {
        let q = FrameQueue::new(2, false);
        q.reserve_writable(Timeout::NONBLOCKING);
        q.commit(frame(0.0, 0));
        assert_eq!(q.serial(), 0);
        q.flush();
        assert_eq!(q.serial(), 1);
        assert_eq!(q.remaining(), 0);
    }

    #[test]
    fn set_serial_stamps_without_touching_slots() {
        let q = FrameQueue::new(2, false);
        q.reserve_writable(Timeout::NONBLOCKING);
        q.commit(frame(0.0, 0));
        q.set_serial(7);
        assert_eq!(q.serial(), 7);
        assert_eq!(q.remaining(), 1);
    }

    #[test]
    fn abort_wakes_blocked_reserve_readable() {
        let q = Arc::new(FrameQueue::new(2, false));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.reserve_readable(Timeout::BLOCKING));
        thread::sleep(StdDuration::from_millis(50));
        q.set_aborted(true);
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn bounded_timeout_on_empty_queue_returns_false() {
        let q = FrameQueue::new(2, false);
        let start = Instant::now();
        assert!(q.pop(Timeout(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
