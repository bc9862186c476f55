// crates/playback-engine/src/packet_queue.rs
//
// PacketQueue: bounded FIFO of Packet with blocking push/pop, abort, flush,
// and serial (epoch) bump. The linchpin of the seek/reconnect protocol —
// `flush` is what lets a seek or reopen discard packets a decoder already has
// in flight, by making their stamped serial stale.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use playback_types::{Packet, Serial};

/// A wait with a negative duration blocks indefinitely; zero returns
/// immediately without waiting; positive bounds the wait to that many
/// milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeout(pub i64);

impl Timeout {
    pub const BLOCKING: Timeout = Timeout(-1);
    pub const NONBLOCKING: Timeout = Timeout(0);
}

struct State {
    items: VecDeque<Packet>,
    capacity: usize,
    byte_size: usize,
    duration: i64,
    serial: Serial,
    aborted: bool,
}

/// Bounded FIFO of [`Packet`]. Each instance owns its own mutex + condvar, as
/// required by the no-cross-component-locking policy: no other component's
/// lock is ever held while blocked on this one.
pub struct PacketQueue {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                capacity,
                byte_size: 0,
                duration: 0,
                serial: 0,
                aborted: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Push `pkt`. Blocks while `count >= capacity && !aborted`, per `timeout`.
    /// Returns `false` if aborted or the timeout elapsed before room freed up.
    pub fn push(&self, pkt: Packet, timeout: Timeout) -> bool {
        let guard = self.state.lock().unwrap();
        let (mut guard, ok) = wait_while(&self.not_full, guard, timeout, |s| {
            s.items.len() >= s.capacity && !s.aborted
        });
        if !ok || guard.aborted {
            return false;
        }
        guard.byte_size += pkt.size();
        guard.duration += pkt.duration;
        guard.items.push_back(pkt);
        drop(guard);
        self.not_empty.notify_one();
        true
    }

    /// Pop the oldest packet. Blocks while `count == 0 && !aborted`, per
    /// `timeout`. Returns `None` if aborted or the timeout elapsed empty.
    pub fn pop(&self, timeout: Timeout) -> Option<Packet> {
        let guard = self.state.lock().unwrap();
        let (mut guard, ok) = wait_while(&self.not_empty, guard, timeout, |s| {
            s.items.is_empty() && !s.aborted
        });
        if !ok {
            return None;
        }
        let pkt = guard.items.pop_front()?;
        guard.byte_size = guard.byte_size.saturating_sub(pkt.size());
        guard.duration = guard.duration.saturating_sub(pkt.duration);
        drop(guard);
        self.not_full.notify_one();
        Some(pkt)
    }

    /// Drain the queue, reset counters, and bump the serial. Future pushes
    /// are stamped with the new serial; consumers holding the old serial
    /// discard anything still in flight by comparing against `serial()`.
    pub fn flush(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.items.clear();
        guard.byte_size = 0;
        guard.duration = 0;
        guard.serial += 1;
        drop(guard);
        self.not_full.notify_all();
    }

    /// Wake all waiters; subsequent blocking calls return immediately until
    /// [`PacketQueue::resume`] is called.
    pub fn abort(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.aborted = true;
        drop(guard);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().aborted = false;
    }

    pub fn serial(&self) -> Serial {
        self.state.lock().unwrap().serial
    }

    pub fn is_full(&self) -> bool {
        let guard = self.state.lock().unwrap();
        guard.items.len() >= guard.capacity
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.state.lock().unwrap().byte_size
    }

    pub fn duration(&self) -> i64 {
        self.state.lock().unwrap().duration
    }

    pub fn set_capacity(&self, n: usize) {
        let mut guard = self.state.lock().unwrap();
        guard.capacity = n;
        drop(guard);
        self.not_full.notify_all();
    }
}

/// Wait on `cvar` while `predicate(state)` holds, honoring `timeout`'s
/// blocking/nonblocking/bounded semantics. Returns the (possibly
/// re-acquired) guard and `false` only when a bounded wait elapsed with the
/// predicate still true.
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
    use playback_types::Packet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn pkt(n: i64, serial: Serial) -> Packet {
        Packet::new(vec![0u8; 4], 0, Some(n), Some(n), 1, n == 0, serial)
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let q = PacketQueue::new(2);
        assert!(q.push(pkt(0, 0), Timeout::NONBLOCKING));
        assert!(q.push(pkt(1, 0), Timeout::NONBLOCKING));
        assert!(!q.push(pkt(2, 0), Timeout::NONBLOCKING));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_nonblocking_on_empty_queue_returns_none() {
        let q = PacketQueue::new(4);
        assert!(q.pop(Timeout::NONBLOCKING).is_none());
    }

    #[test]
    fn flush_resets_and_bumps_serial() {
        let q = PacketQueue::new(4);
        q.push(pkt(0, 0), Timeout::NONBLOCKING);
        assert_eq!(q.serial(), 0);
        q.flush();
        assert_eq!(q.serial(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn packets_after_flush_carry_new_serial_and_are_discarded_by_stale_consumers() {
        let q = PacketQueue::new(4);
        q.flush();
        let s = q.serial();
        q.push(pkt(0, s), Timeout::NONBLOCKING);
        let got = q.pop(Timeout::NONBLOCKING).unwrap();
        assert_eq!(got.serial, s);
    }

    #[test]
    fn abort_wakes_blocked_pop() {
        let q = Arc::new(PacketQueue::new(4));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop(Timeout::BLOCKING));
        thread::sleep(StdDuration::from_millis(50));
        q.abort();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn bounded_timeout_on_full_queue_returns_false() {
        let q = PacketQueue::new(1);
        assert!(q.push(pkt(0, 0), Timeout::NONBLOCKING));
        let start = Instant::now();
        assert!(!q.push(pkt(1, 0), Timeout(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
