// crates/playback-engine/src/clock.rs
//
// Clock: a wall-clock-anchored PTS tracker, one per stream (audio/video) plus
// an optional external clock. `get()` extrapolates from the last anchor point
// rather than storing a live-updating value, and returns NaN whenever the
// clock's last-set epoch no longer matches its source queue's current
// serial — the signal that whatever it was tracking got flushed out from
// under it (a seek or a stream reopen).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use playback_types::Serial;

/// Two clocks more than this many seconds apart are treated as unrelated
/// rather than merely drifted; `sync_to` re-anchors instead of easing in.
pub const NO_SYNC_THRESHOLD: f64 = 10.0;

pub(crate) fn monotonic_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

struct State {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    /// Serial this clock was last anchored at; `None` means never set /
    /// invalidated, and never equals a real queue serial.
    serial: Option<Serial>,
}

/// A PTS tracker anchored to wall-clock time. Constructed with a closure
/// that reports its source queue's current serial, so `get()` can detect
/// staleness without the clock owning (or locking) the queue itself.
pub struct Clock {
    state: Mutex<State>,
    paused: AtomicBool,
    queue_serial: Box<dyn Fn() -> Serial + Send + Sync>,
}

impl Clock {
    pub fn new(queue_serial: impl Fn() -> Serial + Send + Sync + 'static) -> Self {
        let clock = Self {
            state: Mutex::new(State {
                pts: f64::NAN,
                pts_drift: 0.0,
                last_updated: monotonic_seconds(),
                speed: 1.0,
                serial: None,
            }),
            paused: AtomicBool::new(false),
            queue_serial: Box::new(queue_serial),
        };
        clock
    }

    /// Current extrapolated PTS in seconds, or `NaN` if stale relative to
    /// the source queue's serial.
    pub fn get(&self) -> f64 {
        let guard = self.state.lock().unwrap();
        if guard.serial != Some((self.queue_serial)()) {
            return f64::NAN;
        }
        if self.paused.load(Ordering::Acquire) {
            return guard.pts;
        }
        let time = monotonic_seconds();
        guard.pts_drift + time - (time - guard.last_updated) * (1.0 - guard.speed)
    }

    /// Anchor the clock to `pts` at `serial`, timestamped `time` (monotonic
    /// seconds since process start, as returned by `monotonic_seconds`).
    pub fn set_at(&self, pts: f64, serial: Serial, time: f64) {
        let mut guard = self.state.lock().unwrap();
        guard.pts = pts;
        guard.last_updated = time;
        guard.pts_drift = pts - time;
        guard.serial = Some(serial);
    }

    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, monotonic_seconds());
    }

    /// Invalidate the clock: reads return NaN until the next `set`.
    pub fn init(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.pts = f64::NAN;
        guard.pts_drift = 0.0;
        guard.last_updated = monotonic_seconds();
        guard.serial = None;
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Re-anchor `speed`, preserving the current extrapolated PTS so the
    /// timeline doesn't jump at the moment speed changes.
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let mut guard = self.state.lock().unwrap();
        let serial = guard.serial;
        let time = monotonic_seconds();
        guard.pts = current;
        guard.last_updated = time;
        guard.pts_drift = current - time;
        guard.serial = serial;
        guard.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }

    /// The serial this clock was last anchored at (not the source queue's
    /// live serial — that's `queue_serial()`).
    pub fn epoch(&self) -> Option<Serial> {
        self.state.lock().unwrap().serial
    }

    /// Re-anchor `self` to `slave` if `slave` is live and either `self` is
    /// stale/uninitialized or the two have drifted more than
    /// [`NO_SYNC_THRESHOLD`] apart. Used to keep a non-master clock (e.g.
    /// video, when audio is master) from wandering off on its own.
    pub fn sync_to(&self, slave: &Clock) {
        let slave_pts = slave.get();
        if slave_pts.is_nan() {
            return;
        }
        let this_pts = self.get();
        let drifted = this_pts.is_nan() || (this_pts - slave_pts).abs() > NO_SYNC_THRESHOLD;
        if drifted {
            if let Some(serial) = slave.epoch() {
                self.set(slave_pts, serial);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn fixed_serial(s: Serial) -> impl Fn() -> Serial + Send + Sync + 'static {
        move || s
    }

    #[test]
    fn fresh_clock_reads_nan() {
        let clock = Clock::new(fixed_serial(0));
        assert!(clock.get().is_nan());
    }

    #[test]
    fn set_then_get_matches_serial() {
        let clock = Clock::new(fixed_serial(5));
        clock.set(1.5, 5);
        assert!(!clock.get().is_nan());
    }

    #[test]
    fn stale_serial_reads_nan() {
        let source = Arc::new(AtomicU64::new(0));
        let source2 = Arc::clone(&source);
        let clock = Clock::new(move || source2.load(Ordering::SeqCst));
        clock.set(1.5, 0);
        assert!(!clock.get().is_nan());
        source.store(1, Ordering::SeqCst);
        assert!(clock.get().is_nan());
    }

    #[test]
    fn paused_clock_holds_pts() {
        let clock = Clock::new(fixed_serial(0));
        clock.set(2.0, 0);
        clock.set_paused(true);
        let first = clock.get();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(clock.get(), first);
    }

    #[test]
    fn sync_to_reanchors_when_self_is_nan() {
        let master = Clock::new(fixed_serial(0));
        master.set(3.0, 0);
        let slave = Clock::new(fixed_serial(0));
        assert!(slave.get().is_nan());
        slave.sync_to(&master);
        assert!(!slave.get().is_nan());
    }

    #[test]
    fn sync_to_noop_when_master_is_nan() {
        let master = Clock::new(fixed_serial(0));
        let slave = Clock::new(fixed_serial(0));
        slave.set(1.0, 0);
        slave.sync_to(&master);
        assert!(!slave.get().is_nan());
    }
}
