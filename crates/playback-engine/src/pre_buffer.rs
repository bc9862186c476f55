// crates/playback-engine/src/pre_buffer.rs
//
// PreBufferGate: a one-shot startup barrier decoders block on before
// releasing their first frame. A watcher thread (owned by the Controller)
// polls the demuxer's packet queues against the configured thresholds and
// opens the gate once; every decoder waiting on it wakes and never blocks on
// it again for the life of that gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

const POLL_INTERVAL_MS: u64 = 5;

/// Blocks decoders until opened. Disabled (or already-open) gates never
/// block — `block_until_ready` returns immediately.
pub struct PreBufferGate {
    ready: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl PreBufferGate {
    /// A gate that starts open — used when pre-buffering is disabled in
    /// configuration, so decoders never pay the check.
    pub fn open_gate() -> Self {
        Self {
            ready: AtomicBool::new(true),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// A gate that starts closed, to be opened later by a watcher thread.
    pub fn closed_gate() -> Self {
        Self {
            ready: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Open the gate and wake everyone blocked on it. Idempotent.
    pub fn open(&self) {
        if self.ready.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.cvar.notify_all();
    }

    /// Reset to closed, for a fresh pre-buffer cycle (e.g. after a reopen).
    pub fn reset(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Block until the gate opens or `running` flips false. Returns `false`
    /// only in the latter case, so a caller can distinguish "gate opened"
    /// from "told to stop while waiting".
    pub fn block_until_ready(&self, running: &AtomicBool) -> bool {
        if self.is_ready() {
            return true;
        }
        let guard = self.lock.lock().unwrap();
        let (_guard, _timeout) = self
            .cvar
            .wait_timeout_while(guard, Duration::from_millis(50), |_| {
                !self.is_ready() && running.load(Ordering::Acquire)
            })
            .unwrap();
        self.is_ready()
    }
}

/// Threshold predicate the watcher evaluates against the demuxer's live
/// packet-queue lengths. `require_both` selects AND vs OR across the
/// streams that are actually present; a stream that isn't present is
/// vacuously satisfied so it never blocks the other one.
pub fn thresholds_met(
    has_video: bool,
    video_len: usize,
    video_frames_threshold: usize,
    has_audio: bool,
    audio_len: usize,
    audio_packets_threshold: usize,
    require_both: bool,
) -> bool {
    let video_ok = !has_video || video_len >= video_frames_threshold;
    let audio_ok = !has_audio || audio_len >= audio_packets_threshold;
    let met = if require_both {
        video_ok && audio_ok
    } else {
        video_ok || audio_ok
    };
    debug!(video_ok, audio_ok, require_both, met, "pre-buffer threshold check");
    met
}

pub const POLL_INTERVAL: Duration = Duration::from_millis(POLL_INTERVAL_MS);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn open_gate_never_blocks() {
        let gate = PreBufferGate::open_gate();
        let running = AtomicBool::new(true);
        assert!(gate.block_until_ready(&running));
    }

    #[test]
    fn closed_gate_blocks_until_opened() {
        let gate = Arc::new(PreBufferGate::closed_gate());
        let g2 = Arc::clone(&gate);
        let running = Arc::new(AtomicBool::new(true));
        let r2 = Arc::clone(&running);
        let handle = thread::spawn(move || g2.block_until_ready(&r2));
        thread::sleep(Duration::from_millis(20));
        gate.open();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn stopping_running_flag_unblocks_waiter() {
        let gate = Arc::new(PreBufferGate::closed_gate());
        let g2 = Arc::clone(&gate);
        let running = Arc::new(AtomicBool::new(true));
        let r2 = Arc::clone(&running);
        let handle = thread::spawn(move || g2.block_until_ready(&r2));
        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Release);
        let start = Instant::now();
        assert!(!handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn require_both_is_and_otherwise_or() {
        assert!(!thresholds_met(true, 5, 10, true, 100, 10, true));
        assert!(thresholds_met(true, 5, 10, true, 100, 10, false));
        assert!(thresholds_met(true, 10, 10, true, 10, 10, true));
    }

    #[test]
    fn absent_stream_is_vacuously_satisfied() {
        assert!(thresholds_met(false, 0, 10, true, 10, 10, true));
        assert!(thresholds_met(true, 10, 10, false, 0, 10, true));
    }
}
