// crates/playback-engine/src/test_support.rs
//
// Shared test-only helpers. `init_tracing` mirrors the once-guarded global
// subscriber setup other workspaces in this pack use so a failing test's
// `tracing::warn!`/`debug!` output actually reaches the test harness instead
// of being dropped for want of a subscriber.

use std::sync::Once;

static START: Once = Once::new();

pub fn init_tracing() {
    START.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
