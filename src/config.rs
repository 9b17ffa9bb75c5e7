//! Constants and tunables, plus the knobs the Manager carries as plain
//! fields instead of process-wide globals.

use std::time::Duration;

/// Debounce window the Watcher waits before handing an accumulated event
/// set to `Index::reload`.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Fallback poll interval when directory notifications aren't available
/// (platform lacks support, or the directory doesn't exist yet).
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// Derived-key length used by every KDF.
pub const SCRYPT_DKLEN: usize = 32;

/// scrypt cost parameters. `Standard` is the default; `Light` trades
/// security margin for interactive latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl ScryptParams {
    pub const STANDARD: ScryptParams = ScryptParams { n: 1 << 18, r: 8, p: 1 };
    pub const LIGHT: ScryptParams = ScryptParams { n: 1 << 12, r: 8, p: 6 };
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Selects which [`Index`](crate::index::Index) implementation the
/// `Manager` opens: an in-memory sorted view, or a `sled`-backed
/// persistent variant that avoids re-scanning every key file at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexKind {
    #[default]
    Memory,
    Persistent,
}

/// Upper bound on concurrent per-file parses during a reconcile fan-out.
pub fn reconcile_fanout_limit() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(500)
}

/// Batch size for new-account upserts during reconcile Phase B.
pub fn reconcile_batch_size(persistent: bool) -> usize {
    if persistent { 20_000 } else { 10_000 }
}
