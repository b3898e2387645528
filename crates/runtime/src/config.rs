//! Environment-driven tuning (§4.5, §1 ambient stack), mirroring the
//! teacher's `SEQ_STRAND_REGISTRY_SIZE`-style env-var knobs.

/// Bytes-allocated threshold that triggers the first collection.
const DEFAULT_GC_INITIAL_BYTES: usize = 1024 * 1024;
/// Coroutine call-frame stack depth (§3: "fixed depth 64").
pub const MAX_CALL_DEPTH: usize = 64;
/// Per-coroutine value-stack slots (§3: "64×256 slots").
pub const MAX_STACK_SLOTS: usize = 64 * 256;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes-allocated threshold for the first GC; doubles after each one.
    pub gc_initial_bytes: usize,
    /// When set, `Heap::maybe_collect` runs on every allocation instead of
    /// only once the threshold is crossed (`EMBER_GC_STRESS`).
    pub gc_stress: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            gc_initial_bytes: DEFAULT_GC_INITIAL_BYTES,
            gc_stress: false,
        }
    }
}

impl Config {
    /// Reads `EMBER_GC_STRESS` (any non-empty value enables it) and
    /// `EMBER_GC_INITIAL_KB` (parsed as `usize`, falling back to the
    /// default on a missing or malformed value).
    pub fn from_env() -> Config {
        let mut cfg = Config::default();
        if std::env::var("EMBER_GC_STRESS").is_ok_and(|v| !v.is_empty()) {
            cfg.gc_stress = true;
        }
        if let Ok(kb) = std::env::var("EMBER_GC_INITIAL_KB") {
            if let Ok(kb) = kb.parse::<usize>() {
                cfg.gc_initial_bytes = kb * 1024;
            }
        }
        cfg
    }
}
