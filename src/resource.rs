//! Resource limits a host configures before running a program (spec.md §5).
//! Grounded on `ouros`'s execution-budget config struct: fixed-capacity
//! limits checked during execution rather than allowed to grow unbounded.

use std::time::Duration;

/// Caps enforced by the VM. Exceeding any of these raises a `Runtime` (for
/// stack/frame/global overflow) or `Timeout` `ApeError` rather than
/// panicking or growing without bound.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Maximum live values on the operand stack.
    pub stack_size: usize,
    /// Maximum call depth (active frames).
    pub max_frames: usize,
    /// Maximum number of module-global slots across a context.
    pub max_globals: usize,
    /// Heap allocations between automatic GC cycles (`Heap::collect_threshold`).
    pub gc_threshold: usize,
    /// Wall-clock budget for a single `Context::run` call. `None` disables
    /// the check — the default, since most embeddings run trusted scripts.
    pub max_execution_time: Option<Duration>,
    /// How many executed instructions between timeout checks. Checking
    /// every instruction would dominate runtime cost on tight loops; this
    /// amortizes the `Instant::now()` call.
    pub timeout_check_interval: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            max_frames: 2048,
            max_globals: 4096,
            gc_threshold: 10_000,
            max_execution_time: None,
            timeout_check_interval: 4096,
        }
    }
}

impl ExecutionConfig {
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.max_execution_time = Some(duration);
        self
    }
}
