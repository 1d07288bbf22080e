/// Tuning knobs for host execution.
///
/// ```ignore
/// let cfg = HostConfig::default().with_parallel_threshold(1 << 20).with_workers(4);
/// let dev = CpuDevice::with_config(cfg)?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Element count above which element-wise work is split across threads.
    pub parallel_threshold: usize,
    /// Fork-join stops bisecting below this many elements.
    pub grain_size: usize,
    /// Number of worker partitions for outer-loop parallelism.
    pub workers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            parallel_threshold: 65_536,
            grain_size: 4_096,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl HostConfig {
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_grain_size(mut self, grain: usize) -> Self {
        self.grain_size = grain.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Everything runs on the calling thread.
    pub fn sequential() -> Self {
        HostConfig {
            parallel_threshold: usize::MAX,
            grain_size: usize::MAX,
            workers: 1,
        }
    }

    #[inline]
    pub(crate) fn parallel(&self, n: usize) -> bool {
        n > self.parallel_threshold
    }
}
