/// Which runtime backs a [`Device`](crate::Device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// The CUDA device with this ordinal. Needs the `cuda` feature.
    Cuda { ordinal: usize },
    /// The in-process emulator: kernels run their emulated bodies on the
    /// host. A test double for machines without a GPU.
    Emulator,
}

/// Launch and allocation settings for a [`Device`](crate::Device).
///
/// ```ignore
/// let cfg = DeviceConfig::cuda(1).with_local_size(128).with_label("bench");
/// let device = Device::with_config(cfg)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub runtime: RuntimeKind,
    /// Work-group (block) size for 1-D launches.
    pub local_size: usize,
    /// Keys processed per online-softmax step in the attention kernels.
    pub attention_tile: usize,
    /// Shown in the device name and in logs.
    pub label: String,
    /// Upper bound on live buffer bytes; `None` means unbounded.
    pub memory_limit: Option<usize>,
}

impl Default for DeviceConfig {
    /// CUDA device 0.
    fn default() -> Self {
        DeviceConfig::cuda(0)
    }
}

impl DeviceConfig {
    pub fn cuda(ordinal: usize) -> Self {
        DeviceConfig {
            runtime: RuntimeKind::Cuda { ordinal },
            local_size: 64,
            attention_tile: 32,
            label: "cuda".to_string(),
            memory_limit: None,
        }
    }

    pub fn emulator() -> Self {
        DeviceConfig {
            runtime: RuntimeKind::Emulator,
            label: "emulator".to_string(),
            ..DeviceConfig::cuda(0)
        }
    }

    pub fn with_local_size(mut self, local_size: usize) -> Self {
        self.local_size = local_size.max(1);
        self
    }

    pub fn with_attention_tile(mut self, tile: usize) -> Self {
        self.attention_tile = tile.max(1);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
}
