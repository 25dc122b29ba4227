//! Fixed resource ceilings applied to every sandbox.

const GIB: i64 = 1 << 30;
const MIB: i64 = 1 << 20;

/// Resource limits handed to the engine when a sandbox is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    /// Equal to `memory_bytes`, so no swap on top of memory.
    pub memory_swap_bytes: i64,
    pub kernel_memory_bytes: i64,
    pub disk_quota_bytes: i64,
    pub pids_limit: i64,
    pub cpu_period_micros: i64,
    /// Portion of `cpu_period_micros` the sandbox may run.
    pub cpu_quota_micros: i64,
    pub ipc_mode: &'static str,
}

impl ResourceLimits {
    /// Limits used for every stage: 1 GiB memory and disk, 512 MiB kernel memory,
    /// 1024 processes, 90% of one CPU, private IPC namespace.
    pub const STANDARD: ResourceLimits = ResourceLimits {
        memory_bytes: GIB,
        memory_swap_bytes: GIB,
        kernel_memory_bytes: 512 * MIB,
        disk_quota_bytes: GIB,
        pids_limit: 1024,
        cpu_period_micros: 100_000,
        cpu_quota_micros: 90_000,
        ipc_mode: "private",
    };

    /// Average share of one logical CPU.
    pub fn cpu_share(&self) -> f64 {
        self.cpu_quota_micros as f64 / self.cpu_period_micros as f64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::STANDARD
    }
}
