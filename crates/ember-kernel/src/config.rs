/// What happens to the holder of a contended mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexPolicy {
    /// The holder is raised to the priority of its most urgent waiter until it releases.
    #[default]
    PriorityInheritance,
    /// The holder keeps its own priority; a low-priority holder simply blocks waiters.
    None,
}

/// Kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Instructions a thread may run before round-robin rotation within its priority.
    pub quantum: u64,
    /// Virtual CPU frequency used to turn executed instructions into guest time.
    pub cpu_hz: u64,
    /// Maximum live handles in one process's table.
    pub handle_capacity: usize,
    /// Maximum live kernel objects.
    pub object_limit: usize,
    pub mutex_policy: MutexPolicy,
    /// Stack size of threads created without an explicit size.
    pub default_stack_size: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            quantum: 10_000,
            cpu_hz: 100_000_000,
            handle_capacity: 4096,
            object_limit: 65_536,
            mutex_policy: MutexPolicy::default(),
            default_stack_size: 0x8000,
        }
    }
}
