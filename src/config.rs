/// Runtime tuning of the [`Engine`](crate::engine::Engine).
///
/// None of these settings changes results; they trade latency against CPU
/// time and memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capacity of the bounded task queue used by parallel runs.
    pub queue_capacity: usize,
    /// Exponential spin steps before a blocked thread starts yielding.
    pub spin_limit: u32,
    /// Clamp the requested worker count to the available hardware threads.
    pub clamp_workers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 20,
            spin_limit: 6,
            clamp_workers: true,
        }
    }
}

impl EngineConfig {
    /// Set the task queue capacity. Zero is raised to one.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the number of spin steps before yielding.
    #[must_use]
    pub fn with_spin_limit(mut self, spin_limit: u32) -> Self {
        self.spin_limit = spin_limit;
        self
    }

    /// Enable or disable clamping of the worker count.
    #[must_use]
    pub fn with_clamp_workers(mut self, clamp: bool) -> Self {
        self.clamp_workers = clamp;
        self
    }
}
