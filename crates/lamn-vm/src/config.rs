/// Resource limits for a [`Vm`](crate::Vm).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames a single thread may hold before a call fails with `stack overflow`.
    pub max_call_depth: usize,
    /// Value-stack cells a single thread may hold when entering a call.
    pub max_stack: usize,
    /// Metatable links followed by one table read.
    pub max_chain_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 200,
            max_stack: 1_000_000,
            max_chain_depth: 100,
        }
    }
}

impl VmConfig {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_stack(mut self, cells: usize) -> Self {
        self.max_stack = cells;
        self
    }

    pub fn with_max_chain_depth(mut self, links: usize) -> Self {
        self.max_chain_depth = links;
        self
    }
}
