//! Memory manager configuration.

use serde::{Deserialize, Serialize};

/// Allocator limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Upper bound on bytes held by live allocations.  `None` means the
    /// allocator is only bounded by the host.
    pub limit_bytes: Option<usize>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap live allocations at `bytes`.
    pub fn with_limit_bytes(mut self, bytes: usize) -> Self {
        self.limit_bytes = Some(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unbounded() {
        assert_eq!(MemoryConfig::default().limit_bytes, None);
    }

    #[test]
    fn builder_sets_limit() {
        let cfg = MemoryConfig::new().with_limit_bytes(1 << 20);
        assert_eq!(cfg.limit_bytes, Some(1 << 20));
    }
}
