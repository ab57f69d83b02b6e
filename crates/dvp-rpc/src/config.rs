//! RPC context configuration.

use serde::{Deserialize, Serialize};

/// Default number of reopen attempts after a peer restart.
pub const DEFAULT_RESTART_RETRIES: u32 = 3;

/// Tunables for an [`RpcContext`](crate::context::RpcContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Reopen attempts made for cores without an explicitly registered
    /// restart handler.
    pub restart_retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            restart_retries: DEFAULT_RESTART_RETRIES,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_restart_retries(mut self, retries: u32) -> Self {
        self.restart_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(RpcConfig::default().restart_retries, 3);
        assert_eq!(RpcConfig::new().with_restart_retries(0).restart_retries, 0);
    }
}
