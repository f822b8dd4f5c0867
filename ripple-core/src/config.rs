//! Runtime configuration.

use crate::reactive::Runtime;

/// Tunables for a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How many times a single job may run within one flush.
    ///
    /// Effects that keep writing to each other's inputs would otherwise flush
    /// forever. When the limit is hit the remaining jobs are dropped and an
    /// error is logged.
    pub recursion_limit: usize,

    /// Number of registry entries that triggers a sweep of observers whose
    /// raw container has been dropped. The threshold doubles with the live
    /// population after each sweep.
    pub sweep_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 100,
            sweep_threshold: 64,
        }
    }
}

/// Builder for a [`Runtime`] with non-default configuration.
///
/// ```
/// use ripple_core::Runtime;
///
/// let rt = Runtime::builder().recursion_limit(16).build();
/// assert_eq!(rt.config().recursion_limit, 16);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set [`RuntimeConfig::recursion_limit`]. Zero is clamped to one.
    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.config.recursion_limit = limit.max(1);
        self
    }

    /// Set [`RuntimeConfig::sweep_threshold`]. Zero is clamped to one.
    pub fn sweep_threshold(mut self, threshold: usize) -> Self {
        self.config.sweep_threshold = threshold.max(1);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Runtime {
        Runtime::with_config(self.config)
    }
}
