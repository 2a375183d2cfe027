use crate::graph::TaskGraph;

/// A builder for creating a [`TaskGraph`] with specified settings.
///
/// ```rust
/// use taskgraph::TaskGraph;
///
/// let graph = TaskGraph::config().catch_panics(false).finish();
/// assert!(graph.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) detect_cycles: bool,
    pub(crate) catch_panics: bool,
}

impl Config {
    pub(crate) fn new() -> Self {
        Self {
            detect_cycles: true,
            catch_panics: true,
        }
    }

    /// Reject redefinitions that would make a task depend on itself.
    ///
    /// Enabled by default. With the check disabled such a redefinition is
    /// accepted and evaluating the cycle recurses until the stack overflows.
    pub fn detect_cycles(mut self, enabled: bool) -> Self {
        self.detect_cycles = enabled;
        self
    }

    /// Report panics raised inside task functions as task failures instead of
    /// unwinding through the caller of `compute`.
    ///
    /// Enabled by default.
    pub fn catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    pub fn finish(self) -> TaskGraph {
        TaskGraph::with_config(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
