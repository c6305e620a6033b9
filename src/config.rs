//! Per-context configuration.

/// How the results of a call are aggregated into a return value.
///
/// The policy is fixed when a [`RuntimeContext`](crate::RuntimeContext) is
/// created and applies to every call made through it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReturnPolicy {
    /// At most one result; two or more is an error.
    Single,
    /// Two or more results are packed into a table keyed from 0.
    #[default]
    Table,
    /// Every result is returned in order.
    Vector,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextConfig {
    pub return_policy: ReturnPolicy,
    /// Load the standard libraries when the context is created.
    pub open_libs: bool,
}

impl ContextConfig {
    pub fn with_return_policy(mut self, policy: ReturnPolicy) -> Self {
        self.return_policy = policy;
        self
    }

    pub fn with_open_libs(mut self, open: bool) -> Self {
        self.open_libs = open;
        self
    }
}
