//! Error handling for value handles.

use derive_more::{Display, Error};

/// Result type for handle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by handle, proxy and call operations.
///
/// Nothing in this crate recovers from these; they are returned to the
/// caller as soon as they are detected.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum Error {
    /// The handle or proxy has no owning context.
    #[display("invalid handle: {_0}")]
    InvalidHandle(#[error(not(source))] &'static str),

    /// The operation is not supported by the handle's kind.
    #[display("type error: {_0}")]
    TypeError(#[error(not(source))] &'static str),

    /// Handles from two different contexts were combined.
    #[display("cross-context value")]
    CrossContext,

    /// A proxy created without a container was read or written.
    #[display("proxy is not bound to a table")]
    NotBoundToTable,

    /// The runtime raised an error during a protected call.
    #[display("script error: {_0}")]
    Script(#[error(not(source))] String),

    /// A call produced more than one result under the single-return policy.
    #[display("a function may not return more than 1 value (got {_0})")]
    TooManyReturns(#[error(not(source))] usize),

    /// The interpreter stack cannot grow to hold a call's arguments.
    #[display("stack overflow")]
    StackOverflow,
}
