//! Call marshalling
//!
//! [`CallInvoker`] pushes a callee and its arguments, runs a protected
//! call requesting every result, and aggregates the results according to
//! the owning context's [`ReturnPolicy`]. The stack is restored to its
//! previous depth on every path, including errors.

use smallvec::SmallVec;
use tracing::debug;

use crate::config::ReturnPolicy;
use crate::context::{RuntimeContext, StackGuard};
use crate::error::{Error, Result};
use crate::state::MULT_RET;
use crate::value::{ValueHandle, ValueKind};

/// The aggregated results of a call.
#[derive(Debug)]
pub enum CallOutput<'lua> {
    /// Produced by the single and table policies.
    Value(ValueHandle<'lua>),
    /// Produced by the vector policy.
    Values(Vec<ValueHandle<'lua>>),
}

impl<'lua> CallOutput<'lua> {
    /// The single value; for a vector, its first element or `nil`.
    pub fn into_value(self) -> ValueHandle<'lua> {
        match self {
            CallOutput::Value(value) => value,
            CallOutput::Values(values) => values.into_iter().next().unwrap_or_default(),
        }
    }

    /// Every value; a single value becomes a one-element vector.
    pub fn into_values(self) -> Vec<ValueHandle<'lua>> {
        match self {
            CallOutput::Value(value) => vec![value],
            CallOutput::Values(values) => values,
        }
    }
}

/// Builder for one call.
pub struct CallInvoker<'c, 'lua> {
    callee: &'c ValueHandle<'lua>,
    args: SmallVec<[ValueHandle<'lua>; 8]>,
}

impl<'c, 'lua> CallInvoker<'c, 'lua> {
    pub fn new(callee: &'c ValueHandle<'lua>) -> Self {
        CallInvoker {
            callee,
            args: SmallVec::new(),
        }
    }

    pub fn arg<A>(mut self, arg: A) -> Self
    where
        A: Into<ValueHandle<'lua>>,
    {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ValueHandle<'lua>>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The context the call runs in.
    fn context(&self) -> Result<&'lua RuntimeContext> {
        match self.callee.kind() {
            ValueKind::Function | ValueKind::NativeFunction => self
                .callee
                .context()
                .ok_or(Error::InvalidHandle("native function literal has no context")),
            _ => Err(Error::TypeError("not callable")),
        }
    }

    pub fn invoke(self) -> Result<CallOutput<'lua>> {
        let context = self.context()?;
        for arg in &self.args {
            arg.check_context(context)?;
        }

        let state = context.state();
        let guard = StackGuard::new(state);
        let base = guard.top();

        state.ensure(self.args.len() + 1)?;
        self.callee.push_into(context)?;
        for arg in &self.args {
            arg.push_into(context)?;
        }

        debug!(context = %context.id(), nargs = self.args.len(), "call");
        if let Err(err) = state.pcall(self.args.len(), MULT_RET) {
            debug!(context = %context.id(), %err, "call raised an error");
            return Err(err);
        }

        let nresults = (state.top() - base) as usize;
        debug!(context = %context.id(), nresults, "call returned");
        let first = base + 1;

        let output = match (context.config().return_policy, nresults) {
            (ReturnPolicy::Vector, _) => CallOutput::Values(
                (0..nresults as i32)
                    .map(|i| ValueHandle::load(context, first + i))
                    .collect(),
            ),
            (_, 0) => CallOutput::Value(context.nil()),
            (_, 1) => CallOutput::Value(ValueHandle::load(context, first)),
            (ReturnPolicy::Single, n) => return Err(Error::TooManyReturns(n)),
            (ReturnPolicy::Table, n) => {
                state.create_table(n.saturating_sub(1), 1);
                for i in 0..n as i32 {
                    state.push_value(first + i);
                    state.raw_set_index(-2, i64::from(i));
                }
                CallOutput::Value(ValueHandle::anchored_top(context))
            }
        };
        Ok(output)
    }
}
