//! Registry anchors
//!
//! An [`Anchor`] keeps one runtime value alive on behalf of the host by
//! holding an id in the context's registry. Cloning re-anchors the same
//! value under a fresh id; dropping releases the id exactly once.

use std::fmt;

#[cfg(feature = "debug_runtime")]
use tracing::trace;

use crate::context::RuntimeContext;

pub struct Anchor<'lua> {
    context: &'lua RuntimeContext,
    id: i32,
}

impl<'lua> Anchor<'lua> {
    /// Pops the top of the context's stack and anchors it.
    pub(crate) fn from_top(context: &'lua RuntimeContext) -> Self {
        let id = context.state().reference();
        context.record_anchor();
        #[cfg(feature = "debug_runtime")]
        trace!(context = %context.id(), id, "anchored");
        Anchor { context, id }
    }

    pub fn context(&self) -> &'lua RuntimeContext {
        self.context
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Pushes the anchored value onto the context's stack.
    pub(crate) fn push(&self) {
        self.context.state().push_ref(self.id);
    }
}

impl Clone for Anchor<'_> {
    fn clone(&self) -> Self {
        self.push();
        Anchor::from_top(self.context)
    }
}

impl Drop for Anchor<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "debug_runtime")]
        trace!(context = %self.context.id(), id = self.id, "released");
        self.context.state().unreference(self.id);
        self.context.record_release();
    }
}

impl fmt::Debug for Anchor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Anchor").field(&self.id).finish()
    }
}
