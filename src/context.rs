//! Runtime contexts
//!
//! A [`RuntimeContext`] owns exactly one interpreter. Every handle and
//! proxy anchored in it borrows the context, so none of them can outlive
//! it. Contexts are move-only.

use std::alloc::{Layout, handle_alloc_error};
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;
use mlua::ffi;
use tracing::{debug, warn};

use crate::anchor::Anchor;
use crate::config::ContextConfig;
use crate::error::Result;
use crate::state::{NativeFn, State};
use crate::value::ValueHandle;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a context.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("ctx#{_0}")]
pub struct ContextId(u64);

/// Registry anchor counters of one context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnchorStats {
    pub created: u64,
    pub released: u64,
    pub live: usize,
}

pub struct RuntimeContext {
    state: State,
    config: ContextConfig,
    id: ContextId,
    anchors: Cell<AnchorStats>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    /// Creates a context with its own interpreter.
    ///
    /// Aborts through [`handle_alloc_error`] when the interpreter cannot be
    /// allocated.
    pub fn with_config(config: ContextConfig) -> Self {
        let raw = unsafe { ffi::luaL_newstate() };
        if raw.is_null() {
            handle_alloc_error(Layout::new::<usize>());
        }
        let context = RuntimeContext {
            state: unsafe { State::from_raw(raw) },
            config,
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            anchors: Cell::new(AnchorStats::default()),
        };
        if config.open_libs {
            context.state.open_libs();
        }
        debug!(context = %context.id, policy = ?config.return_policy, "context created");
        context
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Raw access to the underlying interpreter.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Loads the standard libraries. Calling it again reloads them.
    pub fn open_libs(&self) {
        self.state.open_libs();
    }

    /// Compiles and runs `source`. Results are discarded; a compile or
    /// runtime error is returned as [`Error::Script`](crate::Error::Script).
    pub fn do_string(&self, source: &str) -> Result<()> {
        let _guard = StackGuard::new(&self.state);
        let result = self.state.do_string(source);
        if let Err(err) = &result {
            debug!(context = %self.id, %err, "chunk failed");
        }
        result
    }

    pub fn get_global(&self, name: &str) -> ValueHandle<'_> {
        let _guard = StackGuard::new(&self.state);
        self.state.get_global(name);
        ValueHandle::load(self, -1)
    }

    pub fn set_global(&self, name: &str, value: &ValueHandle<'_>) -> Result<()> {
        value.check_context(self)?;
        let _guard = StackGuard::new(&self.state);
        value.push_into(self)?;
        self.state.set_global(name);
        Ok(())
    }

    /// Number of values on the stack of the current frame.
    pub fn stack_depth(&self) -> i32 {
        self.state.top()
    }

    /// Runs a full collection and returns the number of bytes freed.
    pub fn collect_garbage(&self) -> usize {
        let freed = self.state.collect_garbage();
        debug!(context = %self.id, freed, "garbage collected");
        freed
    }

    /// Bytes currently allocated by the interpreter.
    pub fn memory_in_use(&self) -> usize {
        self.state.memory_in_use()
    }

    /// Number of registry entries currently held by handles and proxies.
    pub fn live_anchors(&self) -> usize {
        self.anchors.get().live
    }

    pub fn anchor_stats(&self) -> AnchorStats {
        self.anchors.get()
    }

    pub(crate) fn record_anchor(&self) {
        let mut stats = self.anchors.get();
        stats.created += 1;
        stats.live += 1;
        self.anchors.set(stats);
    }

    pub(crate) fn record_release(&self) {
        let mut stats = self.anchors.get();
        stats.released += 1;
        stats.live = stats.live.saturating_sub(1);
        self.anchors.set(stats);
    }

    // Handle constructors bound to this context.

    pub fn nil(&self) -> ValueHandle<'_> {
        ValueHandle::nil().bound(self)
    }

    pub fn boolean(&self, b: bool) -> ValueHandle<'_> {
        ValueHandle::from(b).bound(self)
    }

    /// The handle is classified as an integer when `n` has an exact
    /// integer value.
    pub fn number(&self, n: f64) -> ValueHandle<'_> {
        ValueHandle::from(n).bound(self)
    }

    pub fn integer(&self, i: i64) -> ValueHandle<'_> {
        ValueHandle::from(i).bound(self)
    }

    pub fn native_function(&self, f: NativeFn) -> ValueHandle<'_> {
        ValueHandle::from(f).bound(self)
    }

    pub fn light_userdata(&self, p: *mut c_void) -> ValueHandle<'_> {
        ValueHandle::light_userdata(p).bound(self)
    }

    pub fn string(&self, s: &str) -> ValueHandle<'_> {
        self.create_string(s.as_bytes())
    }

    pub fn create_string(&self, bytes: &[u8]) -> ValueHandle<'_> {
        self.state.push_bytes(bytes);
        ValueHandle::anchored_top(self)
    }

    pub fn create_table(&self, narr: usize, nrec: usize) -> ValueHandle<'_> {
        self.state.create_table(narr, nrec);
        ValueHandle::anchored_top(self)
    }

    pub fn create_function<F>(&self, f: F) -> ValueHandle<'_>
    where
        F: Fn(&State) -> Result<usize> + 'static,
    {
        self.state.push_function(f);
        ValueHandle::anchored_top(self)
    }

    /// Allocates a zeroed userdata block of `size` bytes.
    pub fn create_userdata(&self, size: usize) -> ValueHandle<'_> {
        self.state.new_userdata(size);
        ValueHandle::anchored_top(self)
    }

    pub fn create_thread(&self) -> ValueHandle<'_> {
        self.state.new_thread();
        ValueHandle::anchored_top(self)
    }

    /// Anchors the top of the stack, popping it.
    pub(crate) fn anchor_top(&self) -> Anchor<'_> {
        Anchor::from_top(self)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        let stats = self.anchors.get();
        if stats.live != 0 {
            warn!(context = %self.id, live = stats.live, "context closed with live anchors");
        }
        debug!(context = %self.id, created = stats.created, "context closed");
        unsafe { ffi::lua_close(self.state.as_ptr()) }
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Restores the stack top of the current frame when dropped.
pub(crate) struct StackGuard<'a> {
    state: &'a State,
    top: i32,
}

impl<'a> StackGuard<'a> {
    pub(crate) fn new(state: &'a State) -> Self {
        StackGuard {
            state,
            top: state.top(),
        }
    }

    /// The depth the stack is restored to.
    pub(crate) fn top(&self) -> i32 {
        self.top
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.state.set_top(self.top);
    }
}
