//! Host-side value handles for an embedded Lua runtime.
//!
//! A [`RuntimeContext`] owns one interpreter. Values are reached through
//! [`ValueHandle`]s, which keep garbage-collected values alive by anchoring
//! them in the interpreter's registry and release them when dropped. Table
//! slots are addressed through [`TableIndexProxy`], and functions are
//! called through [`CallInvoker`], whose result shape is fixed per context
//! by its [`ReturnPolicy`].
//!
//! ```
//! use lunabind::{ContextConfig, ReturnPolicy, RuntimeContext};
//!
//! let ctx = RuntimeContext::with_config(ContextConfig {
//!     return_policy: ReturnPolicy::Single,
//!     open_libs: true,
//! });
//! ctx.do_string("function area(w, h) return w * h end").unwrap();
//! let area = ctx.get_global("area").call([3, 4]).unwrap().into_value();
//! assert_eq!(area.to_integer(), 12);
//!
//! let t = ctx.create_table(0, 0);
//! t.table_set(1, "one").unwrap();
//! let len = ctx.get_global("rawlen").call([&t]).unwrap().into_value();
//! assert_eq!(len.to_integer(), 1);
//! ```

pub mod anchor;
pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod number;
pub mod state;
pub mod string_pool;
pub mod table;
pub mod value;

pub use anchor::Anchor;
pub use call::{CallInvoker, CallOutput};
pub use config::{ContextConfig, ReturnPolicy};
pub use context::{AnchorStats, ContextId, RuntimeContext};
pub use error::{Error, Result};
pub use state::{HostFunction, MULT_RET, NativeFn, State, Type};
pub use string_pool::{PoolStats, PooledString, StringPool};
pub use table::TableIndexProxy;
pub use value::{NIL, ValueHandle, ValueKind};

pub use mlua::ffi;
