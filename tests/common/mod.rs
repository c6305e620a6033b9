//! Shared helpers for integration tests.

use std::ffi::c_int;

use lunabind::ffi;
use lunabind::{ContextConfig, ReturnPolicy, RuntimeContext};

/// Routes `tracing` output to the test harness. Safe to call repeatedly.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn context(policy: ReturnPolicy) -> RuntimeContext {
    init_tracing();
    RuntimeContext::with_config(ContextConfig {
        return_policy: policy,
        open_libs: true,
    })
}

/// Returns its arguments in order.
#[allow(dead_code)]
pub unsafe extern "C-unwind" fn echo(l: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_gettop(l) }
}
