//! Raw interpreter access
//!
//! [`State`] is a non-owning view of one Lua 5.4 interpreter stack. The
//! handle layer is built on it, and host closures receive one for the
//! frame they run in. Positive indices are 1-based from the bottom of the
//! current frame; negative indices count down from the top. Indices
//! outside the frame read as [`Type::None`].
//!
//! Nothing here anchors values. Primitives that may raise a runtime error
//! (indexing with metamethods, `nil` keys, running scripts) go through a
//! protected call, so a runtime error never unwinds through host frames.
//!
//! # Panics
//!
//! Pushing onto a stack that already holds the interpreter's maximum
//! number of slots panics, the same way a `Vec` panics on capacity
//! overflow.

use std::ffi::{CStr, CString, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::{fmt, ptr, slice};

use mlua::ffi;

use crate::error::{Error, Result};
use crate::number;

/// A native function: a plain C-ABI function with no upvalues.
pub type NativeFn = ffi::lua_CFunction;

/// A host closure callable from scripts. It returns the number of results
/// it left on top of its frame.
pub type HostFunction = Box<dyn Fn(&State) -> Result<usize>>;

/// Requests every result of a call.
pub const MULT_RET: i32 = ffi::LUA_MULTRET;

const HOST_FUNCTION_METATABLE: &CStr = c"lunabind.HostFunction";

/// The type of a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// An index outside the current frame.
    None,
    Nil,
    Boolean,
    LightUserData,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl Type {
    fn from_raw(t: c_int) -> Self {
        match t {
            ffi::LUA_TNIL => Type::Nil,
            ffi::LUA_TBOOLEAN => Type::Boolean,
            ffi::LUA_TLIGHTUSERDATA => Type::LightUserData,
            ffi::LUA_TNUMBER => Type::Number,
            ffi::LUA_TSTRING => Type::String,
            ffi::LUA_TTABLE => Type::Table,
            ffi::LUA_TFUNCTION => Type::Function,
            ffi::LUA_TUSERDATA => Type::UserData,
            ffi::LUA_TTHREAD => Type::Thread,
            _ => Type::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::None => "no value",
            Type::Nil => "nil",
            Type::Boolean => "boolean",
            Type::LightUserData | Type::UserData => "userdata",
            Type::Number => "number",
            Type::String => "string",
            Type::Table => "table",
            Type::Function => "function",
            Type::Thread => "thread",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct State {
    raw: *mut ffi::lua_State,
}

impl State {
    /// Wraps a raw interpreter pointer, typically the argument of a
    /// [`NativeFn`].
    ///
    /// # Safety
    ///
    /// `raw` must point to a live interpreter for as long as the view is
    /// used, and the view must only be used on the thread running it.
    pub unsafe fn from_raw(raw: *mut ffi::lua_State) -> Self {
        State { raw }
    }

    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw
    }

    // =========================================================================
    // Stack discipline
    // =========================================================================

    /// Number of values in the current frame.
    pub fn top(&self) -> i32 {
        unsafe { ffi::lua_gettop(self.raw) }
    }

    /// Sets the stack top. Negative values count from the current top;
    /// growing fills the new slots with `nil`.
    pub fn set_top(&self, idx: i32) {
        let top = self.top();
        let target = if idx < 0 { (top + idx + 1).max(0) } else { idx };
        if target > top {
            self.grow(target - top);
        }
        unsafe { ffi::lua_settop(self.raw, target) }
    }

    pub fn pop(&self, n: i32) {
        self.set_top((self.top() - n).max(0));
    }

    /// Makes room for `n` more values.
    pub fn ensure(&self, n: usize) -> Result<()> {
        let n = c_int::try_from(n).map_err(|_| Error::StackOverflow)?;
        if unsafe { ffi::lua_checkstack(self.raw, n) } == 0 {
            return Err(Error::StackOverflow);
        }
        Ok(())
    }

    fn grow(&self, n: i32) {
        if unsafe { ffi::lua_checkstack(self.raw, n) } == 0 {
            panic!("interpreter stack exhausted");
        }
    }

    fn is_acceptable(&self, idx: i32) -> bool {
        let top = self.top();
        match idx {
            0 => false,
            i if i > 0 => i <= top,
            i if i > ffi::LUA_REGISTRYINDEX => -i <= top,
            _ => false,
        }
    }

    fn abs_index(&self, idx: i32) -> i32 {
        unsafe { ffi::lua_absindex(self.raw, idx) }
    }

    // =========================================================================
    // Pushing
    // =========================================================================

    pub fn push_nil(&self) {
        self.grow(1);
        unsafe { ffi::lua_pushnil(self.raw) }
    }

    pub fn push_boolean(&self, b: bool) {
        self.grow(1);
        unsafe { ffi::lua_pushboolean(self.raw, c_int::from(b)) }
    }

    pub fn push_number(&self, n: f64) {
        self.grow(1);
        unsafe { ffi::lua_pushnumber(self.raw, n) }
    }

    pub fn push_integer(&self, i: i64) {
        self.grow(1);
        unsafe { ffi::lua_pushinteger(self.raw, i) }
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.grow(1);
        unsafe {
            ffi::lua_pushlstring(self.raw, bytes.as_ptr().cast(), bytes.len());
        }
    }

    pub fn push_str(&self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    pub fn push_native_function(&self, f: NativeFn) {
        self.grow(1);
        unsafe { ffi::lua_pushcfunction(self.raw, f) }
    }

    pub fn push_light_userdata(&self, p: *mut c_void) {
        self.grow(1);
        unsafe { ffi::lua_pushlightuserdata(self.raw, p) }
    }

    /// Pushes a copy of the value at `idx`, or `nil` when `idx` is outside
    /// the frame.
    pub fn push_value(&self, idx: i32) {
        if !self.is_acceptable(idx) {
            return self.push_nil();
        }
        self.grow(1);
        unsafe { ffi::lua_pushvalue(self.raw, idx) }
    }

    pub fn create_table(&self, narr: usize, nrec: usize) {
        self.grow(1);
        let narr = c_int::try_from(narr).unwrap_or(c_int::MAX);
        let nrec = c_int::try_from(nrec).unwrap_or(c_int::MAX);
        unsafe { ffi::lua_createtable(self.raw, narr, nrec) }
    }

    /// Pushes a zeroed userdata block of `size` bytes and returns its
    /// address. The block never moves.
    pub fn new_userdata(&self, size: usize) -> *mut c_void {
        self.grow(1);
        unsafe {
            let block = ffi::lua_newuserdatauv(self.raw, size, 0);
            ptr::write_bytes(block.cast::<u8>(), 0, size);
            block
        }
    }

    /// Pushes a new coroutine thread sharing this interpreter's globals.
    pub fn new_thread(&self) {
        self.grow(1);
        unsafe {
            ffi::lua_newthread(self.raw);
        }
    }

    /// Pushes a function that runs `f`. An `Err` returned by `f` is raised
    /// as a runtime error carrying its message; a panic becomes a runtime
    /// error too.
    pub fn push_function<F>(&self, f: F)
    where
        F: Fn(&State) -> Result<usize> + 'static,
    {
        self.grow(3);
        let boxed: HostFunction = Box::new(f);
        unsafe {
            let slot = ffi::lua_newuserdatauv(self.raw, size_of::<HostFunction>(), 0)
                .cast::<HostFunction>();
            ptr::write(slot, boxed);
            if ffi::luaL_newmetatable(self.raw, HOST_FUNCTION_METATABLE.as_ptr()) != 0 {
                ffi::lua_pushcfunction(self.raw, drop_host_function);
                ffi::lua_setfield(self.raw, -2, c"__gc".as_ptr());
                ffi::lua_pushboolean(self.raw, 0);
                ffi::lua_setfield(self.raw, -2, c"__metatable".as_ptr());
            }
            ffi::lua_setmetatable(self.raw, -2);
            ffi::lua_pushcclosure(self.raw, call_host_function, 1);
        }
    }

    // =========================================================================
    // Reading
    // =========================================================================

    pub fn type_of(&self, idx: i32) -> Type {
        if !self.is_acceptable(idx) {
            return Type::None;
        }
        Type::from_raw(unsafe { ffi::lua_type(self.raw, idx) })
    }

    /// Whether the value at `idx` is a number with the integer subtype.
    pub fn is_integer(&self, idx: i32) -> bool {
        self.is_acceptable(idx) && unsafe { ffi::lua_isinteger(self.raw, idx) } != 0
    }

    /// Truthiness: everything except `nil` and `false` is true.
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.is_acceptable(idx) && unsafe { ffi::lua_toboolean(self.raw, idx) } != 0
    }

    /// The value at `idx` as a float, converting numeric strings.
    pub fn to_number(&self, idx: i32) -> Option<f64> {
        if !self.is_acceptable(idx) {
            return None;
        }
        let mut isnum = 0;
        let n = unsafe { ffi::lua_tonumberx(self.raw, idx, &mut isnum) };
        (isnum != 0).then_some(n)
    }

    /// The value at `idx` as an integer, converting numeric strings and
    /// floats with an exact integer value.
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        if !self.is_acceptable(idx) {
            return None;
        }
        let mut isnum = 0;
        let i = unsafe { ffi::lua_tointegerx(self.raw, idx, &mut isnum) };
        (isnum != 0).then_some(i)
    }

    /// The contents of a string. Numbers are not converted.
    pub fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        if self.type_of(idx) != Type::String {
            return None;
        }
        let mut len = 0;
        unsafe {
            let data = ffi::lua_tolstring(self.raw, idx, &mut len);
            (!data.is_null()).then(|| slice::from_raw_parts(data.cast::<u8>(), len).to_vec())
        }
    }

    /// The block address of a full userdata or the pointer of a light one.
    pub fn to_userdata(&self, idx: i32) -> Option<*mut c_void> {
        if !matches!(self.type_of(idx), Type::UserData | Type::LightUserData) {
            return None;
        }
        Some(unsafe { ffi::lua_touserdata(self.raw, idx) })
    }

    /// The function pointer of a native function. Closures, including
    /// host closures, are not native functions.
    pub fn to_native_function(&self, idx: i32) -> Option<NativeFn> {
        if self.type_of(idx) != Type::Function
            || unsafe { ffi::lua_iscfunction(self.raw, idx) } == 0
        {
            return None;
        }
        let idx = self.abs_index(idx);
        self.grow(1);
        if !unsafe { ffi::lua_getupvalue(self.raw, idx, 1) }.is_null() {
            self.pop(1);
            return None;
        }
        unsafe { ffi::lua_tocfunction(self.raw, idx) }
    }

    /// Byte length of strings, border of tables, block size of userdata.
    pub fn raw_len(&self, idx: i32) -> usize {
        if !self.is_acceptable(idx) {
            return 0;
        }
        unsafe { ffi::lua_rawlen(self.raw, idx) as usize }
    }

    /// Primitive equality, without metamethods.
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        self.is_acceptable(a)
            && self.is_acceptable(b)
            && unsafe { ffi::lua_rawequal(self.raw, a, b) } != 0
    }

    /// Renders the value at `idx` without running metamethods.
    pub fn display_value(&self, idx: i32) -> String {
        match self.type_of(idx) {
            Type::None | Type::Nil => "nil".to_string(),
            Type::Boolean => self.to_boolean(idx).to_string(),
            Type::Number if self.is_integer(idx) => {
                self.to_integer(idx).unwrap_or_default().to_string()
            }
            Type::Number => number::format_number(self.to_number(idx).unwrap_or_default()),
            Type::String => {
                String::from_utf8_lossy(&self.to_bytes(idx).unwrap_or_default()).into_owned()
            }
            other => {
                let address = unsafe { ffi::lua_topointer(self.raw, idx) };
                format!("{other}: {address:p}")
            }
        }
    }

    // =========================================================================
    // Tables and globals
    // =========================================================================

    /// Pops a key and replaces the table below it with `table[key]`.
    /// Metamethods run inside a protected call.
    pub fn get_table(&self) -> Result<()> {
        self.push_native_function(protected_gettable);
        unsafe { ffi::lua_rotate(self.raw, -3, 1) };
        self.pcall(2, 1)
    }

    /// Pops a table, a key and a value and performs `table[key] = value`.
    /// Metamethods run inside a protected call.
    pub fn set_table(&self) -> Result<()> {
        self.push_native_function(protected_settable);
        unsafe { ffi::lua_rotate(self.raw, -4, 1) };
        self.pcall(3, 0)
    }

    /// Pops a value and stores it as `t[n]` for the table `t` at `idx`,
    /// bypassing metamethods.
    pub fn raw_set_index(&self, idx: i32, n: i64) {
        unsafe { ffi::lua_rawseti(self.raw, idx, n) }
    }

    fn push_globals(&self) {
        self.grow(1);
        unsafe {
            ffi::lua_rawgeti(
                self.raw,
                ffi::LUA_REGISTRYINDEX,
                ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer,
            );
        }
    }

    /// Pushes the global `name`.
    pub fn get_global(&self, name: &str) {
        self.push_globals();
        self.push_str(name);
        unsafe {
            ffi::lua_rawget(self.raw, -2);
            ffi::lua_rotate(self.raw, -2, 1);
        }
        self.pop(1);
    }

    /// Pops a value and stores it as the global `name`.
    pub fn set_global(&self, name: &str) {
        self.push_globals();
        self.push_str(name);
        self.push_value(-3);
        unsafe { ffi::lua_rawset(self.raw, -3) };
        self.pop(2);
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Pops the top of the stack and anchors it under a fresh registry id.
    pub fn reference(&self) -> i32 {
        unsafe { ffi::luaL_ref(self.raw, ffi::LUA_REGISTRYINDEX) }
    }

    /// Releases a registry id. The id may be handed out again afterwards.
    pub fn unreference(&self, id: i32) {
        unsafe { ffi::luaL_unref(self.raw, ffi::LUA_REGISTRYINDEX, id) }
    }

    /// Pushes the value anchored under `id`.
    pub fn push_ref(&self, id: i32) {
        self.grow(1);
        unsafe {
            ffi::lua_rawgeti(self.raw, ffi::LUA_REGISTRYINDEX, ffi::lua_Integer::from(id));
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Calls the function below the top `nargs` values.
    ///
    /// On success the function and its arguments are replaced by its
    /// results, `nresults` of them or all of them with [`MULT_RET`]. On
    /// failure they are removed and the error message is returned as
    /// [`Error::Script`].
    pub fn pcall(&self, nargs: usize, nresults: i32) -> Result<()> {
        let nargs = c_int::try_from(nargs).map_err(|_| Error::StackOverflow)?;
        let status = unsafe { ffi::lua_pcall(self.raw, nargs, nresults, 0) };
        if status != ffi::LUA_OK {
            return Err(self.pop_error());
        }
        Ok(())
    }

    /// Compiles `source` as a text chunk and runs it, discarding its
    /// results.
    pub fn do_string(&self, source: &str) -> Result<()> {
        let chunk_name = CString::new(source).unwrap_or_default();
        self.grow(1);
        let status = unsafe {
            ffi::luaL_loadbufferx(
                self.raw,
                source.as_ptr().cast(),
                source.len(),
                chunk_name.as_ptr(),
                c"t".as_ptr(),
            )
        };
        if status != ffi::LUA_OK {
            return Err(self.pop_error());
        }
        self.pcall(0, 0)
    }

    fn pop_error(&self) -> Error {
        let message = match self.type_of(-1) {
            Type::String | Type::Number => self.display_value(-1),
            other => format!("(error object is a {other} value)"),
        };
        self.pop(1);
        Error::Script(message)
    }

    /// Loads the standard libraries into the globals table.
    pub fn open_libs(&self) {
        unsafe { ffi::luaL_openlibs(self.raw) }
    }

    // =========================================================================
    // Collector
    // =========================================================================

    /// Bytes currently allocated by the interpreter.
    pub fn memory_in_use(&self) -> usize {
        let (kilobytes, bytes) = unsafe {
            (
                ffi::lua_gc(self.raw, ffi::LUA_GCCOUNT),
                ffi::lua_gc(self.raw, ffi::LUA_GCCOUNTB),
            )
        };
        kilobytes.max(0) as usize * 1024 + bytes.max(0) as usize
    }

    /// Runs a full collection cycle and returns the number of bytes freed.
    pub fn collect_garbage(&self) -> usize {
        let before = self.memory_in_use();
        unsafe {
            ffi::lua_gc(self.raw, ffi::LUA_GCCOLLECT);
        }
        before.saturating_sub(self.memory_in_use())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("raw", &self.raw)
            .field("top", &self.top())
            .finish()
    }
}

unsafe extern "C-unwind" fn protected_gettable(l: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_gettable(l, 1) };
    1
}

unsafe extern "C-unwind" fn protected_settable(l: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_settable(l, 1) };
    0
}

/// Entry point of every host closure. Raising the error here unwinds no
/// frame that owns a destructor.
unsafe extern "C-unwind" fn call_host_function(l: *mut ffi::lua_State) -> c_int {
    match unsafe { run_host_function(l) } {
        Some(nresults) => nresults,
        None => unsafe { ffi::lua_error(l) },
    }
}

/// Runs the closure stored in the first upvalue. On failure the message is
/// left on top of the stack.
unsafe fn run_host_function(l: *mut ffi::lua_State) -> Option<c_int> {
    let state = unsafe { State::from_raw(l) };
    let slot = unsafe { ffi::lua_touserdata(l, ffi::lua_upvalueindex(1)) }.cast::<HostFunction>();
    if slot.is_null() {
        state.push_str("host function is missing");
        return None;
    }
    let f = unsafe { &*slot };
    let message = match panic::catch_unwind(AssertUnwindSafe(|| f(&state))) {
        Ok(Ok(nresults)) => {
            let available = state.top().max(0) as usize;
            return Some(nresults.min(available) as c_int);
        }
        Ok(Err(Error::Script(message))) => message,
        Ok(Err(err)) => err.to_string(),
        Err(_) => "host function panicked".to_string(),
    };
    state.push_str(&message);
    None
}

/// `__gc` of host closure boxes. The slot is left holding a stub so a
/// second finalization cannot free the closure twice.
unsafe extern "C-unwind" fn drop_host_function(l: *mut ffi::lua_State) -> c_int {
    let slot = unsafe { ffi::lua_touserdata(l, 1) }.cast::<HostFunction>();
    if !slot.is_null() {
        let stub: HostFunction =
            Box::new(|_: &State| Err(Error::InvalidHandle("host function was collected")));
        let closure = unsafe { ptr::replace(slot, stub) };
        let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(closure)));
    }
    0
}
