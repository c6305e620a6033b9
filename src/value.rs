//! Value handles
//!
//! A [`ValueHandle`] is a host-side reference to one scripting value. It
//! is a tagged union over every value kind:
//!
//! - immediate kinds (`nil`, booleans, numbers, native functions, light
//!   userdata) are stored inline,
//! - stateless strings share a refcounted [`PooledString`] buffer,
//! - reference kinds (context-bound strings, functions, userdata, threads
//!   and tables) hold an [`Anchor`] in the owning context's registry.
//!
//! A handle built from a literal has no context until it is attached or
//! pushed into one. Reference kinds always carry their context, so a
//! handle can never refer to a registry id without knowing which registry
//! it belongs to.

use std::ffi::c_void;
use std::fmt;

use tracing::trace;

use crate::anchor::Anchor;
use crate::call::{CallInvoker, CallOutput};
use crate::context::{RuntimeContext, StackGuard};
use crate::error::{Error, Result};
use crate::number::{self, Numeric};
use crate::state::{NativeFn, State, Type};
use crate::string_pool::PooledString;
use crate::table::TableIndexProxy;

/// A context-free `nil`.
pub const NIL: ValueHandle<'static> = ValueHandle {
    context: None,
    payload: Payload::Nil,
};

/// The active kind of a [`ValueHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Boolean,
    Number,
    Integer,
    String,
    StatelessString,
    Function,
    NativeFunction,
    UserData,
    LightUserData,
    Thread,
    Table,
}

impl ValueKind {
    /// Whether values of this kind live in a context's registry.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            ValueKind::String
                | ValueKind::Function
                | ValueKind::UserData
                | ValueKind::Thread
                | ValueKind::Table
        )
    }

    /// The name the scripting language's `type()` reports.
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Boolean => "boolean",
            ValueKind::Number | ValueKind::Integer => "number",
            ValueKind::String | ValueKind::StatelessString => "string",
            ValueKind::Function | ValueKind::NativeFunction => "function",
            ValueKind::UserData | ValueKind::LightUserData => "userdata",
            ValueKind::Thread => "thread",
            ValueKind::Table => "table",
        }
    }
}

#[derive(Clone)]
enum Payload<'lua> {
    Nil,
    Boolean(bool),
    Number(f64),
    Integer(i64),
    String(Anchor<'lua>),
    StatelessString(PooledString),
    Function(Anchor<'lua>),
    NativeFunction(NativeFn),
    UserData(Anchor<'lua>),
    LightUserData(*mut c_void),
    Thread(Anchor<'lua>),
    Table(Anchor<'lua>),
}

impl fmt::Debug for Payload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Nil => f.write_str("Nil"),
            Payload::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            Payload::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Payload::Integer(i) => f.debug_tuple("Integer").field(i).finish(),
            Payload::String(a) => f.debug_tuple("String").field(a).finish(),
            Payload::StatelessString(s) => f.debug_tuple("StatelessString").field(s).finish(),
            Payload::Function(a) => f.debug_tuple("Function").field(a).finish(),
            Payload::NativeFunction(func) => write!(f, "NativeFunction({:#x})", *func as usize),
            Payload::UserData(a) => f.debug_tuple("UserData").field(a).finish(),
            Payload::LightUserData(p) => write!(f, "LightUserData({p:p})"),
            Payload::Thread(a) => f.debug_tuple("Thread").field(a).finish(),
            Payload::Table(a) => f.debug_tuple("Table").field(a).finish(),
        }
    }
}

impl From<Numeric> for Payload<'_> {
    fn from(n: Numeric) -> Self {
        match n {
            Numeric::Integer(i) => Payload::Integer(i),
            Numeric::Number(n) => Payload::Number(n),
        }
    }
}

/// A handle to one scripting value.
///
/// Cloning a reference-kind handle re-anchors the value under a new
/// registry id; both clones refer to the same underlying value. Cloning a
/// stateless string shares its buffer.
#[derive(Clone)]
pub struct ValueHandle<'lua> {
    context: Option<&'lua RuntimeContext>,
    payload: Payload<'lua>,
}

impl<'lua> ValueHandle<'lua> {
    pub const fn nil() -> Self {
        ValueHandle {
            context: None,
            payload: Payload::Nil,
        }
    }

    /// A stateless string. Its buffer is shared by every clone.
    pub fn stateless_string(bytes: &[u8]) -> Self {
        PooledString::new(bytes).into()
    }

    pub fn native_function(f: NativeFn) -> Self {
        f.into()
    }

    pub fn light_userdata(p: *mut c_void) -> Self {
        ValueHandle {
            context: None,
            payload: Payload::LightUserData(p),
        }
    }

    fn anchored(context: &'lua RuntimeContext, make: fn(Anchor<'lua>) -> Payload<'lua>) -> Self {
        ValueHandle {
            context: Some(context),
            payload: make(context.anchor_top()),
        }
    }

    /// Anchors the value on top of the context's stack, popping it.
    pub(crate) fn anchored_top(context: &'lua RuntimeContext) -> Self {
        let handle = Self::load(context, -1);
        context.state().pop(1);
        handle
    }

    /// Loads the value at stack index `idx` into a new handle. Reference
    /// kinds are anchored; the stack is left unchanged.
    pub(crate) fn load(context: &'lua RuntimeContext, idx: i32) -> Self {
        let state = context.state();
        let make: fn(Anchor<'lua>) -> Payload<'lua> = match state.type_of(idx) {
            Type::None | Type::Nil => return Self::nil().bound(context),
            Type::Boolean => return Self::from(state.to_boolean(idx)).bound(context),
            Type::Number if state.is_integer(idx) => {
                return Self::from(state.to_integer(idx).unwrap_or_default()).bound(context);
            }
            Type::Number => {
                return Self::from(state.to_number(idx).unwrap_or_default()).bound(context);
            }
            Type::LightUserData => {
                let p = state.to_userdata(idx).unwrap_or(std::ptr::null_mut());
                return Self::light_userdata(p).bound(context);
            }
            Type::Function => match state.to_native_function(idx) {
                Some(f) => return Self::from(f).bound(context),
                None => Payload::Function,
            },
            Type::String => Payload::String,
            Type::UserData => Payload::UserData,
            Type::Thread => Payload::Thread,
            Type::Table => Payload::Table,
        };
        state.push_value(idx);
        Self::anchored(context, make)
    }

    /// Records `context` on a context-free immediate.
    pub(crate) fn bound(mut self, context: &'lua RuntimeContext) -> Self {
        if self.context.is_none() && !self.kind().is_reference() {
            self.context = Some(context);
        }
        self
    }

    /// Binds a context-free handle to `context`. A stateless string becomes
    /// a string owned by the context.
    pub fn attach(self, context: &'lua RuntimeContext) -> Result<Self> {
        self.check_context(context)?;
        match &self.payload {
            Payload::StatelessString(s) => {
                context.state().push_bytes(s.as_bytes());
                Ok(Self::anchored(context, Payload::String))
            }
            _ => Ok(self.bound(context)),
        }
    }

    /// The owning context, if the handle has one.
    pub fn context(&self) -> Option<&'lua RuntimeContext> {
        self.context
    }

    /// Fails when this handle is owned by a context other than `context`.
    /// Context-free handles are compatible with every context.
    pub(crate) fn check_context(&self, context: &RuntimeContext) -> Result<()> {
        match self.context {
            Some(own) if own.id() != context.id() => Err(Error::CrossContext),
            _ => Ok(()),
        }
    }

    /// Pushes the value onto `context`'s stack.
    pub(crate) fn push_into(&self, context: &RuntimeContext) -> Result<()> {
        self.check_context(context)?;
        let state = context.state();
        match &self.payload {
            Payload::Nil => state.push_nil(),
            Payload::Boolean(b) => state.push_boolean(*b),
            Payload::Number(n) => state.push_number(*n),
            Payload::Integer(i) => state.push_integer(*i),
            Payload::StatelessString(s) => state.push_bytes(s.as_bytes()),
            Payload::NativeFunction(f) => state.push_native_function(*f),
            Payload::LightUserData(p) => state.push_light_userdata(*p),
            Payload::String(anchor)
            | Payload::Function(anchor)
            | Payload::UserData(anchor)
            | Payload::Thread(anchor)
            | Payload::Table(anchor) => anchor.push(),
        }
        Ok(())
    }

    fn anchor(&self) -> Option<&Anchor<'lua>> {
        match &self.payload {
            Payload::String(anchor)
            | Payload::Function(anchor)
            | Payload::UserData(anchor)
            | Payload::Thread(anchor)
            | Payload::Table(anchor) => Some(anchor),
            _ => None,
        }
    }

    /// Runs `f` with the anchored value pushed on top of the stack.
    fn with_pushed<T>(&self, default: T, f: impl FnOnce(&State) -> T) -> T {
        match self.anchor() {
            Some(anchor) => {
                let state = anchor.context().state();
                let _guard = StackGuard::new(state);
                anchor.push();
                f(state)
            }
            None => default,
        }
    }

    // =========================================================================
    // Kind queries
    // =========================================================================

    pub fn kind(&self) -> ValueKind {
        match &self.payload {
            Payload::Nil => ValueKind::Nil,
            Payload::Boolean(_) => ValueKind::Boolean,
            Payload::Number(_) => ValueKind::Number,
            Payload::Integer(_) => ValueKind::Integer,
            Payload::String(_) => ValueKind::String,
            Payload::StatelessString(_) => ValueKind::StatelessString,
            Payload::Function(_) => ValueKind::Function,
            Payload::NativeFunction(_) => ValueKind::NativeFunction,
            Payload::UserData(_) => ValueKind::UserData,
            Payload::LightUserData(_) => ValueKind::LightUserData,
            Payload::Thread(_) => ValueKind::Thread,
            Payload::Table(_) => ValueKind::Table,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    pub fn is_nil(&self) -> bool {
        self.kind() == ValueKind::Nil
    }

    pub fn is_boolean(&self) -> bool {
        self.kind() == ValueKind::Boolean
    }

    /// True for both numbers and integers.
    pub fn is_number(&self) -> bool {
        matches!(self.kind(), ValueKind::Number | ValueKind::Integer)
    }

    pub fn is_integer(&self) -> bool {
        self.kind() == ValueKind::Integer
    }

    /// True for both context-bound and stateless strings.
    pub fn is_string(&self) -> bool {
        matches!(self.kind(), ValueKind::String | ValueKind::StatelessString)
    }

    /// True for both runtime functions and native functions.
    pub fn is_function(&self) -> bool {
        matches!(self.kind(), ValueKind::Function | ValueKind::NativeFunction)
    }

    pub fn is_native_function(&self) -> bool {
        self.kind() == ValueKind::NativeFunction
    }

    /// True for both full and light userdata.
    pub fn is_userdata(&self) -> bool {
        matches!(self.kind(), ValueKind::UserData | ValueKind::LightUserData)
    }

    pub fn is_light_userdata(&self) -> bool {
        self.kind() == ValueKind::LightUserData
    }

    pub fn is_thread(&self) -> bool {
        self.kind() == ValueKind::Thread
    }

    pub fn is_table(&self) -> bool {
        self.kind() == ValueKind::Table
    }

    // =========================================================================
    // Accessors
    //
    // Every accessor is total: the wrong kind yields false, zero, empty or
    // null.
    // =========================================================================

    /// The boolean payload; `false` for every other kind.
    pub fn to_boolean(&self) -> bool {
        matches!(self.payload, Payload::Boolean(true))
    }

    /// Integers widen to floats; `0.0` for non-numbers.
    pub fn to_number(&self) -> f64 {
        match self.payload {
            Payload::Number(n) => n,
            Payload::Integer(i) => i as f64,
            _ => 0.0,
        }
    }

    /// Numbers round half to even; `0` for non-numbers.
    pub fn to_integer(&self) -> i64 {
        match self.payload {
            Payload::Integer(i) => i,
            Payload::Number(n) => number::to_integer(n),
            _ => 0,
        }
    }

    /// String contents; empty for non-strings.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.payload {
            Payload::StatelessString(s) => s.as_bytes().to_vec(),
            Payload::String(_) => self.with_pushed(Vec::new(), |state| {
                state.to_bytes(-1).unwrap_or_default()
            }),
            _ => Vec::new(),
        }
    }

    /// String contents with invalid UTF-8 replaced; empty for non-strings.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    pub fn to_native_function(&self) -> Option<NativeFn> {
        match self.payload {
            Payload::NativeFunction(f) => Some(f),
            _ => None,
        }
    }

    /// The block address of a userdata or the pointer of a light
    /// userdata; null otherwise.
    pub fn to_userdata(&self) -> *mut c_void {
        match &self.payload {
            Payload::LightUserData(p) => *p,
            Payload::UserData(_) => self.with_pushed(std::ptr::null_mut(), |state| {
                state.to_userdata(-1).unwrap_or(std::ptr::null_mut())
            }),
            _ => std::ptr::null_mut(),
        }
    }

    /// Byte length of strings, border of tables, block size of userdata;
    /// `0` otherwise.
    pub fn length(&self) -> usize {
        match &self.payload {
            Payload::StatelessString(s) => s.len(),
            Payload::String(_) | Payload::Table(_) | Payload::UserData(_) => {
                self.with_pushed(0, |state| state.raw_len(-1))
            }
            _ => 0,
        }
    }

    /// Primitive equality: numbers by value, strings by contents,
    /// reference kinds by identity.
    pub fn raw_equal(&self, other: &ValueHandle<'_>) -> Result<bool> {
        let Some(context) = self.context.or(other.context) else {
            return Ok(self.raw_equal_immediate(other));
        };
        self.check_context(context)?;
        other.check_context(context)?;
        let state = context.state();
        let _guard = StackGuard::new(state);
        self.push_into(context)?;
        other.push_into(context)?;
        Ok(state.raw_equal(-2, -1))
    }

    fn raw_equal_immediate(&self, other: &ValueHandle<'_>) -> bool {
        match (&self.payload, &other.payload) {
            (Payload::Nil, Payload::Nil) => true,
            (Payload::Boolean(a), Payload::Boolean(b)) => a == b,
            (Payload::StatelessString(a), Payload::StatelessString(b)) => a == b,
            (Payload::NativeFunction(a), Payload::NativeFunction(b)) => {
                *a as usize == *b as usize
            }
            (Payload::LightUserData(a), Payload::LightUserData(b)) => a == b,
            _ if self.is_number() && other.is_number() => match (&self.payload, &other.payload) {
                (Payload::Integer(a), Payload::Integer(b)) => a == b,
                _ => self.to_number() == other.to_number(),
            },
            _ => false,
        }
    }

    // =========================================================================
    // Mutators
    //
    // The previous payload is released before the new one is installed.
    // =========================================================================

    fn release(&mut self) {
        self.payload = Payload::Nil;
    }

    pub fn set_as_nil(&mut self) {
        self.release();
    }

    pub fn set_as_boolean(&mut self, b: bool) {
        self.release();
        self.payload = Payload::Boolean(b);
    }

    /// Classifies `n` as an integer when it has an exact integer value.
    pub fn set_as_number(&mut self, n: f64) {
        self.release();
        self.payload = number::classify(n).into();
    }

    pub fn set_as_integer(&mut self, i: i64) {
        self.release();
        self.payload = Payload::Integer(i);
    }

    /// Bound handles get a string owned by their context; context-free
    /// handles get a stateless string.
    pub fn set_as_string(&mut self, s: &str) {
        self.release();
        self.payload = match self.context {
            Some(context) => {
                context.state().push_str(s);
                Payload::String(context.anchor_top())
            }
            None => Payload::StatelessString(PooledString::new(s.as_bytes())),
        };
    }

    pub fn set_as_native_function(&mut self, f: NativeFn) {
        self.release();
        self.payload = Payload::NativeFunction(f);
    }

    pub fn set_as_light_userdata(&mut self, p: *mut c_void) {
        self.release();
        self.payload = Payload::LightUserData(p);
    }

    /// Replaces the value with a new function object. Requires a context.
    pub fn set_as_function<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&State) -> Result<usize> + 'static,
    {
        let context = self
            .context
            .ok_or(Error::InvalidHandle("function requires a context"))?;
        self.release();
        context.state().push_function(f);
        self.payload = Payload::Function(context.anchor_top());
        Ok(())
    }

    // =========================================================================
    // Tables
    // =========================================================================

    pub(crate) fn table_anchor(&self) -> Result<&Anchor<'lua>> {
        match &self.payload {
            Payload::Table(anchor) => Ok(anchor),
            _ => Err(Error::TypeError("not a table")),
        }
    }

    /// Reads `self[key]`. An `__index` metamethod runs inside a protected
    /// call.
    pub fn table_get<K>(&self, key: K) -> Result<ValueHandle<'lua>>
    where
        K: Into<ValueHandle<'lua>>,
    {
        let table = self.table_anchor()?;
        let key: ValueHandle<'lua> = key.into();
        index_get(table, &key)
    }

    /// Writes `self[key] = value`. A `nil` or NaN key fails with
    /// [`Error::Script`].
    pub fn table_set<K, V>(&self, key: K, value: V) -> Result<()>
    where
        K: Into<ValueHandle<'lua>>,
        V: Into<ValueHandle<'lua>>,
    {
        let table = self.table_anchor()?;
        let key: ValueHandle<'lua> = key.into();
        let value: ValueHandle<'lua> = value.into();
        index_set(table, &key, &value)
    }

    /// A deferred reference to the slot `self[key]`.
    pub fn index<K>(&self, key: K) -> Result<TableIndexProxy<'_, 'lua>>
    where
        K: Into<ValueHandle<'lua>>,
    {
        let table = self.table_anchor()?;
        TableIndexProxy::new(table, &key.into())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Calls this function with `args`, aggregating the results according
    /// to the owning context's return policy.
    pub fn call<I>(&self, args: I) -> Result<CallOutput<'lua>>
    where
        I: IntoIterator,
        I::Item: Into<ValueHandle<'lua>>,
    {
        CallInvoker::new(self).args(args).invoke()
    }
}

/// A key or value that can be pushed into a context.
pub(crate) trait Pushable {
    fn check_context(&self, context: &RuntimeContext) -> Result<()>;
    fn push_into(&self, context: &RuntimeContext) -> Result<()>;
}

impl Pushable for ValueHandle<'_> {
    fn check_context(&self, context: &RuntimeContext) -> Result<()> {
        ValueHandle::check_context(self, context)
    }

    fn push_into(&self, context: &RuntimeContext) -> Result<()> {
        ValueHandle::push_into(self, context)
    }
}

impl Pushable for Anchor<'_> {
    fn check_context(&self, context: &RuntimeContext) -> Result<()> {
        if self.context().id() != context.id() {
            return Err(Error::CrossContext);
        }
        Ok(())
    }

    fn push_into(&self, context: &RuntimeContext) -> Result<()> {
        Pushable::check_context(self, context)?;
        self.push();
        Ok(())
    }
}

/// Loads `table[key]` for an anchored table.
pub(crate) fn index_get<'lua, K>(table: &Anchor<'lua>, key: &K) -> Result<ValueHandle<'lua>>
where
    K: Pushable + ?Sized,
{
    let context = table.context();
    key.check_context(context)?;

    let state = context.state();
    let _guard = StackGuard::new(state);
    state.ensure(3)?;
    table.push();
    key.push_into(context)?;
    state.get_table()?;
    Ok(ValueHandle::load(context, -1))
}

/// Performs `table[key] = value` for an anchored table.
pub(crate) fn index_set<K, V>(table: &Anchor<'_>, key: &K, value: &V) -> Result<()>
where
    K: Pushable + ?Sized,
    V: Pushable + ?Sized,
{
    let context = table.context();
    key.check_context(context)?;
    value.check_context(context)?;

    let state = context.state();
    let _guard = StackGuard::new(state);
    state.ensure(4)?;
    table.push();
    key.push_into(context)?;
    value.push_into(context)?;
    state.set_table()?;
    trace!(context = %context.id(), table = table.id(), "table slot written");
    Ok(())
}

impl Default for ValueHandle<'_> {
    fn default() -> Self {
        Self::nil()
    }
}

impl From<bool> for ValueHandle<'_> {
    fn from(b: bool) -> Self {
        ValueHandle {
            context: None,
            payload: Payload::Boolean(b),
        }
    }
}

impl From<i32> for ValueHandle<'_> {
    fn from(i: i32) -> Self {
        i64::from(i).into()
    }
}

impl From<i64> for ValueHandle<'_> {
    fn from(i: i64) -> Self {
        ValueHandle {
            context: None,
            payload: Payload::Integer(i),
        }
    }
}

/// Floats with an exact integer value become integers.
impl From<f64> for ValueHandle<'_> {
    fn from(n: f64) -> Self {
        ValueHandle {
            context: None,
            payload: number::classify(n).into(),
        }
    }
}

impl From<&str> for ValueHandle<'_> {
    fn from(s: &str) -> Self {
        PooledString::new(s.as_bytes()).into()
    }
}

impl From<String> for ValueHandle<'_> {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

impl From<PooledString> for ValueHandle<'_> {
    fn from(s: PooledString) -> Self {
        ValueHandle {
            context: None,
            payload: Payload::StatelessString(s),
        }
    }
}

impl From<NativeFn> for ValueHandle<'_> {
    fn from(f: NativeFn) -> Self {
        ValueHandle {
            context: None,
            payload: Payload::NativeFunction(f),
        }
    }
}

impl<'lua> From<&ValueHandle<'lua>> for ValueHandle<'lua> {
    fn from(handle: &ValueHandle<'lua>) -> Self {
        handle.clone()
    }
}

impl fmt::Debug for ValueHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.payload, f)
    }
}

/// Renders the value the way `tostring` does.
impl fmt::Display for ValueHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Nil => f.write_str("nil"),
            Payload::Boolean(b) => write!(f, "{b}"),
            Payload::Integer(i) => write!(f, "{i}"),
            Payload::Number(n) => f.write_str(&number::format_number(*n)),
            Payload::StatelessString(s) => f.write_str(&String::from_utf8_lossy(s.as_bytes())),
            Payload::NativeFunction(func) => write!(f, "function: {:#x}", *func as usize),
            Payload::LightUserData(p) => write!(f, "userdata: {p:p}"),
            _ => {
                let text = self.with_pushed(String::new(), |state| state.display_value(-1));
                f.write_str(&text)
            }
        }
    }
}
