//! End-to-end behaviour of value handles, proxies and calls.

mod common;

use common::{context, echo};
use lunabind::{CallInvoker, Error, ReturnPolicy, RuntimeContext, ValueHandle, ValueKind};

#[test]
fn test_literal_round_trip() {
    let ctx = context(ReturnPolicy::Table);

    assert!(ValueHandle::from(true).to_boolean());
    assert!(!ValueHandle::from(false).to_boolean());
    assert_eq!(ValueHandle::from(5).to_integer(), 5);
    assert_eq!(ValueHandle::from(i64::MAX).to_integer(), i64::MAX);
    assert_eq!(ValueHandle::from(0.125).to_number(), 0.125);
    assert_eq!(ValueHandle::from("x").to_string(), "x");
    assert_eq!(ctx.string("x").to_string(), "x");
    assert_eq!(ctx.create_string(b"\xffraw").to_bytes(), b"\xffraw");
    assert!(ctx.nil().is_nil());
}

#[test]
fn test_copies_alias_the_same_table() {
    let ctx = context(ReturnPolicy::Table);
    let a = ctx.create_table(0, 0);
    let b = a.clone();
    a.table_set(1, "x").unwrap();
    assert_eq!(b.table_get(1).unwrap().to_string(), "x");
    assert!(a.raw_equal(&b).unwrap());
}

#[test]
fn test_zero_arg_zero_return_call() {
    for policy in [ReturnPolicy::Single, ReturnPolicy::Table] {
        let ctx = context(policy);
        let f = ctx.native_function(echo);
        let out = CallInvoker::new(&f).invoke().unwrap();
        assert!(out.into_value().is_nil());
    }
    let ctx = context(ReturnPolicy::Vector);
    let f = ctx.native_function(echo);
    assert!(CallInvoker::new(&f).invoke().unwrap().into_values().is_empty());
}

#[test]
fn test_two_results_under_table_policy() {
    let ctx = context(ReturnPolicy::Table);
    let f = ctx.native_function(echo);
    let t = CallInvoker::new(&f).arg("a").arg(2.5).invoke().unwrap().into_value();
    assert_eq!(t.kind(), ValueKind::Table);
    assert_eq!(t.table_get(0).unwrap().to_string(), "a");
    assert_eq!(t.table_get(1).unwrap().to_number(), 2.5);
    assert_eq!(ctx.stack_depth(), 0);
}

#[test]
fn test_two_results_under_single_policy() {
    let ctx = context(ReturnPolicy::Single);
    let f = ctx.native_function(echo);
    let err = f.call([1, 2]).unwrap_err();
    assert_eq!(err, Error::TooManyReturns(2));
    insta::assert_snapshot!(err, @"a function may not return more than 1 value (got 2)");
    assert_eq!(ctx.stack_depth(), 0);
}

#[test]
fn test_cross_context_table_get() {
    let first = context(ReturnPolicy::Table);
    let second = context(ReturnPolicy::Table);
    let table = first.create_table(0, 0);
    let key = second.string("k");

    let before = (first.stack_depth(), second.stack_depth());
    assert_eq!(table.table_get(&key).unwrap_err(), Error::CrossContext);
    assert_eq!(table.table_set(&key, 1).unwrap_err(), Error::CrossContext);
    assert_eq!((first.stack_depth(), second.stack_depth()), before);
}

#[test]
fn test_numeric_classification() {
    let ctx = context(ReturnPolicy::Table);
    assert_eq!(ctx.number(3.0).kind(), ValueKind::Integer);
    assert_eq!(ctx.number(3.0).to_integer(), 3);

    let n = ctx.number(3.5);
    assert_eq!(n.kind(), ValueKind::Number);
    assert_eq!(n.to_integer(), 4);

    // Floats produced by the runtime are classified when they are loaded.
    ctx.do_string("function floats() return 8.0, 0.5, math.type(8.0) end").unwrap();
    let t = ctx.get_global("floats").call(Vec::<ValueHandle>::new()).unwrap().into_value();
    assert_eq!(t.table_get(0).unwrap().kind(), ValueKind::Integer);
    assert_eq!(t.table_get(1).unwrap().kind(), ValueKind::Number);
    assert_eq!(t.table_get(2).unwrap().to_string(), "float");
}

#[test]
fn test_script_error_then_recovery() {
    let ctx = context(ReturnPolicy::Single);
    let error = ctx.get_global("error");
    let depth = ctx.stack_depth();

    let err = error.call(["something broke"]).unwrap_err();
    assert_eq!(err, Error::Script("something broke".into()));
    assert_eq!(ctx.stack_depth(), depth);

    let tostring = ctx.get_global("tostring");
    let out = tostring.call([12]).unwrap().into_value();
    assert_eq!(out.to_string(), "12");
    assert_eq!(ctx.stack_depth(), depth);
}

#[test]
fn test_closure_errors_surface_as_script_errors() {
    let ctx = context(ReturnPolicy::Single);
    let f = ctx.create_function(|state| {
        if state.top() == 0 {
            return Err(Error::Script("expected an argument".into()));
        }
        state.push_boolean(true);
        Ok(1)
    });
    assert!(matches!(f.call(Vec::<ValueHandle>::new()), Err(Error::Script(m)) if m == "expected an argument"));
    assert!(f.call([0]).unwrap().into_value().to_boolean());
}

#[test]
fn test_host_callback_reenters_runtime() {
    let ctx = context(ReturnPolicy::Single);
    // `pcall(error, "inner")` runs a protected call inside a protected call.
    let pcall = ctx.get_global("pcall");
    let error = ctx.get_global("error");
    let out = CallInvoker::new(&pcall)
        .arg(&error)
        .arg("inner")
        .invoke();
    assert_eq!(out.unwrap_err(), Error::TooManyReturns(2));

    let ctx = context(ReturnPolicy::Vector);
    let pcall = ctx.get_global("pcall");
    let error = ctx.get_global("error");
    let values = pcall.call([&error, &ValueHandle::from("inner")]).unwrap().into_values();
    assert_eq!(values.len(), 2);
    assert!(!values[0].to_boolean());
    assert_eq!(values[1].to_string(), "inner");
}

#[test]
fn test_proxy_through_globals() {
    let ctx = context(ReturnPolicy::Table);
    let config = ctx.create_table(0, 4);
    ctx.set_global("config", &config).unwrap();

    config.index("depth").unwrap().set(3).unwrap();
    let reread = ctx.get_global("config");
    assert_eq!(reread.index("depth").unwrap().get().unwrap().to_integer(), 3);
}

#[test]
fn test_handles_release_their_anchors() {
    let ctx = context(ReturnPolicy::Vector);
    let baseline = ctx.live_anchors();
    {
        let t = ctx.create_table(0, 0);
        let _copies: Vec<_> = (0..16).map(|_| t.clone()).collect();
        let _slot = t.index("k").unwrap();
        let f = ctx.native_function(echo);
        let _results = f.call([&t, &t]).unwrap();
        assert!(ctx.live_anchors() > baseline);
    }
    assert_eq!(ctx.live_anchors(), baseline);
}

#[test]
fn test_failed_call_does_not_leak_anchors() {
    let ctx = context(ReturnPolicy::Single);
    let f = ctx.native_function(echo);
    let t = ctx.create_table(0, 0);
    let baseline = ctx.live_anchors();
    assert!(f.call([&t, &t]).is_err());
    assert_eq!(ctx.live_anchors(), baseline);
}

#[test]
fn test_contexts_are_independent() {
    let a = RuntimeContext::new();
    let b = RuntimeContext::new();
    a.set_global("shared", &a.integer(1)).unwrap();
    assert!(b.get_global("shared").is_nil());
}

#[test]
fn test_script_function_error_surfaces_message() {
    let ctx = context(ReturnPolicy::Single);
    ctx.do_string(
        "function checked(n)\n\
           if n < 0 then error('negative input') end\n\
           return n * 2\n\
         end",
    )
    .unwrap();
    let checked = ctx.get_global("checked");
    assert_eq!(checked.kind(), ValueKind::Function);

    let depth = ctx.stack_depth();
    let err = checked.call([-1]).unwrap_err();
    assert!(matches!(&err, Error::Script(m) if m.ends_with("negative input")));
    assert_eq!(ctx.stack_depth(), depth);

    assert_eq!(checked.call([21]).unwrap().into_value().to_integer(), 42);
    assert_eq!(ctx.stack_depth(), depth);
}

#[test]
fn test_do_string_error_is_a_script_error() {
    let ctx = context(ReturnPolicy::Table);
    let err = ctx.do_string("this is not lua").unwrap_err();
    assert!(matches!(err, Error::Script(_)));
    insta::assert_snapshot!(
        ctx.do_string("error('stop', 0)").unwrap_err(),
        @"script error: stop"
    );
    assert_eq!(ctx.stack_depth(), 0);
}

#[test]
fn test_scripts_call_back_into_host_closures() {
    let ctx = context(ReturnPolicy::Single);
    let double = ctx.create_function(|state| {
        let n = state.to_integer(1).unwrap_or(0);
        state.push_integer(n * 2);
        Ok(1)
    });
    ctx.set_global("double", &double).unwrap();
    ctx.do_string("function quadruple(n) return double(double(n)) end").unwrap();

    let out = ctx.get_global("quadruple").call([5]).unwrap().into_value();
    assert_eq!(out.to_integer(), 20);
}

#[test]
fn test_script_tables_are_reachable_through_handles() {
    let ctx = context(ReturnPolicy::Vector);
    ctx.do_string("settings = { name = 'demo', sizes = { 1, 2, 3 } }").unwrap();

    let settings = ctx.get_global("settings");
    assert_eq!(settings.table_get("name").unwrap().to_string(), "demo");
    let sizes = settings.table_get("sizes").unwrap();
    assert_eq!(sizes.length(), 3);

    sizes.index(4).unwrap().set(4).unwrap();
    ctx.do_string("total = 0 for _, v in ipairs(settings.sizes) do total = total + v end")
        .unwrap();
    assert_eq!(ctx.get_global("total").to_integer(), 10);
}

#[test]
fn test_tonumber_rejects_malformed_signs() {
    let ctx = context(ReturnPolicy::Single);
    let tonumber = ctx.get_global("tonumber");
    let parse = |text: &str, base: i64| {
        tonumber
            .call([ctx.string(text), ctx.integer(base)])
            .unwrap()
            .into_value()
    };
    assert!(parse("--5", 10).is_nil());
    assert!(parse("+-5", 10).is_nil());
    assert_eq!(parse("-5", 10).to_integer(), -5);
    assert_eq!(parse("ff", 16).to_integer(), 255);

    ctx.do_string("wrapped = -math.mininteger == math.mininteger").unwrap();
    assert!(ctx.get_global("wrapped").to_boolean());
}
