//! Benchmarks for handle creation, table access and call overhead.

use std::ffi::c_int;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lunabind::{CallInvoker, ContextConfig, ReturnPolicy, RuntimeContext, State, ValueHandle, ffi};

unsafe extern "C-unwind" fn add(l: *mut ffi::lua_State) -> c_int {
    let state = unsafe { State::from_raw(l) };
    let a = state.to_integer(1).unwrap_or(0);
    let b = state.to_integer(2).unwrap_or(0);
    state.push_integer(a + b);
    1
}

unsafe extern "C-unwind" fn two(l: *mut ffi::lua_State) -> c_int {
    let state = unsafe { State::from_raw(l) };
    state.push_integer(1);
    state.push_integer(2);
    2
}

fn bench_handle_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_creation");
    let ctx = RuntimeContext::new();

    group.bench_function("stateless_string", |b| {
        b.iter(|| black_box(ValueHandle::from(black_box("literal"))));
    });

    group.bench_function("bound_string", |b| {
        b.iter(|| black_box(ctx.string(black_box("literal"))));
    });

    group.bench_function("table", |b| {
        b.iter(|| black_box(ctx.create_table(0, 0)));
    });

    let table = ctx.create_table(0, 0);
    group.bench_function("clone_table_handle", |b| {
        b.iter(|| black_box(table.clone()));
    });

    group.finish();
}

fn bench_table_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_access");
    let ctx = RuntimeContext::new();
    let table = ctx.create_table(16, 0);
    for i in 1..=16 {
        table.table_set(i, i * 2).unwrap();
    }

    group.bench_function("get_integer_key", |b| {
        b.iter(|| black_box(table.table_get(black_box(8)).unwrap()));
    });

    group.bench_function("set_string_key", |b| {
        b.iter(|| table.table_set(black_box("key"), black_box(1)).unwrap());
    });

    let slot = table.index("slot").unwrap();
    group.bench_function("proxy_roundtrip", |b| {
        b.iter(|| {
            slot.set(black_box(3)).unwrap();
            black_box(slot.get().unwrap())
        });
    });

    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("calls");

    let single = RuntimeContext::with_config(
        ContextConfig::default().with_return_policy(ReturnPolicy::Single),
    );
    let f = single.native_function(add);
    group.bench_function("native_two_args", |b| {
        b.iter(|| black_box(CallInvoker::new(&f).arg(1).arg(2).invoke().unwrap()));
    });

    single
        .do_string("function add(a, b) return a + b end")
        .unwrap();
    let script_add = single.get_global("add");
    group.bench_function("script_two_args", |b| {
        b.iter(|| black_box(CallInvoker::new(&script_add).arg(1).arg(2).invoke().unwrap()));
    });

    let table = RuntimeContext::new();
    let g = table.native_function(two);
    group.bench_function("table_policy_two_results", |b| {
        b.iter(|| black_box(g.call(Vec::<ValueHandle>::new()).unwrap()));
    });

    let vector = RuntimeContext::with_config(
        ContextConfig::default().with_return_policy(ReturnPolicy::Vector),
    );
    let h = vector.native_function(two);
    group.bench_function("vector_policy_two_results", |b| {
        b.iter(|| black_box(h.call(Vec::<ValueHandle>::new()).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_handle_creation, bench_table_access, bench_calls);
criterion_main!(benches);
