use std::time::Instant;

use super::*;
use crate::rt::{RequestKind, Returns};

fn thrower(message: &str) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new("thrower", 0);
    let msg = b.load(message);
    b.emit(Op::Throw { src: msg });
    b.build()
}

fn caught(result: Result<Val, Exception>) -> Exception {
    match result {
        Ok(Val::Exception(e)) => (*e).clone(),
        other => panic!("expected a caught exception, got {other:?}"),
    }
}

#[test]
fn guard_catches_throw_in_same_frame() {
    let mut b = BodyBuilder::new("main", 0);
    let e = b.reg();
    let guard = b.emit(Op::GuardStart { catch: 0, dst: e });
    let msg = b.load("boom");
    b.emit(Op::Throw { src: msg });
    let handler = b.pos();
    b.patch(guard, handler);
    b.ret(&[e]);

    let e = caught(run_body(b.build(), vec![]));
    assert_eq!(e.kind, ExceptionKind::User);
    assert_eq!(&*e.message, "boom");
}

#[test]
fn exception_unwinds_to_caller_guard() {
    let mut b = BodyBuilder::new("main", 0);
    let e = b.reg();
    let f = b.load(function(Callable::plain(thrower("deep"))));
    let guard = b.emit(Op::GuardStart { catch: 0, dst: e });
    b.emit(Op::Call {
        func: f,
        args: regs(&[]),
        ret: Ret::Ignore,
    });
    b.emit(Op::GuardEnd);
    let handler = b.pos();
    b.patch(guard, handler);
    b.ret(&[e]);

    let mut ctx = context();
    let e = caught(call(&mut ctx, Callable::plain(b.build()), vec![]));
    assert_eq!(&*e.message, "deep");
    assert!(e.stack[0].starts_with("thrower"), "stack: {:?}", e.stack);
    assert!(e.stack.iter().any(|s| s.starts_with("main")));
    assert_eq!(ctx.live_frames(), 0);
}

#[test]
fn uncaught_exception_fails_the_fiber() {
    let mut ctx = context();
    let err = call(&mut ctx, Callable::plain(thrower("loose")), vec![]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::User);
    assert_eq!(&*err.message, "loose");
    assert!(!err.stack.is_empty());
    assert_eq!(ctx.live_frames(), 0);
}

#[test]
fn guard_end_uninstalls_the_handler() {
    let mut b = BodyBuilder::new("main", 0);
    let e = b.reg();
    let guard = b.emit(Op::GuardStart { catch: 0, dst: e });
    b.emit(Op::GuardEnd);
    let msg = b.load("after");
    b.emit(Op::Throw { src: msg });
    let handler = b.pos();
    b.patch(guard, handler);
    b.ret(&[e]);
    assert_eq!(&*run_body(b.build(), vec![]).unwrap_err().message, "after");
}

#[test]
fn arity_mismatch() {
    let err = run_body(binary("add", BinOp::Add), vec![Val::Int(1)]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::Arity);
}

#[test]
fn unassigned_register_read() {
    let mut b = BodyBuilder::new("main", 0);
    let never = b.reg();
    let out = b.reg();
    b.emit(Op::Move { dst: out, src: never });
    b.ret(&[out]);
    assert_eq!(
        run_body(b.build(), vec![]).unwrap_err().kind,
        ExceptionKind::UnassignedReference
    );
}

#[test]
fn falling_off_the_end_returns_nil() {
    let mut b = BodyBuilder::new("main", 0);
    b.load(1);
    assert_eq!(run_body(b.build(), vec![]).unwrap(), Val::Nil);
}

fn constant(name: &str, value: i64) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new(name, 0);
    let out = b.load(value);
    b.ret(&[out]);
    b.build()
}

fn calls_next(name: &str, plus: i64) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new(name, 0);
    let base = b.reg();
    let k = b.load(plus);
    b.emit(Op::CallNext {
        args: regs(&[]),
        ret: Ret::One(base),
    });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: base,
        l: base,
        r: k,
    });
    b.ret(&[base]);
    b.build()
}

fn greeting_registry() -> Registry {
    let base = ClassInfo::builder("Base").method("greet", constant("Base.greet", 1)).build();
    let derived = ClassInfo::builder("Derived")
        .extends(base.clone())
        .method("greet", calls_next("Derived.greet", 10))
        .build();
    let lonely = ClassInfo::builder("Lonely")
        .method("greet", calls_next("Lonely.greet", 10))
        .build();
    let mut registry = Registry::new();
    for class in [base, derived, lonely] {
        registry.register_class(class).unwrap();
    }
    registry
}

fn greet(class: &str) -> Result<Val, Exception> {
    let mut b = BodyBuilder::new("main", 0);
    let obj = b.reg();
    let out = b.reg();
    b.emit(Op::New {
        dst: obj,
        class: Arc::from(class),
        args: regs(&[]),
    });
    b.emit(Op::Invoke {
        target: obj,
        method: Arc::from("greet"),
        args: regs(&[]),
        ret: Ret::One(out),
    });
    b.ret(&[out]);
    let mut ctx = context_with(greeting_registry(), RuntimeConfig::default());
    call(&mut ctx, Callable::plain(b.build()), vec![])
}

#[test]
fn call_next_reaches_the_base_body() {
    assert_eq!(greet("Derived").unwrap(), Val::Int(11));
    assert_eq!(greet("Base").unwrap(), Val::Int(1));
}

#[test]
fn call_next_past_the_last_body() {
    assert_eq!(greet("Lonely").unwrap_err().kind, ExceptionKind::NoSuperMethod);
}

#[test]
fn unknown_class_and_method() {
    assert_eq!(greet("Missing").unwrap_err().kind, ExceptionKind::NoSuchClass);

    let mut b = BodyBuilder::new("main", 0);
    let obj = b.reg();
    b.emit(Op::New {
        dst: obj,
        class: Arc::from("Base"),
        args: regs(&[]),
    });
    b.emit(Op::Invoke {
        target: obj,
        method: Arc::from("wave"),
        args: regs(&[]),
        ret: Ret::Ignore,
    });
    let mut ctx = context_with(greeting_registry(), RuntimeConfig::default());
    let err = call(&mut ctx, Callable::plain(b.build()), vec![]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::NoSuchMethod);
}

#[test]
fn runaway_recursion_aborts_without_running_guards() {
    let mut down = BodyBuilder::new("down", 0);
    let this = down.reg();
    down.emit(Op::LoadThis { dst: this });
    down.emit(Op::Invoke {
        target: this,
        method: Arc::from("down"),
        args: regs(&[]),
        ret: Ret::Ignore,
    });
    down.ret(&[]);
    let mut registry = Registry::new();
    registry
        .register_class(ClassInfo::builder("Rec").method("down", down.build()).build())
        .unwrap();

    let mut b = BodyBuilder::new("main", 0);
    let obj = b.reg();
    let e = b.reg();
    b.emit(Op::New {
        dst: obj,
        class: Arc::from("Rec"),
        args: regs(&[]),
    });
    let guard = b.emit(Op::GuardStart { catch: 0, dst: e });
    b.emit(Op::Invoke {
        target: obj,
        method: Arc::from("down"),
        args: regs(&[]),
        ret: Ret::Ignore,
    });
    let handler = b.pos();
    b.patch(guard, handler);
    b.ret(&[e]);

    let config = RuntimeConfig {
        max_frame_depth: 32,
        ..RuntimeConfig::default()
    };
    let mut ctx = context_with(registry, config);
    let err = call(&mut ctx, Callable::plain(b.build()), vec![]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::StackOverflow);
    assert_eq!(ctx.live_frames(), 0);
}

fn done(value: Result<Val, Exception>) -> Val {
    let future = FutureHandle::new();
    future.complete(value);
    Val::Future(future)
}

#[test]
fn completed_future_arguments_are_drained() {
    let mut ctx = context();
    let add = Callable::plain(binary("add", BinOp::Add));
    assert_eq!(
        call(&mut ctx, add.clone(), vec![done(Ok(Val::Int(4))), Val::Int(1)]).unwrap(),
        Val::Int(5)
    );

    let pair = FutureHandle::new();
    pair.complete(Ok(Val::tuple(vec![Val::Int(10), Val::Int(20)])));
    let second = Val::Future(pair.slot(1));
    assert_eq!(call(&mut ctx, add, vec![second, Val::Int(2)]).unwrap(), Val::Int(22));
    assert_eq!(ctx.live_frames(), 0);
}

#[test]
fn failed_future_argument_raises_in_caller() {
    let mut ctx = context();
    let add = Callable::plain(binary("add", BinOp::Add));
    let err = call(&mut ctx, add, vec![done(Err(Exception::user("nope"))), Val::Int(1)]).unwrap_err();
    assert_eq!(&*err.message, "nope");
}

#[test]
fn raw_natives_see_pending_futures_unresolved() {
    let mut ctx = context();
    let is_pending = ctx.registry().native("is_pending").cloned().unwrap();
    let pending = Val::Future(FutureHandle::new());
    assert_eq!(
        call(&mut ctx, Callable::native(is_pending.clone()), vec![pending.clone()]).unwrap(),
        Val::Bool(true)
    );
    assert_eq!(
        call(&mut ctx, Callable::native(is_pending), vec![done(Ok(Val::Nil))]).unwrap(),
        Val::Bool(false)
    );

    // A body cannot start until its argument resolves, which never happens here.
    let add = Callable::plain(binary("add", BinOp::Add));
    let err = call(&mut ctx, add, vec![pending, Val::Int(1)]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::Internal);
}

fn twice(_exec: &mut Exec<'_>, _this: Option<&Val>, args: &[Val]) -> Result<Val, Exception> {
    match args {
        [Val::Int(n)] => Ok(Val::Int(n * 2)),
        other => Err(Exception::type_mismatch(format!("twice got {other:?}"))),
    }
}

#[test]
fn natives_receive_drained_future_arguments() {
    let mut ctx = context();
    let native = Callable::native(Native::new("twice", twice));
    assert_eq!(
        call(&mut ctx, native.clone(), vec![done(Ok(Val::Int(21)))]).unwrap(),
        Val::Int(42)
    );

    let body = Callable::plain(MethodBody::native("twice", 1, twice));
    assert_eq!(call(&mut ctx, body.clone(), vec![done(Ok(Val::Int(5)))]).unwrap(), Val::Int(10));

    let err = call(&mut ctx, native, vec![done(Err(Exception::user("lost")))]).unwrap_err();
    assert_eq!(&*err.message, "lost");

    // A pending argument parks the call instead of reaching the native.
    let err = call(&mut ctx, body, vec![Val::Future(FutureHandle::new())]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::Internal);
}

/// sum of 0..n, yielding every iteration when `yield_each` is set
fn counting_loop(yield_each: bool) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new("count", 1);
    let acc = b.load(0);
    let i = b.load(0);
    let one = b.load(1);
    let cond = b.reg();
    let top = b.pos();
    b.emit(Op::Arith {
        op: BinOp::Lt,
        dst: cond,
        l: i,
        r: 0,
    });
    let exit = b.emit(Op::JmpIfFalse { cond, to: 0 });
    if yield_each {
        b.emit(Op::Yield);
    }
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: acc,
        l: acc,
        r: i,
    });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: i,
        l: i,
        r: one,
    });
    b.emit(Op::Jmp { to: top });
    let end = b.pos();
    b.patch(exit, end);
    b.ret(&[acc]);
    b.build()
}

#[test]
fn step_budget_and_yield_only_pause_the_fiber() {
    let config = RuntimeConfig {
        step_budget: 7,
        ..RuntimeConfig::default()
    };
    let mut ctx = context_with(Registry::new(), config);
    for yield_each in [false, true] {
        let out = call(&mut ctx, Callable::plain(counting_loop(yield_each)), vec![Val::Int(100)]).unwrap();
        assert_eq!(out, Val::Int(4_950));
    }
}

#[test]
fn expired_deadline_raises_timeout() {
    let mut ctx = context();
    let kind = RequestKind::Invoke {
        callable: Callable::plain(binary("add", BinOp::Add)),
        target: None,
        args: vec![Val::Int(1), Val::Int(2)],
        returns: Returns::One,
    };
    let fiber = ctx.start(kind, Some(Instant::now()));
    let err = ctx.run_blocking(fiber).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::Timeout);
    assert_eq!(ctx.live_frames(), 0);
}
