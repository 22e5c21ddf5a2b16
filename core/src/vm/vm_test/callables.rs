use super::*;
use crate::rt::{ContextHandle, ContextId, ServiceHandle};
use crate::val::Heap;
use crate::vm::TARGET;

#[test]
fn plain_call_returns_single_value() {
    let add = binary("add", BinOp::Add);
    assert_eq!(run_body(add, vec![Val::Int(2), Val::Int(3)]).unwrap(), Val::Int(5));
}

#[test]
fn bind_op_fixes_leading_argument() {
    let sub = binary("sub", BinOp::Sub);
    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::plain(sub)));
    let ten = b.load(10);
    let three = b.load(3);
    let bound = b.reg();
    let out = b.reg();
    b.emit(Op::Bind {
        dst: bound,
        func: f,
        index: 0,
        value: ten,
    });
    b.emit(Op::Call {
        func: bound,
        args: regs(&[three]),
        ret: Ret::One(out),
    });
    b.ret(&[out]);
    assert_eq!(run_body(b.build(), vec![]).unwrap(), Val::Int(7));
}

#[test]
fn bind_later_argument() {
    let mut ctx = context();
    let sub = Callable::plain(binary("sub", BinOp::Sub));
    let bound = sub.bind(1, Val::Int(10)).unwrap();
    assert_eq!(bound.param_count(), Some(1));
    assert_eq!(call(&mut ctx, bound, vec![Val::Int(3)]).unwrap(), Val::Int(-7));
}

#[test]
fn bind_rejects_out_of_range_index() {
    let sub = Callable::plain(binary("sub", BinOp::Sub));
    assert_eq!(sub.bind(2, Val::Nil).unwrap_err().kind, ExceptionKind::Arity);
    assert_eq!(sub.bind(-2, Val::Nil).unwrap_err().kind, ExceptionKind::Internal);
    assert!(sub.bind(TARGET, Val::Nil).is_ok());
}

#[test]
fn bound_receiver_is_visible_to_load_this() {
    // plus_this(x) = this + x
    let mut b = BodyBuilder::new("plus_this", 1);
    let this = b.reg();
    let out = b.reg();
    b.emit(Op::LoadThis { dst: this });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: out,
        l: this,
        r: 0,
    });
    b.ret(&[out]);

    let mut ctx = context();
    let bound = Callable::plain(b.build()).bind_target(Val::Int(5));
    assert_eq!(call(&mut ctx, bound, vec![Val::Int(1)]).unwrap(), Val::Int(6));
}

fn swap() -> Arc<MethodBody> {
    let mut b = BodyBuilder::new("swap", 2);
    b.ret(&[1, 0]);
    b.build()
}

#[test]
fn multiple_results_land_in_registers() {
    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::plain(swap())));
    let one = b.load(1);
    let two = b.load(2);
    let x = b.reg();
    let y = b.reg();
    b.emit(Op::Call {
        func: f,
        args: regs(&[one, two]),
        ret: Ret::Many(regs(&[x, y])),
    });
    b.ret(&[x, y]);
    assert_eq!(
        run_body(b.build(), vec![]).unwrap(),
        Val::tuple(vec![Val::Int(2), Val::Int(1)])
    );
}

#[test]
fn tuple_result_packs_every_value() {
    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::plain(swap())));
    let one = b.load(1);
    let two = b.load(2);
    let t = b.reg();
    b.emit(Op::Call {
        func: f,
        args: regs(&[one, two]),
        ret: Ret::Tuple(t),
    });
    b.ret(&[t]);
    assert_eq!(
        run_body(b.build(), vec![]).unwrap(),
        Val::tuple(vec![Val::Int(2), Val::Int(1)])
    );
}

#[test]
fn too_few_results_for_destination_registers() {
    let add = binary("add", BinOp::Add);
    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::plain(add)));
    let one = b.load(1);
    let x = b.reg();
    let y = b.reg();
    b.emit(Op::Call {
        func: f,
        args: regs(&[one, one]),
        ret: Ret::Many(regs(&[x, y])),
    });
    b.ret(&[x]);
    assert_eq!(run_body(b.build(), vec![]).unwrap_err().kind, ExceptionKind::Arity);
}

#[test]
fn natives_receive_the_executing_context() {
    let mut ctx = context();
    let native = ctx.registry().native("context_id").cloned().unwrap();
    let id = ctx.id();
    assert_eq!(call(&mut ctx, Callable::native(native), vec![]).unwrap(), Val::Int(id.0 as i64));
}

/// push_digit(cell, d): cell = cell * 10 + d
fn push_digit() -> Arc<MethodBody> {
    let mut b = BodyBuilder::new("push_digit", 2);
    let ten = b.load(10);
    b.emit(Op::VarOp {
        r: 0,
        op: CompoundOp::Assign(BinOp::Mul),
        arg: Some(ten),
        dst: None,
    });
    b.emit(Op::VarOp {
        r: 0,
        op: CompoundOp::Assign(BinOp::Add),
        arg: Some(1),
        dst: None,
    });
    b.ret(&[]);
    b.build()
}

fn append(exec: &mut Exec<'_>, cell: &Reference, digit: i64) -> Step {
    let next = match cell.get(exec.context()) {
        Ok(Val::Int(v)) => Val::Int(v * 10 + digit),
        Ok(other) => return Step::Exception(Exception::type_mismatch(other.to_string())),
        Err(e) => return Step::Exception(e),
    };
    match cell.set(exec.context_mut(), next) {
        Ok(()) => Step::Proceed,
        Err(e) => Step::Exception(e),
    }
}

/// Runs `chain`, then appends 9 to `cell` from the continuation.
struct RunChain {
    chain: FullyBound,
    cell: Reference,
}

impl Procedure for RunChain {
    fn name(&self) -> &str {
        "run-chain"
    }

    fn step(&mut self, exec: &mut Exec<'_>, index: usize) -> Step {
        if index == 0 {
            let cell = self.cell.clone();
            return self
                .chain
                .call_chain(exec, Some(Box::new(move |exec: &mut Exec<'_>| append(exec, &cell, 9))));
        }
        let value = self.cell.get(exec.context()).unwrap_or_default();
        exec.return_values(vec![value])
    }
}

fn run_chain(ctx: &mut ContextState, chain: FullyBound, cell: &Reference) -> Val {
    let fiber = ctx.start_procedure(
        Box::new(RunChain {
            chain,
            cell: cell.clone(),
        }),
        0,
        None,
    );
    ctx.run_blocking(fiber).unwrap()
}

#[test]
fn chain_runs_links_in_order_then_continuation() {
    let mut ctx = context();
    let cell = Reference::direct(ctx.id(), Some(Val::Int(0)), true);
    let push = Callable::plain(push_digit());
    let link = |d: i64| push.bind_all(None, vec![Val::Ref(cell.clone()), Val::Int(d)]).unwrap();

    let chain = link(1).chain(link(2)).chain(link(3));
    assert_eq!(chain.len(), 3);
    assert_eq!(run_chain(&mut ctx, chain, &cell), Val::Int(1239));
}

#[test]
fn trailing_sentinel_runs_each_link_once() {
    let mut ctx = context();
    let cell = Reference::direct(ctx.id(), Some(Val::Int(0)), true);
    let push = Callable::plain(push_digit());
    let link = |d: i64| push.bind_all(None, vec![Val::Ref(cell.clone()), Val::Int(d)]).unwrap();

    let chain = link(1).chain(link(2)).chain(FullyBound::NoOp);
    assert_eq!(chain.len(), 2);
    assert_eq!(run_chain(&mut ctx, chain, &cell), Val::Int(129));

    let chain = FullyBound::NoOp.chain(link(1)).chain(link(2));
    cell.set(&mut ctx, Val::Int(0)).unwrap();
    assert_eq!(run_chain(&mut ctx, chain, &cell), Val::Int(129));
}

#[test]
fn noop_chain_runs_only_the_continuation() {
    let mut ctx = context();
    let cell = Reference::direct(ctx.id(), Some(Val::Int(0)), true);
    assert_eq!(run_chain(&mut ctx, FullyBound::NoOp, &cell), Val::Int(9));
}

#[test]
fn chaining_is_persistent() {
    let ctx = context();
    let cell = Val::Ref(Reference::direct(ctx.id(), Some(Val::Int(0)), true));
    let push = Callable::plain(push_digit());
    let first = push.bind_all(None, vec![cell.clone(), Val::Int(1)]).unwrap();
    let second = push.bind_all(None, vec![cell, Val::Int(2)]).unwrap();

    let both = first.chain(second.clone());
    assert_eq!(first.len(), 1);
    assert_eq!(both.len(), 2);
    assert_eq!(FullyBound::NoOp.chain(second.clone()).len(), 1);
    assert_eq!(second.chain(FullyBound::NoOp).len(), 1);
    assert!(FullyBound::NoOp.chain(FullyBound::NoOp).is_noop());
}

#[test]
fn bind_all_checks_arity() {
    let push = Callable::plain(push_digit());
    let err = push.bind_all(None, vec![Val::Int(1)]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::Arity);
}

#[test]
fn noop_callable_delivers_nil() {
    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::FullyBound(FullyBound::NoOp)));
    let out = b.reg();
    b.emit(Op::Call {
        func: f,
        args: regs(&[]),
        ret: Ret::One(out),
    });
    b.ret(&[out]);
    assert_eq!(run_body(b.build(), vec![]).unwrap(), Val::Nil);
}

fn answer() -> Arc<MethodBody> {
    let mut b = BodyBuilder::new("answer", 0);
    let out = b.load(42);
    b.ret(&[out]);
    b.build()
}

fn service_in(ctx: ContextId) -> (ServiceHandle, tokio::sync::mpsc::UnboundedReceiver<crate::rt::Request>) {
    let class = ClassInfo::builder("Oracle").service().method("answer", answer()).build();
    let object = Heap::new(ctx).alloc(class);
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    let handle = ContextHandle::new(ctx, Arc::from("Oracle"), sender);
    (ServiceHandle::new(handle, object), receiver)
}

fn call_service_method(ctx: &mut ContextState, service: &ServiceHandle) -> Result<Val, Exception> {
    let chain = service.object().class().method("answer").cloned().unwrap();
    let mut b = BodyBuilder::new("main", 0);
    let f = b.load(function(Callable::service_method(service.clone(), chain)));
    let out = b.reg();
    b.emit(Op::Call {
        func: f,
        args: regs(&[]),
        ret: Ret::One(out),
    });
    b.ret(&[out]);
    call(ctx, Callable::plain(b.build()), vec![])
}

#[test]
fn service_method_in_own_context_is_a_direct_call() {
    let mut ctx = context();
    let (service, mut mailbox) = service_in(ctx.id());
    assert_eq!(call_service_method(&mut ctx, &service).unwrap(), Val::Int(42));
    assert!(mailbox.try_recv().is_err());
    assert_eq!(ctx.stats().requests_sent(), 0);
}

#[test]
fn service_method_in_other_context_posts_a_request() {
    let mut ctx = context();
    let (service, mut mailbox) = service_in(ContextId(ctx.id().0 + 100));
    let result = call_service_method(&mut ctx, &service).unwrap();
    assert!(matches!(&result, Val::Future(f) if f.is_pending()));
    assert!(mailbox.try_recv().is_ok());
    assert_eq!(ctx.stats().requests_sent(), 1);
    assert_eq!(ctx.stats().futures_created(), 1);
}

/// `order = order * 10 + digit` on the receiver; `arg` is accepted and ignored.
fn record(name: &str, digit: i64) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new(name, 1);
    let this = b.reg();
    let cur = b.reg();
    let ten = b.load(10);
    let d = b.load(digit);
    b.emit(Op::LoadThis { dst: this });
    b.emit(Op::GetField {
        dst: cur,
        obj: this,
        field: Arc::from("order"),
    });
    b.emit(Op::Arith {
        op: BinOp::Mul,
        dst: cur,
        l: cur,
        r: ten,
    });
    b.emit(Op::Arith {
        op: BinOp::Add,
        dst: cur,
        l: cur,
        r: d,
    });
    b.emit(Op::SetField {
        obj: this,
        field: Arc::from("order"),
        src: cur,
    });
    b.build()
}

#[test]
fn constructors_run_base_first_then_finalizers_in_registration_order() {
    // Base(seed) sets order = seed
    let mut base_ctor = BodyBuilder::new("Base", 1);
    let this = base_ctor.reg();
    base_ctor.emit(Op::LoadThis { dst: this });
    base_ctor.emit(Op::SetField {
        obj: this,
        field: Arc::from("order"),
        src: 0,
    });
    let base = ClassInfo::builder("Base")
        .field("order")
        .constructor(base_ctor.build(), Some(record("Base.finally", 3)))
        .build();
    let derived = ClassInfo::builder("Derived")
        .extends(base)
        .constructor(record("Derived", 2), Some(record("Derived.finally", 4)))
        .build();
    let mut registry = Registry::new();
    registry.register_class(derived).unwrap();

    let mut b = BodyBuilder::new("main", 0);
    let seed = b.load(1);
    let obj = b.reg();
    let out = b.reg();
    b.emit(Op::New {
        dst: obj,
        class: Arc::from("Derived"),
        args: regs(&[seed]),
    });
    b.emit(Op::GetField {
        dst: out,
        obj,
        field: Arc::from("order"),
    });
    b.ret(&[out]);

    let mut ctx = context_with(registry, RuntimeConfig::default());
    assert_eq!(call(&mut ctx, Callable::plain(b.build()), vec![]).unwrap(), Val::Int(1_234));
}
