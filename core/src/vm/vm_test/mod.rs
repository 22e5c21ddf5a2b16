pub(super) use std::sync::Arc;

pub(super) use crate::{
    registry::Registry,
    rt::{ContextState, FutureHandle, RuntimeConfig},
    val::{ClassInfo, Exception, ExceptionKind, Val, numeric::BinOp},
    vm::{
        BodyBuilder, Callable, CompoundOp, Exec, FullyBound, MethodBody, Native, Op, Procedure, RefKind, RefSource,
        Reference, Ret, Step, regs,
    },
};

pub(super) fn context_with(registry: Registry, config: RuntimeConfig) -> ContextState {
    ContextState::detached(Arc::new(registry), config)
}

pub(super) fn context() -> ContextState {
    context_with(Registry::new(), RuntimeConfig::default())
}

/// Run `callable(args)` to completion on `ctx`.
pub(super) fn call(ctx: &mut ContextState, callable: Callable, args: Vec<Val>) -> Result<Val, Exception> {
    let fiber = ctx.start_call(callable, None, args);
    ctx.run_blocking(fiber)
}

pub(super) fn run_body(body: Arc<MethodBody>, args: Vec<Val>) -> Result<Val, Exception> {
    call(&mut context(), Callable::plain(body), args)
}

/// `name(a, b) = a <op> b`
pub(super) fn binary(name: &str, op: BinOp) -> Arc<MethodBody> {
    let mut b = BodyBuilder::new(name, 2);
    let out = b.reg();
    b.emit(Op::Arith { op, dst: out, l: 0, r: 1 });
    b.ret(&[out]);
    b.build()
}

pub(super) fn function(callable: Callable) -> Val {
    Val::Function(callable)
}

mod callables;
mod control;
mod references;
