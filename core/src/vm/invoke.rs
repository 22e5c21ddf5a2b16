//! Call machinery shared by the interpreter, procedures and callable handles.

use std::sync::Arc;

use tracing::trace;

use crate::rt::{ContextHandle, FutureHandle, RequestKind, Returns, ServiceHandle};
use crate::val::{ClassInfo, Exception, ExceptionKind, ObjectRef, Val};

use super::{
    BodyCode, Callable, Code, Continuation, DispatchChain, Exec, Frame, FrameId, FullyBound, MethodBody, NativeFn,
    Procedure, ReturnTo, Step,
};

impl<'a> Exec<'a> {
    /// Deliver `values` into the current frame according to `ret`.
    pub fn deliver(&mut self, ret: &ReturnTo, values: Vec<Val>) -> Result<(), Exception> {
        let frame = self.frame_mut()?;
        match ret {
            ReturnTo::Ignore => {}
            ReturnTo::Register(r) => frame.set(*r, values.into_iter().next().unwrap_or_default()),
            ReturnTo::Tuple(r) => frame.set(*r, Val::tuple(values)),
            ReturnTo::Registers(regs) => {
                if values.len() < regs.len() {
                    return Err(Exception::arity("return", regs.len(), values.len()));
                }
                for (r, v) in regs.iter().zip(values) {
                    frame.set(*r, v);
                }
            }
            ReturnTo::Stack => frame.push(values.into_iter().next().unwrap_or_default()),
        }
        Ok(())
    }

    pub fn deliver_step(&mut self, ret: &ReturnTo, values: Vec<Val>) -> Step {
        match self.deliver(ret, values) {
            Ok(()) => Step::Proceed,
            Err(e) => Step::Exception(e),
        }
    }

    /// End the current frame with `values` as its results.
    pub fn return_values(&mut self, values: Vec<Val>) -> Step {
        match self.frame_mut() {
            Ok(frame) => {
                frame.returning = values;
                Step::Return
            }
            Err(e) => Step::Exception(e),
        }
    }

    pub(crate) fn call_native(&mut self, func: NativeFn, target: Option<Val>, args: Vec<Val>, ret: ReturnTo) -> Step {
        let value = match func(self, target.as_ref(), &args) {
            Ok(v) => v,
            Err(e) => return Step::Exception(e),
        };
        let values = match (&ret, value) {
            (ReturnTo::Registers(regs), Val::Tuple(items)) if regs.len() != 1 => items.to_vec(),
            (ReturnTo::Tuple(_), Val::Tuple(items)) => items.to_vec(),
            (_, v) => vec![v],
        };
        self.deliver_step(&ret, values)
    }

    fn push_frame(&mut self, mut frame: Frame) -> FrameId {
        let caller = self.fiber.current();
        frame.depth = caller
            .and_then(|id| self.ctx.frames.get(id))
            .map_or(0, |f| f.depth + 1);
        frame.caller = caller;
        self.ctx.frames.insert(frame)
    }

    /// Push a host-implemented frame; its results go to `ret` in the current frame.
    pub fn push_procedure(&mut self, procedure: Box<dyn Procedure>, regs: usize, ret: ReturnTo) -> Step {
        trace!(procedure = procedure.name(), "push procedure");
        Step::Call(self.push_frame(Frame::new(Code::Procedure(procedure), regs, ret)))
    }

    pub(crate) fn enter_body(
        &mut self,
        body: Arc<MethodBody>,
        chain: Option<(Arc<DispatchChain>, usize)>,
        target: Option<Val>,
        args: Vec<Val>,
        ret: ReturnTo,
    ) -> Step {
        if args.len() != body.params as usize {
            return Step::Exception(Exception::arity(&body.name, body.params as usize, args.len()));
        }
        if has_deferred(&args) {
            let callable = match chain {
                Some((chain, depth)) => Callable::Chain { chain, depth },
                None => Callable::Plain(body),
            };
            return self.drain_then_call(callable, target, args, ret);
        }
        if let BodyCode::Native(func) = body.code {
            return self.call_native(func, target, args, ret);
        }
        let mut frame = Frame::new(Code::Ops(body.clone()), body.regs.max(body.params) as usize, ret);
        for (i, arg) in args.into_iter().enumerate() {
            frame.regs[i] = Some(arg);
        }
        frame.chain = chain;
        frame.target = target;
        Step::Call(self.push_frame(frame))
    }

    /// Wait for every future in `args`, then invoke `callable` with the values.
    pub(crate) fn drain_then_call(
        &mut self,
        callable: Callable,
        target: Option<Val>,
        args: Vec<Val>,
        ret: ReturnTo,
    ) -> Step {
        let (inner, outer, count) = match &ret {
            ReturnTo::Ignore => (ReturnTo::Ignore, ReturnTo::Ignore, 0),
            ReturnTo::Register(r) => (ReturnTo::Register(0), ReturnTo::Register(*r), 1),
            ReturnTo::Tuple(r) => (ReturnTo::Tuple(0), ReturnTo::Register(*r), 1),
            ReturnTo::Stack => (ReturnTo::Register(0), ReturnTo::Stack, 1),
            ReturnTo::Registers(regs) => {
                let inner: Vec<u16> = (0..regs.len() as u16).collect();
                (ReturnTo::Registers(Arc::from(inner)), ret.clone(), regs.len())
            }
        };
        let drain = DrainDeferred {
            callable,
            target,
            args,
            inner,
            count,
        };
        self.push_procedure(Box::new(drain), count, outer)
    }

    /// Value of `v`, waiting for it first if it is a future.
    pub fn resolve(&mut self, v: Val) -> Result<Val, Step> {
        match v {
            Val::Future(f) => self.await_future(&f),
            other => Ok(other),
        }
    }

    pub fn await_future(&mut self, future: &FutureHandle) -> Result<Val, Step> {
        match future.peek() {
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => Err(Step::Exception(e)),
            None => {
                future.subscribe(self.ctx.waker());
                Err(Step::Repeat)
            }
        }
    }

    /// Register `k` on frame `id` and switch to it.
    pub fn add_continuation(&mut self, id: FrameId, k: Continuation) -> Step {
        match self.ctx.frames.get_mut(id) {
            Some(frame) => {
                frame.add_continuation(k);
                Step::Call(id)
            }
            None => Step::Exception(Exception::internal(format!("{id} is not live"))),
        }
    }

    /// Run `k` once the call that produced `step` has delivered its results.
    pub fn then(&mut self, step: Step, k: Continuation) -> Step {
        match step {
            Step::Proceed => k(self),
            Step::Call(child) => self.add_continuation(child, k),
            other => other,
        }
    }

    pub(crate) fn run_chain(&mut self, chain: FullyBound, then: Option<Continuation>) -> Step {
        let step = self.push_procedure(Box::new(ChainRunner { cursor: chain }), 0, ReturnTo::Ignore);
        match (step, then) {
            (Step::Call(id), Some(k)) => self.add_continuation(id, k),
            (step, _) => step,
        }
    }

    /// Dispatch `method` on `target` starting at the most-derived body.
    pub fn invoke_method(&mut self, target: Val, method: &str, args: Vec<Val>, ret: ReturnTo) -> Step {
        match &target {
            Val::Object(obj) => match obj.class().method(method) {
                Some(chain) => Callable::method(chain.clone()).invoke(self, Some(target.clone()), args, ret),
                None => Step::Exception(Exception::no_such_method(&obj.class().name, method)),
            },
            Val::Service(svc) => match svc.object().class().method(method) {
                Some(chain) => Callable::service_method(svc.clone(), chain.clone()).invoke(self, None, args, ret),
                None => Step::Exception(Exception::no_such_method(&svc.object().class().name, method)),
            },
            Val::Function(f) if method == "call" => f.invoke(self, None, args, ret),
            other => Step::Exception(Exception::no_such_method(other.type_name(), method)),
        }
    }

    /// Continue with the next body of the current frame's dispatch chain.
    pub fn call_next(&mut self, args: Vec<Val>, ret: ReturnTo) -> Step {
        let (chain, depth, target) = match self.frame() {
            Ok(frame) => match &frame.chain {
                Some((chain, depth)) => (chain.clone(), *depth, frame.target.clone()),
                None => {
                    return Step::Exception(Exception::new(
                        ExceptionKind::NoSuperMethod,
                        frame.code.name().to_string(),
                    ));
                }
            },
            Err(e) => return Step::Exception(e),
        };
        match chain.super_of(depth) {
            Some(next) => Callable::Chain { chain, depth: next }.invoke(self, target, args, ret),
            None => Step::Exception(Exception::new(
                ExceptionKind::NoSuperMethod,
                format!("{} has no body past depth {depth}", chain.name()),
            )),
        }
    }

    pub fn class(&self, name: &str) -> Result<Arc<ClassInfo>, Exception> {
        self.ctx
            .registry()
            .class(name)
            .cloned()
            .ok_or_else(|| Exception::new(ExceptionKind::NoSuchClass, name.to_string()))
    }

    /// Allocate an instance of `class` in this context and run its constructor
    /// sequence, then its finalizer chain. The object is delivered to `ret`.
    pub fn construct(&mut self, class: Arc<ClassInfo>, args: Vec<Val>, ret: ReturnTo) -> Step {
        let object = self.ctx.heap.alloc(class);
        trace!(object = ?object, "construct");
        let procedure = Construct {
            object,
            args,
            finally: FullyBound::NoOp,
        };
        self.push_procedure(Box::new(procedure), 0, ret)
    }

    /// Start a new service context running `class`'s constructor. A future of the
    /// service handle is delivered to `ret`.
    pub fn construct_service(&mut self, class: Arc<ClassInfo>, args: Vec<Val>, ret: ReturnTo) -> Step {
        if let Err(e) = args.iter().try_for_each(Val::check_pass_through) {
            return Step::Exception(e);
        }
        let context = match self.ctx.spawn_context(&class.name) {
            Ok(handle) => handle,
            Err(e) => return Step::Exception(e),
        };
        let kind = RequestKind::Construct {
            class,
            args,
            context: context.clone(),
        };
        self.send(&context, kind, ret)
    }

    pub(crate) fn send_invoke(
        &mut self,
        service: &ServiceHandle,
        callable: Callable,
        target: Option<Val>,
        args: Vec<Val>,
        ret: ReturnTo,
    ) -> Step {
        if let Err(e) = args.iter().try_for_each(Val::check_pass_through) {
            return Step::Exception(e);
        }
        let returns = Returns::for_return(&ret);
        let kind = RequestKind::Invoke {
            callable,
            target,
            args,
            returns,
        };
        self.send(service.context(), kind, ret)
    }

    pub fn send_get_property(&mut self, service: &ServiceHandle, field: u16, ret: ReturnTo) -> Step {
        let kind = RequestKind::GetProperty {
            target: service.object().clone(),
            field,
        };
        self.send(service.context(), kind, ret)
    }

    pub fn send_set_property(&mut self, service: &ServiceHandle, field: u16, value: Val) -> Step {
        if let Err(e) = value.check_pass_through() {
            return Step::Exception(e);
        }
        let kind = RequestKind::SetProperty {
            target: service.object().clone(),
            field,
            value,
        };
        self.send(service.context(), kind, ReturnTo::Ignore)
    }

    /// Post a request to another context. Zero-result requests allocate no future;
    /// otherwise the future (or one derived future per result slot) is delivered
    /// to `ret` immediately.
    fn send(&mut self, context: &ContextHandle, kind: RequestKind, ret: ReturnTo) -> Step {
        let deadline = self.fiber.deadline();
        if ret == ReturnTo::Ignore {
            return match context.post(kind, None, deadline, self.ctx.stats()) {
                Ok(()) => Step::Proceed,
                Err(e) => Step::Exception(e),
            };
        }
        let future = self.ctx.new_future();
        if let Err(e) = context.post(kind, Some(future.clone()), deadline, self.ctx.stats()) {
            return Step::Exception(e);
        }
        match &ret {
            ReturnTo::Tuple(r) => match self.frame_mut() {
                Ok(frame) => {
                    frame.set(*r, Val::Future(future));
                    Step::Proceed
                }
                Err(e) => Step::Exception(e),
            },
            ReturnTo::Registers(regs) => {
                let slots = (0..regs.len()).map(|i| Val::Future(future.slot(i))).collect();
                self.deliver_step(&ret, slots)
            }
            _ => self.deliver_step(&ret, vec![Val::Future(future)]),
        }
    }
}

pub(crate) fn has_deferred(args: &[Val]) -> bool {
    args.iter().any(|a| matches!(a, Val::Future(_)))
}

/// Waits for every deferred argument, then makes the real call.
struct DrainDeferred {
    callable: Callable,
    target: Option<Val>,
    args: Vec<Val>,
    inner: ReturnTo,
    count: usize,
}

impl Procedure for DrainDeferred {
    fn name(&self) -> &str {
        "drain-deferred"
    }

    fn step(&mut self, exec: &mut Exec<'_>, index: usize) -> Step {
        match index {
            0 => {
                for arg in self.args.iter_mut() {
                    if let Val::Future(f) = arg {
                        match exec.await_future(f) {
                            Ok(v) => *arg = v,
                            Err(step) => return step,
                        }
                    }
                }
                Step::Proceed
            }
            1 => {
                let args = std::mem::take(&mut self.args);
                let callable = self.callable.clone();
                callable.invoke(exec, self.target.take(), args, self.inner.clone())
            }
            _ => {
                let values: Vec<Val> = match exec.frame() {
                    Ok(frame) => (0..self.count as u16)
                        .map(|r| frame.get(r).cloned().unwrap_or_default())
                        .collect(),
                    Err(e) => return Step::Exception(e),
                };
                exec.return_values(values)
            }
        }
    }
}

/// Runs each link of a fully bound chain in order.
struct ChainRunner {
    cursor: FullyBound,
}

impl Procedure for ChainRunner {
    fn name(&self) -> &str {
        "call-chain"
    }

    fn step(&mut self, exec: &mut Exec<'_>, _index: usize) -> Step {
        match self.cursor.split() {
            None => exec.return_values(Vec::new()),
            Some((callable, args, next)) => {
                self.cursor = next;
                callable.invoke(exec, None, args.to_vec(), ReturnTo::Ignore)
            }
        }
    }
}

/// Constructor sequence: each constructor base-first, registering its finalizer as it
/// goes, then the accumulated finalizer chain, then the object itself is returned.
struct Construct {
    object: ObjectRef,
    args: Vec<Val>,
    finally: FullyBound,
}

impl Procedure for Construct {
    fn name(&self) -> &str {
        "construct"
    }

    fn step(&mut self, exec: &mut Exec<'_>, index: usize) -> Step {
        let class = self.object.class().clone();
        let stages = class.constructors.len();
        let target = Val::Object(self.object.clone());
        if index < stages {
            let stage = &class.constructors[index];
            let params = stage.body.params as usize;
            if params > self.args.len() {
                return Step::Exception(Exception::arity(&stage.body.name, params, self.args.len()));
            }
            let args = self.args[..params].to_vec();
            if let Some(finalizer) = &stage.finalizer {
                let link = Callable::plain(finalizer.clone()).bind_all(Some(target.clone()), args.clone());
                match link {
                    Ok(link) => self.finally = self.finally.chain(link),
                    Err(e) => return Step::Exception(e),
                }
            }
            return Callable::plain(stage.body.clone()).invoke(exec, Some(target), args, ReturnTo::Ignore);
        }
        if index == stages {
            let finally = std::mem::take(&mut self.finally);
            return finally.call_chain(exec, None);
        }
        exec.return_values(vec![target])
    }
}
