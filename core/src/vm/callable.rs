use std::sync::Arc;

use tracing::trace;

use crate::rt::ServiceHandle;
use crate::val::{Exception, Val};

use super::invoke::has_deferred;
use super::{Continuation, DispatchChain, Exec, MethodBody, Native, ReturnTo, Step};

/// Argument index that binds the receiver instead of a positional argument.
pub const TARGET: isize = -1;

/// A first-class invocable value.
///
/// Handles are immutable; every binding operation produces a new handle.
#[derive(Debug, Clone)]
pub enum Callable {
    /// A free function body.
    Plain(Arc<MethodBody>),
    /// A method at a given depth of its dispatch chain.
    Chain { chain: Arc<DispatchChain>, depth: usize },
    Bound(Arc<BoundCallable>),
    FullyBound(FullyBound),
    Native(Native),
    /// A method of a service; calls from other contexts go through its mailbox.
    Async(Arc<AsyncCallable>),
}

#[derive(Debug)]
pub struct BoundCallable {
    pub(crate) delegate: Callable,
    /// `TARGET` or a positional index.
    pub(crate) index: isize,
    pub(crate) value: Val,
}

#[derive(Debug)]
pub struct AsyncCallable {
    pub(crate) delegate: Callable,
    pub(crate) service: ServiceHandle,
}

impl Callable {
    pub fn plain(body: Arc<MethodBody>) -> Self {
        Callable::Plain(body)
    }

    pub fn method(chain: Arc<DispatchChain>) -> Self {
        Callable::Chain { chain, depth: 0 }
    }

    pub fn native(native: Native) -> Self {
        Callable::Native(native)
    }

    pub fn service_method(service: ServiceHandle, chain: Arc<DispatchChain>) -> Self {
        Callable::Async(Arc::new(AsyncCallable {
            delegate: Callable::method(chain),
            service,
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Callable::Plain(body) => &body.name,
            Callable::Chain { chain, .. } => chain.name(),
            Callable::Bound(b) => b.delegate.name(),
            Callable::FullyBound(FullyBound::NoOp) => "<no-op>",
            Callable::FullyBound(FullyBound::Link(link)) => link.delegate.name(),
            Callable::Native(n) => &n.name,
            Callable::Async(a) => a.delegate.name(),
        }
    }

    /// Number of positional arguments still expected, `None` for variadic natives.
    pub fn param_count(&self) -> Option<usize> {
        match self {
            Callable::Plain(body) => Some(body.params as usize),
            Callable::Chain { chain, depth } => chain.body(*depth).map(|b| b.params as usize),
            Callable::Bound(b) if b.index == TARGET => b.delegate.param_count(),
            Callable::Bound(b) => b.delegate.param_count().map(|n| n.saturating_sub(1)),
            Callable::FullyBound(_) => Some(0),
            Callable::Native(_) => None,
            Callable::Async(a) => a.delegate.param_count(),
        }
    }

    pub fn is_native(&self) -> bool {
        match self {
            Callable::Plain(body) => body.is_native(),
            Callable::Chain { chain, depth } => chain.is_native(*depth),
            Callable::Bound(b) => b.delegate.is_native(),
            Callable::FullyBound(FullyBound::NoOp) => true,
            Callable::FullyBound(FullyBound::Link(link)) => link.delegate.is_native(),
            Callable::Native(_) => true,
            Callable::Async(a) => a.delegate.is_native(),
        }
    }

    /// Bind `value` at `index` (`TARGET` for the receiver).
    pub fn bind(&self, index: isize, value: Val) -> Result<Callable, Exception> {
        if index < TARGET {
            return Err(Exception::internal(format!("invalid bind index {index}")));
        }
        if index != TARGET
            && let Some(params) = self.param_count()
            && index as usize >= params
        {
            return Err(Exception::arity(self.name(), params, index as usize + 1));
        }
        Ok(Callable::Bound(Arc::new(BoundCallable {
            delegate: self.clone(),
            index,
            value,
        })))
    }

    pub fn bind_target(&self, target: Val) -> Callable {
        Callable::Bound(Arc::new(BoundCallable {
            delegate: self.clone(),
            index: TARGET,
            value: target,
        }))
    }

    /// Bind every argument (and optionally the receiver), producing a chainable handle.
    pub fn bind_all(&self, target: Option<Val>, args: Vec<Val>) -> Result<FullyBound, Exception> {
        if let Some(params) = self.param_count()
            && params != args.len()
        {
            return Err(Exception::arity(self.name(), params, args.len()));
        }
        let delegate = match target {
            Some(t) => self.bind_target(t),
            None => self.clone(),
        };
        Ok(FullyBound::Link(Arc::new(ChainLink {
            delegate,
            args: Arc::from(args),
            next: FullyBound::NoOp,
        })))
    }

    /// Reject handles that capture context-private state.
    pub fn check_pass_through(&self) -> Result<(), Exception> {
        match self {
            Callable::Bound(b) => {
                b.value.check_pass_through()?;
                b.delegate.check_pass_through()
            }
            Callable::FullyBound(fb) => fb.check_pass_through(),
            _ => Ok(()),
        }
    }

    /// Invoke against the executing fiber. Results are delivered to `ret` in the
    /// current frame, either immediately (`Proceed`) or when the pushed frame returns.
    pub fn invoke(&self, exec: &mut Exec<'_>, target: Option<Val>, mut args: Vec<Val>, ret: ReturnTo) -> Step {
        trace!(callable = self.name(), argc = args.len(), "invoke");
        match self {
            Callable::Plain(body) => exec.enter_body(body.clone(), None, target, args, ret),
            Callable::Chain { chain, depth } => match chain.body(*depth) {
                Some(body) => exec.enter_body(body.clone(), Some((chain.clone(), *depth)), target, args, ret),
                None => Step::Exception(Exception::no_such_method("<chain>", chain.name())),
            },
            Callable::Bound(b) => {
                if b.index == TARGET {
                    return b.delegate.invoke(exec, Some(b.value.clone()), args, ret);
                }
                let index = b.index as usize;
                if index > args.len() {
                    return Step::Exception(Exception::arity(self.name(), index + 1, args.len() + 1));
                }
                args.insert(index, b.value.clone());
                b.delegate.invoke(exec, target, args, ret)
            }
            Callable::FullyBound(FullyBound::NoOp) => match exec.deliver(&ret, Vec::new()) {
                Ok(()) => Step::Proceed,
                Err(e) => Step::Exception(e),
            },
            Callable::FullyBound(FullyBound::Link(link)) => {
                let mut all = link.args.to_vec();
                all.extend(args);
                link.delegate.invoke(exec, target, all, ret)
            }
            Callable::Native(native) if !native.raw_args && has_deferred(&args) => {
                exec.drain_then_call(self.clone(), target, args, ret)
            }
            Callable::Native(native) => exec.call_native(native.func, target, args, ret),
            Callable::Async(a) => {
                let object = Val::Object(a.service.object().clone());
                if a.service.context_id() == exec.context_id() || a.delegate.is_native() {
                    a.delegate.invoke(exec, Some(object), args, ret)
                } else {
                    exec.send_invoke(&a.service, a.delegate.clone(), Some(object), args, ret)
                }
            }
        }
    }

    /// Call expecting at most one result, stored in `dst` when given.
    pub fn call_one(&self, exec: &mut Exec<'_>, target: Option<Val>, args: Vec<Val>, dst: Option<u16>) -> Step {
        let ret = match dst {
            Some(r) => ReturnTo::Register(r),
            None => ReturnTo::Ignore,
        };
        self.invoke(exec, target, args, ret)
    }

    /// Call collecting every result into one tuple stored in `dst`.
    pub fn call_tuple(&self, exec: &mut Exec<'_>, target: Option<Val>, args: Vec<Val>, dst: u16) -> Step {
        self.invoke(exec, target, args, ReturnTo::Tuple(dst))
    }

    /// Call storing result `i` into `dsts[i]`.
    pub fn call_many(&self, exec: &mut Exec<'_>, target: Option<Val>, args: Vec<Val>, dsts: &[u16]) -> Step {
        self.invoke(exec, target, args, ReturnTo::Registers(Arc::from(dsts)))
    }
}

/// A handle with every argument bound, linked into a singly-linked chain.
///
/// `NoOp` is the empty chain: chaining onto it yields the other operand and running it
/// does nothing.
#[derive(Debug, Clone, Default)]
pub enum FullyBound {
    #[default]
    NoOp,
    Link(Arc<ChainLink>),
}

#[derive(Debug)]
pub struct ChainLink {
    pub(crate) delegate: Callable,
    pub(crate) args: Arc<[Val]>,
    pub(crate) next: FullyBound,
}

impl FullyBound {
    pub fn is_noop(&self) -> bool {
        matches!(self, FullyBound::NoOp)
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self;
        while let FullyBound::Link(link) = cursor {
            n += 1;
            cursor = &link.next;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.is_noop()
    }

    /// Append `next` at the tail. Existing chains are never modified.
    pub fn chain(&self, next: FullyBound) -> FullyBound {
        match (self, &next) {
            (FullyBound::NoOp, _) => next,
            (_, FullyBound::NoOp) => self.clone(),
            (FullyBound::Link(link), _) => FullyBound::Link(Arc::new(ChainLink {
                delegate: link.delegate.clone(),
                args: link.args.clone(),
                next: link.next.chain(next),
            })),
        }
    }

    pub(crate) fn split(&self) -> Option<(Callable, Arc<[Val]>, FullyBound)> {
        match self {
            FullyBound::NoOp => None,
            FullyBound::Link(link) => Some((link.delegate.clone(), link.args.clone(), link.next.clone())),
        }
    }

    /// Run every link left to right, then `then` (if any) in the calling frame.
    pub fn call_chain(&self, exec: &mut Exec<'_>, then: Option<Continuation>) -> Step {
        match self {
            FullyBound::NoOp => match then {
                Some(k) => k(exec),
                None => Step::Proceed,
            },
            FullyBound::Link(_) => exec.run_chain(self.clone(), then),
        }
    }

    pub fn check_pass_through(&self) -> Result<(), Exception> {
        let mut cursor = self;
        while let FullyBound::Link(link) = cursor {
            link.args.iter().try_for_each(Val::check_pass_through)?;
            link.delegate.check_pass_through()?;
            cursor = &link.next;
        }
        Ok(())
    }
}
