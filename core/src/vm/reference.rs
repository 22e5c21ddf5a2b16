use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::rt::{ContextId, ContextState};
use crate::val::numeric::{self, BinOp};
use crate::val::{Exception, ObjectRef, Val};

use super::{Callable, Continuation, Exec, FrameId, ReturnTo, Step};

/// Backing storage variant of a reference cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Direct,
    Register,
    Property,
    Element,
    RefToRef,
}

/// Read-modify-write operators available on mutable cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Assign(BinOp),
    PreInc,
    PostInc,
    PreDec,
    PostDec,
}

impl CompoundOp {
    /// Method name a class declares to override this operator.
    pub fn override_name(&self) -> &'static str {
        match self {
            CompoundOp::Assign(op) => op.assign_symbol().unwrap_or("="),
            CompoundOp::PreInc | CompoundOp::PostInc => "++",
            CompoundOp::PreDec | CompoundOp::PostDec => "--",
        }
    }

    fn is_post(&self) -> bool {
        matches!(self, CompoundOp::PostInc | CompoundOp::PostDec)
    }

    fn operand(&self, arg: Option<Val>) -> Result<(BinOp, Option<Val>), Exception> {
        match self {
            CompoundOp::Assign(op) if op.is_arith() => match arg {
                Some(v) => Ok((*op, Some(v))),
                None => Err(Exception::arity(self.override_name(), 1, 0)),
            },
            CompoundOp::Assign(op) => Err(Exception::type_mismatch(format!("{op} is not a compound operator"))),
            CompoundOp::PreInc | CompoundOp::PostInc => Ok((BinOp::Add, None)),
            CompoundOp::PreDec | CompoundOp::PostDec => Ok((BinOp::Sub, None)),
        }
    }
}

#[derive(Debug)]
enum Backing {
    Direct(Option<Val>),
    Register { frame: FrameId, reg: u16 },
    Property { target: ObjectRef, field: u16 },
    Element { container: ObjectRef, index: usize },
    Alias(Reference),
}

struct RefInner {
    mutable: bool,
    context: ContextId,
    backing: Mutex<Backing>,
}

/// A first-class handle to a storage location.
///
/// Read-only cells (`mutable == false`) reject every mutation with a read-only
/// exception. Identity is the handle itself: clones share one cell.
#[derive(Clone)]
pub struct Reference(Arc<RefInner>);

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.0.mutable { "Var" } else { "Ref" };
        write!(f, "{kind}<{:?}>", self.kind())
    }
}

enum Location {
    Register(FrameId, u16),
    Property(ObjectRef, u16),
    Element(ObjectRef, usize),
    Alias(Reference),
}

impl Reference {
    fn with(context: ContextId, backing: Backing, mutable: bool) -> Self {
        Reference(Arc::new(RefInner {
            mutable,
            context,
            backing: Mutex::new(backing),
        }))
    }

    pub fn direct(context: ContextId, value: Option<Val>, mutable: bool) -> Self {
        Self::with(context, Backing::Direct(value), mutable)
    }

    pub fn property(context: ContextId, target: ObjectRef, field: u16, mutable: bool) -> Self {
        Self::with(context, Backing::Property { target, field }, mutable)
    }

    pub fn element(context: ContextId, container: ObjectRef, index: usize, mutable: bool) -> Self {
        Self::with(context, Backing::Element { container, index }, mutable)
    }

    pub fn alias(of: &Reference, mutable: bool) -> Self {
        Self::with(of.0.context, Backing::Alias(of.clone()), mutable)
    }

    /// Reference to a register of a live frame.
    ///
    /// The first reference taken to a register becomes its canonical cell; later
    /// requests alias the canonical one so every handle observes the same storage.
    pub fn for_register(ctx: &mut ContextState, frame: FrameId, reg: u16, mutable: bool) -> Result<Self, Exception> {
        let context = ctx.id();
        let owner = ctx
            .frames
            .get_mut(frame)
            .ok_or_else(|| Exception::internal(format!("{frame} is not live")))?;
        if let Some(canonical) = owner.refs.get(&reg) {
            return Ok(Self::alias(canonical, mutable));
        }
        let cell = Self::with(context, Backing::Register { frame, reg }, mutable);
        owner.refs.insert(reg, cell.clone());
        Ok(cell)
    }

    fn backing(&self) -> MutexGuard<'_, Backing> {
        self.0.backing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> RefKind {
        match &*self.backing() {
            Backing::Direct(_) => RefKind::Direct,
            Backing::Register { .. } => RefKind::Register,
            Backing::Property { .. } => RefKind::Property,
            Backing::Element { .. } => RefKind::Element,
            Backing::Alias(_) => RefKind::RefToRef,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.0.mutable
    }

    pub fn context(&self) -> ContextId {
        self.0.context
    }

    pub fn ptr_eq(a: &Reference, b: &Reference) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Current value, `None` when unassigned.
    pub fn peek(&self, ctx: &ContextState) -> Result<Option<Val>, Exception> {
        let location = match &*self.backing() {
            Backing::Direct(v) => return Ok(v.clone()),
            Backing::Register { frame, reg } => Location::Register(*frame, *reg),
            Backing::Property { target, field } => Location::Property(target.clone(), *field),
            Backing::Element { container, index } => Location::Element(container.clone(), *index),
            Backing::Alias(inner) => Location::Alias(inner.clone()),
        };
        match location {
            Location::Register(frame, reg) => {
                if self.0.context != ctx.id() {
                    return Err(Exception::cross_context("register reference"));
                }
                let owner = ctx
                    .frames
                    .get(frame)
                    .ok_or_else(|| Exception::internal(format!("register reference outlived {frame}")))?;
                Ok(owner.get(reg).cloned())
            }
            Location::Property(target, field) => ctx.peek_field(&target, field),
            Location::Element(container, index) => ctx.heap.element(&container, index).map(Some),
            Location::Alias(inner) => inner.peek(ctx),
        }
    }

    pub fn get(&self, ctx: &ContextState) -> Result<Val, Exception> {
        self.peek(ctx)?.ok_or_else(Exception::unassigned)
    }

    pub fn is_assigned(&self, ctx: &ContextState) -> bool {
        matches!(self.peek(ctx), Ok(Some(_)))
    }

    pub fn set(&self, ctx: &mut ContextState, value: Val) -> Result<(), Exception> {
        if !self.0.mutable {
            return Err(Exception::read_only());
        }
        self.store(ctx, value)
    }

    fn store(&self, ctx: &mut ContextState, value: Val) -> Result<(), Exception> {
        let location = {
            let mut backing = self.backing();
            match &mut *backing {
                Backing::Direct(slot) => {
                    *slot = Some(value);
                    return Ok(());
                }
                Backing::Register { frame, reg } => Location::Register(*frame, *reg),
                Backing::Property { target, field } => Location::Property(target.clone(), *field),
                Backing::Element { container, index } => Location::Element(container.clone(), *index),
                Backing::Alias(inner) => Location::Alias(inner.clone()),
            }
        };
        match location {
            Location::Register(frame, reg) => {
                if self.0.context != ctx.id() {
                    return Err(Exception::cross_context("register reference"));
                }
                let owner = ctx
                    .frames
                    .get_mut(frame)
                    .ok_or_else(|| Exception::internal(format!("register reference outlived {frame}")))?;
                owner.set(reg, value);
                Ok(())
            }
            Location::Property(target, field) => ctx.write_field(&target, field, value),
            Location::Element(container, index) => ctx.heap.set_element(&container, index, value),
            Location::Alias(inner) => inner.store(ctx, value),
        }
    }

    /// Detach a register-backed cell from its frame, keeping the register's current
    /// value. Other variants are left untouched.
    pub fn dereference(&self, ctx: &ContextState) {
        let location = match &*self.backing() {
            Backing::Register { frame, reg } => (*frame, *reg),
            _ => return,
        };
        let value = ctx.frames.get(location.0).and_then(|f| f.get(location.1).cloned());
        self.detach(value);
    }

    pub(crate) fn detach(&self, value: Option<Val>) {
        let mut backing = self.backing();
        if matches!(*backing, Backing::Register { .. }) {
            *backing = Backing::Direct(value);
        }
    }
}

impl<'a> Exec<'a> {
    /// Apply a compound operator to `cell`, delivering the expression result to `ret`.
    ///
    /// A class method named after the operator (`"+="`, `"++"`, ...) on the current
    /// value takes precedence; its result is stored back into the cell. Otherwise the
    /// generic path reads, applies the numeric operator and writes.
    pub fn var_op(&mut self, cell: Reference, op: CompoundOp, arg: Option<Val>, ret: ReturnTo) -> Step {
        if !cell.is_mutable() {
            return Step::Exception(Exception::read_only());
        }
        let current = match cell.peek(self.ctx) {
            Ok(Some(v)) => v,
            Ok(None) => return Step::Block,
            Err(e) => return Step::Exception(e),
        };
        let (bin, operand) = match op.operand(arg) {
            Ok(pair) => pair,
            Err(e) => return Step::Exception(e),
        };

        if let Val::Object(obj) = &current
            && let Some(chain) = obj.class().method(op.override_name())
        {
            let args: Vec<Val> = operand.into_iter().collect();
            let step = Callable::method(chain.clone()).invoke(self, Some(current.clone()), args, ReturnTo::Stack);
            let finish: Continuation = Box::new(move |exec: &mut Exec<'_>| {
                let result = exec.frame_mut().ok().and_then(|f| f.pop()).unwrap_or_default();
                if let Err(e) = cell.store(exec.ctx, result.clone()) {
                    return Step::Exception(e);
                }
                let value = if op.is_post() { current } else { result };
                exec.deliver_step(&ret, vec![value])
            });
            return self.then(step, finish);
        }

        let operand = operand.unwrap_or(Val::Int(1));
        let next = match numeric::apply(bin, &current, &operand) {
            Ok(v) => v,
            Err(e) => return Step::Exception(e),
        };
        if let Err(e) = cell.store(self.ctx, next.clone()) {
            return Step::Exception(e);
        }
        let value = if op.is_post() { current } else { next };
        self.deliver_step(&ret, vec![value])
    }
}
