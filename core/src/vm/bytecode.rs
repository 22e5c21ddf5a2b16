use std::fmt;
use std::sync::Arc;

use crate::val::{Exception, Val, numeric::BinOp};

use super::{CompoundOp, Exec};

/// Host function signature: `(exec, receiver, args)`.
pub type NativeFn = fn(&mut Exec<'_>, Option<&Val>, &[Val]) -> Result<Val, Exception>;

/// A named host function. Natives always run on the calling fiber.
///
/// Future arguments are resolved before the call unless `raw_args` is set, in which
/// case the native sees them as they are.
#[derive(Clone)]
pub struct Native {
    pub name: Arc<str>,
    pub func: NativeFn,
    pub raw_args: bool,
}

impl Native {
    pub fn new(name: &str, func: NativeFn) -> Self {
        Self {
            name: Arc::from(name),
            func,
            raw_args: false,
        }
    }

    /// A native that receives pending futures unresolved.
    pub fn raw(name: &str, func: NativeFn) -> Self {
        Self {
            raw_args: true,
            ..Self::new(name, func)
        }
    }
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native {}", self.name)
    }
}

/// Where a call's results land in the calling frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ret {
    Ignore,
    One(u16),
    Tuple(u16),
    Many(Arc<[u16]>),
}

/// Storage a reference cell is created over.
#[derive(Debug, Clone)]
pub enum RefSource {
    /// A local register of the executing frame.
    Register(u16),
    Field { obj: u16, field: Arc<str> },
    Element { arr: u16, idx: u16 },
    /// A standalone cell seeded from a register (unassigned when `None`).
    Direct(Option<u16>),
}

/// Register bytecode executed by interpreted frames.
#[derive(Debug, Clone)]
pub enum Op {
    LoadK { dst: u16, k: u16 },
    Move { dst: u16, src: u16 },
    LoadThis { dst: u16 },
    Arith { op: BinOp, dst: u16, l: u16, r: u16 },
    Jmp { to: usize },
    JmpIfFalse { cond: u16, to: usize },
    Call { func: u16, args: Arc<[u16]>, ret: Ret },
    Invoke { target: u16, method: Arc<str>, args: Arc<[u16]>, ret: Ret },
    /// Continue with the next body of the executing dispatch chain.
    CallNext { args: Arc<[u16]>, ret: Ret },
    New { dst: u16, class: Arc<str>, args: Arc<[u16]> },
    NewService { dst: u16, class: Arc<str>, args: Arc<[u16]> },
    NewArray { dst: u16, items: Arc<[u16]> },
    GetField { dst: u16, obj: u16, field: Arc<str> },
    SetField { obj: u16, field: Arc<str>, src: u16 },
    GetElem { dst: u16, arr: u16, idx: u16 },
    SetElem { arr: u16, idx: u16, src: u16 },
    MakeRef { dst: u16, source: RefSource, mutable: bool },
    RefGet { dst: u16, r: u16 },
    RefSet { r: u16, src: u16 },
    VarOp { r: u16, op: CompoundOp, arg: Option<u16>, dst: Option<u16> },
    /// Bind `value` at argument `index`; `-1` binds the receiver.
    Bind { dst: u16, func: u16, index: i16, value: u16 },
    BindTarget { dst: u16, func: u16, value: u16 },
    Await { dst: u16, src: u16 },
    Yield,
    Throw { src: u16 },
    /// Install a handler: an exception raised until the matching `GuardEnd` lands in
    /// `dst` and execution resumes at `catch`.
    GuardStart { catch: usize, dst: u16 },
    GuardEnd,
    Return { regs: Arc<[u16]> },
}

pub enum BodyCode {
    Ops(Vec<Op>),
    Native(NativeFn),
}

impl fmt::Debug for BodyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyCode::Ops(ops) => write!(f, "Ops({})", ops.len()),
            BodyCode::Native(_) => write!(f, "Native"),
        }
    }
}

/// Executable body of a function, method or constructor.
#[derive(Debug)]
pub struct MethodBody {
    pub name: Arc<str>,
    pub params: u16,
    pub regs: u16,
    pub consts: Vec<Val>,
    pub code: BodyCode,
}

impl MethodBody {
    pub fn native(name: &str, params: u16, func: NativeFn) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(name),
            params,
            regs: params,
            consts: Vec::new(),
            code: BodyCode::Native(func),
        })
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self.code, BodyCode::Native(_))
    }

    #[inline]
    pub fn ops(&self) -> &[Op] {
        match &self.code {
            BodyCode::Ops(ops) => ops,
            BodyCode::Native(_) => &[],
        }
    }
}

/// Incremental builder for interpreted bodies.
///
/// Registers `0..params` hold the arguments; [`BodyBuilder::reg`] hands out the rest.
pub struct BodyBuilder {
    name: Arc<str>,
    params: u16,
    next_reg: u16,
    consts: Vec<Val>,
    code: Vec<Op>,
}

impl BodyBuilder {
    pub fn new(name: &str, params: u16) -> Self {
        Self {
            name: Arc::from(name),
            params,
            next_reg: params,
            consts: Vec::new(),
            code: Vec::new(),
        }
    }

    pub fn reg(&mut self) -> u16 {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    pub fn konst(&mut self, value: impl Into<Val>) -> u16 {
        self.consts.push(value.into());
        (self.consts.len() - 1) as u16
    }

    /// Allocate a register and load `value` into it.
    pub fn load(&mut self, value: impl Into<Val>) -> u16 {
        let k = self.konst(value);
        let dst = self.reg();
        self.emit(Op::LoadK { dst, k });
        dst
    }

    pub fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Point the jump or guard emitted at `at` to `to`.
    pub fn patch(&mut self, at: usize, to: usize) {
        match self.code.get_mut(at) {
            Some(Op::Jmp { to: t }) | Some(Op::JmpIfFalse { to: t, .. }) => *t = to,
            Some(Op::GuardStart { catch, .. }) => *catch = to,
            _ => {}
        }
    }

    pub fn ret(&mut self, regs: &[u16]) -> usize {
        self.emit(Op::Return { regs: Arc::from(regs) })
    }

    pub fn build(self) -> Arc<MethodBody> {
        Arc::new(MethodBody {
            name: self.name,
            params: self.params,
            regs: self.next_reg,
            consts: self.consts,
            code: BodyCode::Ops(self.code),
        })
    }
}

/// Shorthand for register lists in ops.
pub fn regs(list: &[u16]) -> Arc<[u16]> {
    Arc::from(list)
}
