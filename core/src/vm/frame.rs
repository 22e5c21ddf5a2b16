use std::fmt;
use std::sync::Arc;

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::Val;

use super::{DispatchChain, Exec, MethodBody, Reference, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}.{}", self.index, self.generation)
    }
}

/// Work to run in the caller once a callee's results have been delivered.
pub type Continuation = Box<dyn FnOnce(&mut Exec<'_>) -> Step + Send>;

/// Host-implemented frame body, driven one step at a time.
///
/// `index` is the frame's program counter at the time of the step; it advances by one
/// after every step except `Repeat`, which re-runs the same index.
pub trait Procedure: Send {
    fn name(&self) -> &str;
    fn step(&mut self, exec: &mut Exec<'_>, index: usize) -> Step;
}

pub enum Code {
    Ops(Arc<MethodBody>),
    Procedure(Box<dyn Procedure>),
    /// Placeholder while a procedure is stepping.
    Busy,
}

impl Code {
    pub fn name(&self) -> &str {
        match self {
            Code::Ops(body) => &body.name,
            Code::Procedure(p) => p.name(),
            Code::Busy => "<busy>",
        }
    }
}

/// Destination of a frame's return values in its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnTo {
    Ignore,
    Register(u16),
    /// All return values packed into one tuple.
    Tuple(u16),
    Registers(Arc<[u16]>),
    /// Push the first value onto the caller's evaluation stack.
    Stack,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Guard {
    pub(crate) catch: usize,
    pub(crate) dst: u16,
}

pub struct Frame {
    pub(crate) caller: Option<FrameId>,
    pub(crate) code: Code,
    pub(crate) chain: Option<(Arc<DispatchChain>, usize)>,
    pub(crate) target: Option<Val>,
    pub(crate) regs: Vec<Option<Val>>,
    /// Canonical reference cell per captured register.
    pub(crate) refs: FastHashMap<u16, Reference>,
    pub(crate) stack: Vec<Val>,
    pub(crate) pc: usize,
    pub(crate) ret: ReturnTo,
    pub(crate) continuation: Option<Continuation>,
    pub(crate) guards: Vec<Guard>,
    pub(crate) returning: Vec<Val>,
    pub(crate) depth: usize,
}

impl Frame {
    pub fn new(code: Code, regs: usize, ret: ReturnTo) -> Self {
        Self {
            caller: None,
            code,
            chain: None,
            target: None,
            regs: vec![None; regs],
            refs: fast_hash_map_new(),
            stack: Vec::new(),
            pc: 0,
            ret,
            continuation: None,
            guards: Vec::new(),
            returning: Vec::new(),
            depth: 0,
        }
    }

    pub fn caller(&self) -> Option<FrameId> {
        self.caller
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn target(&self) -> Option<&Val> {
        self.target.as_ref()
    }

    pub fn get(&self, reg: u16) -> Option<&Val> {
        self.regs.get(reg as usize).and_then(Option::as_ref)
    }

    pub fn set(&mut self, reg: u16, value: Val) {
        let idx = reg as usize;
        if idx >= self.regs.len() {
            self.regs.resize(idx + 1, None);
        }
        self.regs[idx] = Some(value);
    }

    pub fn push(&mut self, value: Val) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Val> {
        self.stack.pop()
    }

    /// Register work to run in the caller after this frame returns. A second
    /// registration runs after the first.
    pub fn add_continuation(&mut self, next: Continuation) {
        self.continuation = Some(match self.continuation.take() {
            None => next,
            Some(first) => Box::new(move |exec: &mut Exec<'_>| match first(exec) {
                Step::Proceed => next(exec),
                Step::Call(child) => exec.add_continuation(child, next),
                other => other,
            }),
        });
    }

    pub fn describe(&self) -> String {
        match &self.chain {
            Some((_, depth)) if *depth > 0 => format!("{}@{} pc={}", self.code.name(), depth, self.pc),
            _ => format!("{} pc={}", self.code.name(), self.pc),
        }
    }
}

struct Slot {
    generation: u32,
    frame: Option<Frame>,
}

/// Per-context frame storage addressed by generation-checked ids.
#[derive(Default)]
pub struct FrameArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn insert(&mut self, frame: Frame) -> FrameId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.frame = Some(frame);
            return FrameId { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, frame: Some(frame) });
        FrameId { index, generation: 0 }
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.frame.as_ref())
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.frame.as_mut())
    }

    pub fn remove(&mut self, id: FrameId) -> Option<Frame> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let frame = slot.frame.take()?;
        self.free.push(id.index);
        self.live -= 1;
        Some(frame)
    }
}
