//! Execution engine
//!
//! Frames live in a per-context arena and are driven by a trampoline
//! ([`Fiber::run`]): every step returns a [`Step`] telling the driver whether to
//! continue, switch to a child frame, deliver a return, unwind, park or yield.

mod bytecode;
mod callable;
mod chain;
mod fiber;
mod frame;
mod interp;
mod invoke;
mod reference;
mod step;

pub use bytecode::*;
pub use callable::{AsyncCallable, BoundCallable, Callable, ChainLink, FullyBound, TARGET};
pub use chain::DispatchChain;
pub use fiber::{Exec, Fiber, FiberStatus};
pub(crate) use frame::Guard;
pub use frame::{Code, Continuation, Frame, FrameArena, FrameId, Procedure, ReturnTo};
pub use reference::{CompoundOp, RefKind, Reference};
pub use step::Step;

#[cfg(test)]
mod vm_test;
