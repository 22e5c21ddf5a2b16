use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::rt::{Completion, ContextId, ContextState, FutureHandle};
use crate::val::{Exception, ExceptionKind, Val};

use super::{Code, Frame, FrameId, Step};

/// Result of running a fiber for one slice.
#[derive(Debug)]
pub enum FiberStatus {
    Done(Completion),
    /// Waiting on a future; re-run after a wake-up.
    Parked,
    /// Voluntarily gave up the context (explicit yield or step budget).
    Yielded,
}

/// A logical thread of execution inside one context.
///
/// The fiber only holds the id of its current frame; frames themselves live in the
/// context's arena and link to their callers.
#[derive(Debug)]
pub struct Fiber {
    id: u64,
    current: Option<FrameId>,
    deadline: Option<Instant>,
    pub(crate) reply: Option<FutureHandle>,
}

impl Fiber {
    pub fn new(id: u64, root: FrameId, deadline: Option<Instant>) -> Self {
        Self {
            id,
            current: Some(root),
            deadline,
            reply: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn current(&self) -> Option<FrameId> {
        self.current
    }

    /// Run until the fiber finishes, suspends, or spends its step budget.
    pub fn run(&mut self, ctx: &mut ContextState) -> FiberStatus {
        let budget = ctx.config().step_budget.max(1);
        let max_depth = ctx.config().max_frame_depth;
        let mut exec = Exec { ctx, fiber: self };
        for _ in 0..budget {
            let step = exec.step_current();
            if let Some(status) = exec.settle(step, max_depth) {
                return status;
            }
        }
        trace!(fiber = exec.fiber.id, "step budget spent");
        FiberStatus::Yielded
    }
}

/// The (context, fiber) pair a step executes against.
pub struct Exec<'a> {
    pub(crate) ctx: &'a mut ContextState,
    pub(crate) fiber: &'a mut Fiber,
}

enum Finished {
    Fiber(Completion),
    Caller(Step),
}

impl<'a> Exec<'a> {
    pub fn new(ctx: &'a mut ContextState, fiber: &'a mut Fiber) -> Self {
        Self { ctx, fiber }
    }

    pub fn context_id(&self) -> ContextId {
        self.ctx.id()
    }

    pub fn context(&self) -> &ContextState {
        self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ContextState {
        self.ctx
    }

    pub fn fiber_id(&self) -> u64 {
        self.fiber.id
    }

    pub fn current_id(&self) -> Result<FrameId, Exception> {
        self.fiber
            .current
            .ok_or_else(|| Exception::internal("fiber has no current frame"))
    }

    pub fn frame(&self) -> Result<&Frame, Exception> {
        let id = self.current_id()?;
        self.ctx
            .frames
            .get(id)
            .ok_or_else(|| Exception::internal(format!("{id} is not live")))
    }

    pub fn frame_mut(&mut self) -> Result<&mut Frame, Exception> {
        let id = self.current_id()?;
        self.ctx
            .frames
            .get_mut(id)
            .ok_or_else(|| Exception::internal(format!("{id} is not live")))
    }

    pub fn frame_of_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.ctx.frames.get_mut(id)
    }

    fn timed_out(&self) -> bool {
        self.fiber.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Execute one step of the current frame. The program counter is advanced before
    /// the step runs and restored when the step asks to be repeated.
    pub(crate) fn step_current(&mut self) -> Step {
        let id = match self.current_id() {
            Ok(id) => id,
            Err(e) => return Step::Exception(e),
        };
        let Some(frame) = self.ctx.frames.get_mut(id) else {
            return Step::Exception(Exception::internal(format!("{id} is not live")));
        };
        let pc = frame.pc;
        frame.pc = pc + 1;
        let step = match std::mem::replace(&mut frame.code, Code::Busy) {
            Code::Ops(body) => {
                frame.code = Code::Ops(body.clone());
                match body.ops().get(pc) {
                    Some(op) => self.exec_op(op, &body),
                    None => {
                        frame.returning.clear();
                        Step::Return
                    }
                }
            }
            Code::Procedure(mut procedure) => {
                let step = procedure.step(self, pc);
                if let Some(frame) = self.ctx.frames.get_mut(id) {
                    frame.code = Code::Procedure(procedure);
                }
                step
            }
            Code::Busy => Step::Exception(Exception::internal(format!("{id} re-entered while stepping"))),
        };
        if matches!(step, Step::Repeat)
            && let Some(frame) = self.ctx.frames.get_mut(id)
        {
            frame.pc = pc;
        }
        step
    }

    /// Act on a step outcome. Returns a status when the fiber has to stop running.
    fn settle(&mut self, mut step: Step, max_depth: usize) -> Option<FiberStatus> {
        loop {
            step = match step {
                Step::Proceed => return None,
                Step::Call(child) => {
                    let depth = self.ctx.frames.get(child).map_or(0, |f| f.depth);
                    if depth > max_depth {
                        self.fiber.current = Some(child);
                        let e = Exception::new(ExceptionKind::StackOverflow, format!("frame depth {depth}"));
                        return Some(FiberStatus::Done(Err(self.abort(e))));
                    }
                    if self.timed_out() {
                        self.discard(child);
                        Step::Exception(Exception::timeout())
                    } else {
                        self.fiber.current = Some(child);
                        return None;
                    }
                }
                Step::Return => match self.finish_frame() {
                    Finished::Fiber(result) => return Some(FiberStatus::Done(result)),
                    Finished::Caller(next) => next,
                },
                Step::Exception(e) => {
                    return self.unwind(e).map(|e| FiberStatus::Done(Err(e)));
                }
                Step::Repeat => {
                    if self.timed_out() {
                        Step::Exception(Exception::timeout())
                    } else {
                        return Some(FiberStatus::Parked);
                    }
                }
                Step::Yield => {
                    if self.timed_out() {
                        Step::Exception(Exception::timeout())
                    } else {
                        return Some(FiberStatus::Yielded);
                    }
                }
                Step::Block => Step::Exception(Exception::unassigned()),
            };
        }
    }

    /// Detach every canonical register cell of a frame that is going away.
    fn release(frame: &Frame) {
        for (reg, cell) in &frame.refs {
            cell.detach(frame.get(*reg).cloned());
        }
    }

    fn discard(&mut self, id: FrameId) {
        if let Some(frame) = self.ctx.frames.remove(id) {
            Self::release(&frame);
        }
    }

    fn finish_frame(&mut self) -> Finished {
        let id = match self.current_id() {
            Ok(id) => id,
            Err(e) => return Finished::Fiber(Err(e)),
        };
        let Some(mut frame) = self.ctx.frames.remove(id) else {
            return Finished::Fiber(Err(Exception::internal(format!("{id} is not live"))));
        };
        Self::release(&frame);
        let values = std::mem::take(&mut frame.returning);
        match frame.caller {
            None => {
                self.fiber.current = None;
                let value = match values.len() {
                    0 => Val::Nil,
                    1 => values.into_iter().next().unwrap_or_default(),
                    _ => Val::tuple(values),
                };
                Finished::Fiber(Ok(value))
            }
            Some(caller) => {
                self.fiber.current = Some(caller);
                if let Err(e) = self.deliver(&frame.ret, values) {
                    return Finished::Caller(Step::Exception(e));
                }
                match frame.continuation.take() {
                    Some(k) => Finished::Caller(k(self)),
                    None => Finished::Caller(Step::Proceed),
                }
            }
        }
    }

    fn backtrace(&self) -> Vec<Arc<str>> {
        let mut out = Vec::new();
        let mut cursor = self.fiber.current;
        while let Some(id) = cursor {
            let Some(frame) = self.ctx.frames.get(id) else { break };
            out.push(Arc::from(frame.describe()));
            cursor = frame.caller;
        }
        out
    }

    /// Propagate to the nearest guard. Returns the exception if it left the root frame.
    fn unwind(&mut self, mut e: Exception) -> Option<Exception> {
        if e.stack.is_empty() {
            e.stack = self.backtrace();
        }
        loop {
            let Some(id) = self.fiber.current else {
                return Some(e);
            };
            let Some(frame) = self.ctx.frames.get_mut(id) else {
                self.fiber.current = None;
                return Some(e);
            };
            if let Some(guard) = frame.guards.pop() {
                trace!(fiber = self.fiber.id, kind = %e.kind, "exception caught");
                frame.stack.clear();
                frame.pc = guard.catch;
                frame.set(guard.dst, Val::from(e));
                return None;
            }
            let caller = frame.caller;
            self.discard(id);
            self.fiber.current = caller;
            if caller.is_none() {
                return Some(e);
            }
        }
    }

    /// Tear down every frame of the fiber without running guards.
    fn abort(&mut self, mut e: Exception) -> Exception {
        if e.stack.is_empty() {
            e.stack = self.backtrace();
        }
        debug!(fiber = self.fiber.id, error = %e, "fiber aborted");
        while let Some(id) = self.fiber.current {
            self.fiber.current = self.ctx.frames.get(id).and_then(|f| f.caller);
            self.discard(id);
        }
        e
    }
}
