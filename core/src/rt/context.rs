use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use super::request::{Request, RequestKind, RequestProc};
use super::runtime::Shared;
use super::{Completion, ContextHandle, ContextId, FutureHandle, RuntimeConfig, StatsCounters};
use crate::registry::Registry;
use crate::val::{ClassInfo, Exception, Heap, ObjectRef, Val};
use crate::vm::{Callable, Code, Fiber, FiberStatus, Frame, FrameArena, Procedure, ReturnTo};

/// State owned by one actor context: its heap and frame arena.
///
/// Only the task running the context touches this state, which is what makes
/// non-atomic object fields safe without locks.
pub struct ContextState {
    id: ContextId,
    name: Arc<str>,
    pub(crate) heap: Heap,
    pub(crate) frames: FrameArena,
    shared: Arc<Shared>,
    waker: Arc<Notify>,
}

impl ContextState {
    pub(crate) fn new(id: ContextId, name: Arc<str>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            name,
            heap: Heap::new(id),
            frames: FrameArena::new(),
            shared,
            waker: Arc::new(Notify::new()),
        }
    }

    /// A context that is not attached to a running runtime. Fibers run on it with
    /// [`ContextState::run_blocking`]; it cannot spawn services.
    pub fn detached(registry: Arc<Registry>, config: RuntimeConfig) -> Self {
        let shared = Shared::new(registry, config, None);
        let id = shared.next_context_id();
        Self::new(id, Arc::from("detached"), shared)
    }

    /// Another detached context on the same registry and config, with its own id.
    pub fn detached_sibling(&self) -> Self {
        let id = self.shared.next_context_id();
        Self::new(id, Arc::from("detached"), self.shared.clone())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &StatsCounters {
        &self.shared.stats
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn live_frames(&self) -> usize {
        self.frames.live()
    }

    pub(crate) fn waker(&self) -> &Arc<Notify> {
        &self.waker
    }

    pub(crate) fn spawn_context(&self, name: &str) -> Result<ContextHandle, Exception> {
        self.shared.spawn_context(name)
    }

    pub(crate) fn new_future(&self) -> FutureHandle {
        self.shared.stats.future_created();
        FutureHandle::new()
    }

    pub fn alloc(&mut self, class: Arc<ClassInfo>) -> ObjectRef {
        self.heap.alloc(class)
    }

    /// Field value, `None` while unassigned. Atomic fields are readable from any
    /// context; the rest only from the owner.
    pub fn peek_field(&self, obj: &ObjectRef, field: u16) -> Result<Option<Val>, Exception> {
        if obj.class().is_atomic(field) {
            return Ok(obj.atomic(field));
        }
        self.heap.field(obj, field)
    }

    pub fn read_field(&self, obj: &ObjectRef, field: u16) -> Result<Val, Exception> {
        self.peek_field(obj, field)?.ok_or_else(|| {
            Exception::unassigned().with_cause(Exception::no_such_field(&obj.class().name, obj.class().field_name(field)))
        })
    }

    pub fn write_field(&mut self, obj: &ObjectRef, field: u16, value: Val) -> Result<(), Exception> {
        if obj.class().is_atomic(field) {
            value.check_pass_through()?;
            obj.set_atomic(field, value);
            return Ok(());
        }
        self.heap.set_field(obj, field, value)
    }

    /// Create a fiber whose root frame serves `kind`.
    pub fn start(&mut self, kind: RequestKind, deadline: Option<Instant>) -> Fiber {
        trace!(context = %self.id, request = kind.label(), "request accepted");
        self.start_procedure(Box::new(RequestProc::new(kind)), 1, deadline)
    }

    /// Create a fiber whose root frame runs a host procedure.
    pub fn start_procedure(&mut self, procedure: Box<dyn Procedure>, regs: usize, deadline: Option<Instant>) -> Fiber {
        let name = procedure.name().to_string();
        let root = self.frames.insert(Frame::new(Code::Procedure(procedure), regs, ReturnTo::Ignore));
        let fiber = Fiber::new(self.shared.next_fiber_id(), root, deadline);
        trace!(context = %self.id, fiber = fiber.id(), root = %name, "fiber started");
        fiber
    }

    /// Create a fiber calling `callable` with a single result.
    pub fn start_call(&mut self, callable: Callable, target: Option<Val>, args: Vec<Val>) -> Fiber {
        let kind = RequestKind::Invoke {
            callable,
            target,
            args,
            returns: super::Returns::One,
        };
        self.start(kind, None)
    }

    /// Drive `fiber` to completion on the calling thread. A fiber that parks on a
    /// future nobody can complete fails instead of hanging.
    pub fn run_blocking(&mut self, mut fiber: Fiber) -> Completion {
        loop {
            match fiber.run(self) {
                FiberStatus::Done(result) => return result,
                FiberStatus::Yielded => continue,
                FiberStatus::Parked => {
                    return Err(Exception::internal(format!(
                        "fiber {} parked on detached {}",
                        fiber.id(),
                        self.id
                    )));
                }
            }
        }
    }
}

/// The tokio task driving one context: mailbox intake and fiber scheduling.
pub(crate) struct ContextTask {
    state: ContextState,
    mailbox: mpsc::UnboundedReceiver<Request>,
    ready: VecDeque<Fiber>,
    parked: Vec<Fiber>,
    closed: bool,
}

impl ContextTask {
    pub(crate) fn new(state: ContextState, mailbox: mpsc::UnboundedReceiver<Request>) -> Self {
        Self {
            state,
            mailbox,
            ready: VecDeque::new(),
            parked: Vec::new(),
            closed: false,
        }
    }

    fn accept(&mut self, request: Request) {
        let deadline = request
            .deadline
            .or_else(|| self.state.config().default_timeout().map(|t| Instant::now() + t));
        let mut fiber = self.state.start(request.kind, deadline);
        fiber.reply = request.reply;
        self.ready.push_back(fiber);
    }

    fn complete(&mut self, fiber: Fiber, result: Completion) {
        self.state.shared.stats.fiber_completed();
        let result = result.and_then(|v| v.check_pass_through().map(|()| v));
        match (&fiber.reply, result) {
            (Some(reply), result) => {
                reply.complete(result);
            }
            (None, Err(e)) => {
                warn!(context = %self.state.id, fiber = fiber.id(), error = %e, "uncaught exception in fire-and-forget request");
            }
            (None, Ok(_)) => {}
        }
    }

    fn wake_parked(&mut self) {
        self.ready.extend(self.parked.drain(..));
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.parked.iter().filter_map(Fiber::deadline).min()
    }

    fn drain_mailbox(&mut self) {
        loop {
            match self.mailbox.try_recv() {
                Ok(request) => self.accept(request),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(context = %self.state.id, name = %self.state.name, "context started");
        let waker = self.state.waker.clone();
        loop {
            self.drain_mailbox();

            if let Some(mut fiber) = self.ready.pop_front() {
                match fiber.run(&mut self.state) {
                    FiberStatus::Done(result) => self.complete(fiber, result),
                    FiberStatus::Parked => self.parked.push(fiber),
                    FiberStatus::Yielded => self.ready.push_back(fiber),
                }
                tokio::task::yield_now().await;
                continue;
            }

            if self.closed && self.parked.is_empty() {
                break;
            }

            let deadline = self.nearest_deadline();
            tokio::select! {
                request = self.mailbox.recv(), if !self.closed => match request {
                    Some(request) => self.accept(request),
                    None => self.closed = true,
                },
                _ = waker.notified() => self.wake_parked(),
                _ = sleep_until(deadline), if deadline.is_some() => self.wake_parked(),
            }
        }
        self.state.shared.stats.context_stopped();
        debug!(context = %self.state.id, frames = self.state.frames.live(), "context stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}
