use std::sync::Arc;
use std::time::Instant;

use super::{ContextHandle, FutureHandle, ServiceHandle};
use crate::val::{ClassInfo, Exception, ObjectRef, Val};
use crate::vm::{Callable, Exec, Procedure, ReturnTo, Step};

/// Result shape a requester expects from an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    /// Fire and forget; no future is created.
    None,
    One,
    /// All results packed into one tuple.
    Tuple,
    /// `n` results, each observable through its own derived future.
    Many(usize),
}

impl Returns {
    pub(crate) fn for_return(ret: &ReturnTo) -> Self {
        match ret {
            ReturnTo::Ignore => Returns::None,
            ReturnTo::Register(_) | ReturnTo::Stack => Returns::One,
            ReturnTo::Tuple(_) => Returns::Tuple,
            ReturnTo::Registers(regs) => Returns::Many(regs.len()),
        }
    }

    fn destination(&self) -> ReturnTo {
        match self {
            Returns::None => ReturnTo::Ignore,
            Returns::One => ReturnTo::Register(0),
            Returns::Tuple => ReturnTo::Tuple(0),
            Returns::Many(n) => ReturnTo::Registers((0..*n as u16).collect::<Vec<_>>().into()),
        }
    }
}

#[derive(Debug)]
pub enum RequestKind {
    Invoke {
        callable: Callable,
        target: Option<Val>,
        args: Vec<Val>,
        returns: Returns,
    },
    GetProperty {
        target: ObjectRef,
        field: u16,
    },
    SetProperty {
        target: ObjectRef,
        field: u16,
        value: Val,
    },
    Construct {
        class: Arc<ClassInfo>,
        args: Vec<Val>,
        /// Mailbox of the freshly spawned context the object is constructed in.
        context: ContextHandle,
    },
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Invoke { .. } => "invoke",
            RequestKind::GetProperty { .. } => "get-property",
            RequestKind::SetProperty { .. } => "set-property",
            RequestKind::Construct { .. } => "construct",
        }
    }
}

/// A message in a context's mailbox.
#[derive(Debug)]
pub struct Request {
    pub(crate) kind: RequestKind,
    pub(crate) reply: Option<FutureHandle>,
    pub(crate) deadline: Option<Instant>,
}

enum Collect {
    Nothing,
    Results(Returns),
    Service(ContextHandle),
}

fn reg(exec: &Exec<'_>, r: u16) -> Val {
    exec.frame().ok().and_then(|f| f.get(r).cloned()).unwrap_or_default()
}

/// Root frame of a fiber serving one request.
pub(crate) struct RequestProc {
    kind: Option<RequestKind>,
    collect: Collect,
}

impl RequestProc {
    pub(crate) fn new(kind: RequestKind) -> Self {
        Self {
            kind: Some(kind),
            collect: Collect::Nothing,
        }
    }

    fn start(&mut self, exec: &mut Exec<'_>, kind: RequestKind) -> Step {
        match kind {
            RequestKind::Invoke {
                callable,
                target,
                args,
                returns,
            } => {
                self.collect = Collect::Results(returns);
                callable.invoke(exec, target, args, returns.destination())
            }
            RequestKind::GetProperty { target, field } => match exec.context().read_field(&target, field) {
                Ok(v) => exec.return_values(vec![v]),
                Err(e) => Step::Exception(e),
            },
            RequestKind::SetProperty { target, field, value } => {
                match exec.context_mut().write_field(&target, field, value) {
                    Ok(()) => exec.return_values(Vec::new()),
                    Err(e) => Step::Exception(e),
                }
            }
            RequestKind::Construct { class, args, context } => {
                self.collect = Collect::Service(context);
                exec.construct(class, args, ReturnTo::Register(0))
            }
        }
    }
}

impl Procedure for RequestProc {
    fn name(&self) -> &str {
        "request"
    }

    fn step(&mut self, exec: &mut Exec<'_>, index: usize) -> Step {
        if index == 0 {
            return match self.kind.take() {
                Some(kind) => self.start(exec, kind),
                None => Step::Exception(Exception::internal("request started twice")),
            };
        }
        let values = match &self.collect {
            Collect::Nothing | Collect::Results(Returns::None) => Vec::new(),
            Collect::Results(Returns::One | Returns::Tuple) => vec![reg(exec, 0)],
            Collect::Results(Returns::Many(n)) => {
                let items = (0..*n as u16).map(|r| reg(exec, r)).collect();
                vec![Val::tuple(items)]
            }
            Collect::Service(context) => match reg(exec, 0) {
                Val::Object(object) => vec![Val::Service(ServiceHandle::new(context.clone(), object))],
                other => {
                    return Step::Exception(Exception::internal(format!(
                        "constructor produced {}",
                        other.type_name()
                    )));
                }
            },
        };
        exec.return_values(values)
    }
}
