use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use super::request::{Request, RequestKind};
use super::{FutureHandle, StatsCounters};
use crate::val::{Exception, ObjectRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Sending side of a context's mailbox. A context stays alive while any handle to it
/// exists or it has live fibers.
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Request>,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

impl ContextHandle {
    pub(crate) fn new(id: ContextId, name: Arc<str>, sender: mpsc::UnboundedSender<Request>) -> Self {
        Self { id, name, sender }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn post(
        &self,
        kind: RequestKind,
        reply: Option<FutureHandle>,
        deadline: Option<Instant>,
        stats: &StatsCounters,
    ) -> Result<(), Exception> {
        let request = Request { kind, reply, deadline };
        self.sender
            .send(request)
            .map_err(|_| Exception::service_terminated(&self.name))?;
        stats.request_sent();
        Ok(())
    }
}

/// A service object together with the mailbox of the context that owns it.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    context: ContextHandle,
    object: ObjectRef,
}

impl ServiceHandle {
    pub(crate) fn new(context: ContextHandle, object: ObjectRef) -> Self {
        Self { context, object }
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn context_id(&self) -> ContextId {
        self.context.id
    }

    pub fn name(&self) -> &str {
        &self.object.class().name
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn same(&self, other: &ServiceHandle) -> bool {
        self.object.same(&other.object)
    }
}
