use std::fmt;
use std::sync::Arc;

/// Category of a VM-level exception. Every kind is catchable by a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ExceptionKind {
    #[error("exception")]
    User,
    #[error("unassigned reference")]
    UnassignedReference,
    #[error("read-only reference")]
    ReadOnly,
    #[error("arity mismatch")]
    Arity,
    #[error("mutable object")]
    MutableObject,
    #[error("cross-context access")]
    CrossContext,
    #[error("service terminated")]
    ServiceTerminated,
    #[error("timeout")]
    Timeout,
    #[error("no such method")]
    NoSuchMethod,
    #[error("no such field")]
    NoSuchField,
    #[error("no such class")]
    NoSuchClass,
    #[error("no super method")]
    NoSuperMethod,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("overflow")]
    Overflow,
    #[error("divide by zero")]
    DivideByZero,
    #[error("stack overflow")]
    StackOverflow,
    #[error("internal error")]
    Internal,
}

/// An exception raised by user code or by the VM itself.
///
/// `stack` holds frame descriptions captured when the exception first left a
/// step, innermost first.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: Arc<str>,
    pub cause: Option<Arc<Exception>>,
    pub stack: Vec<Arc<str>>,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}: {}", self.kind, self.message)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl Exception {
    pub fn new(kind: ExceptionKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            stack: Vec::new(),
        }
    }

    pub fn user(message: impl Into<Arc<str>>) -> Self {
        Self::new(ExceptionKind::User, message)
    }

    pub fn unassigned() -> Self {
        Self::new(ExceptionKind::UnassignedReference, "")
    }

    pub fn read_only() -> Self {
        Self::new(ExceptionKind::ReadOnly, "Ref cannot be assigned")
    }

    pub fn arity(name: &str, expected: usize, got: usize) -> Self {
        Self::new(
            ExceptionKind::Arity,
            format!("{name} expects {expected} argument(s), got {got}"),
        )
    }

    pub fn mutable_object(type_name: &str) -> Self {
        Self::new(
            ExceptionKind::MutableObject,
            format!("{type_name} cannot cross a service boundary"),
        )
    }

    pub fn cross_context(what: &str) -> Self {
        Self::new(ExceptionKind::CrossContext, format!("{what} belongs to another service"))
    }

    pub fn service_terminated(name: &str) -> Self {
        Self::new(ExceptionKind::ServiceTerminated, name.to_string())
    }

    pub fn timeout() -> Self {
        Self::new(ExceptionKind::Timeout, "deadline exceeded")
    }

    pub fn no_such_method(class: &str, method: &str) -> Self {
        Self::new(ExceptionKind::NoSuchMethod, format!("{class}.{method}"))
    }

    pub fn no_such_field(class: &str, field: &str) -> Self {
        Self::new(ExceptionKind::NoSuchField, format!("{class}.{field}"))
    }

    pub fn type_mismatch(message: impl Into<Arc<str>>) -> Self {
        Self::new(ExceptionKind::TypeMismatch, message)
    }

    pub fn internal(message: impl Into<Arc<str>>) -> Self {
        Self::new(ExceptionKind::Internal, message)
    }

    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn is(&self, kind: ExceptionKind) -> bool {
        self.kind == kind
    }
}
