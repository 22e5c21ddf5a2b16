//! Runtime values.

mod class;
mod exception;
pub mod numeric;
mod object;

use std::fmt::{self, Display};
use std::sync::Arc;

pub use class::{ClassBuilder, ClassInfo, ConstructorStep, FieldInfo};
pub use exception::{Exception, ExceptionKind};
pub use object::{Heap, ObjectBody, ObjectRef};

use crate::rt::{FutureHandle, ServiceHandle};
use crate::vm::{Callable, Reference};

#[derive(Debug, Clone, Default)]
pub enum Val {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Val]>),
    Object(ObjectRef),
    Service(ServiceHandle),
    Function(Callable),
    Ref(Reference),
    /// Deferred result of a cross-context call.
    Future(FutureHandle),
    Exception(Arc<Exception>),
}

impl Val {
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Nil => "Nil",
            Val::Bool(_) => "Bool",
            Val::Int(_) => "Int",
            Val::Float(_) => "Float",
            Val::Str(_) => "Str",
            Val::Tuple(_) => "Tuple",
            Val::Object(_) => "Object",
            Val::Service(_) => "Service",
            Val::Function(_) => "Function",
            Val::Ref(_) => "Ref",
            Val::Future(_) => "Future",
            Val::Exception(_) => "Exception",
        }
    }

    pub fn tuple(items: Vec<Val>) -> Val {
        Val::Tuple(Arc::from(items))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Val::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Val::Nil | Val::Bool(false))
    }

    /// Whether the value may be handed to another context as is.
    ///
    /// Context-private state (heap objects and reference cells) may not cross; service
    /// handles, functions, futures and primitives may.
    pub fn check_pass_through(&self) -> Result<(), Exception> {
        match self {
            Val::Object(obj) => Err(Exception::mutable_object(&obj.class().name)),
            Val::Ref(_) => Err(Exception::mutable_object("Ref")),
            Val::Tuple(items) => items.iter().try_for_each(Val::check_pass_through),
            Val::Function(f) => f.check_pass_through(),
            _ => Ok(()),
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Nil, Val::Nil) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => (*a as f64) == *b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Tuple(a), Val::Tuple(b)) => a == b,
            (Val::Object(a), Val::Object(b)) => a.same(b),
            (Val::Service(a), Val::Service(b)) => a.same(b),
            (Val::Ref(a), Val::Ref(b)) => Reference::ptr_eq(a, b),
            (Val::Future(a), Val::Future(b)) => a.ptr_eq(b),
            (Val::Exception(a), Val::Exception(b)) => a.kind == b.kind && a.message == b.message,
            _ => false,
        }
    }
}

impl Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nil => write!(f, "nil"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Int(i) => write!(f, "{i}"),
            Val::Float(x) => write!(f, "{x}"),
            Val::Str(s) => write!(f, "{s}"),
            Val::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Val::Object(obj) => write!(f, "{obj:?}"),
            Val::Service(svc) => write!(f, "service {}", svc.name()),
            Val::Function(c) => write!(f, "fn {}", c.name()),
            Val::Ref(r) => write!(f, "ref<{:?}>", r.kind()),
            Val::Future(fut) => {
                if fut.is_pending() {
                    write!(f, "future<pending>")
                } else {
                    write!(f, "future<done>")
                }
            }
            Val::Exception(e) => write!(f, "{e}"),
        }
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(i: i64) -> Self {
        Val::Int(i)
    }
}

impl From<f64> for Val {
    #[inline]
    fn from(x: f64) -> Self {
        Val::Float(x)
    }
}

impl From<bool> for Val {
    #[inline]
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

impl From<&str> for Val {
    #[inline]
    fn from(s: &str) -> Self {
        Val::Str(Arc::from(s))
    }
}

impl From<String> for Val {
    #[inline]
    fn from(s: String) -> Self {
        Val::Str(Arc::from(s))
    }
}

impl From<Exception> for Val {
    fn from(e: Exception) -> Self {
        Val::Exception(Arc::new(e))
    }
}

impl From<Callable> for Val {
    fn from(c: Callable) -> Self {
        Val::Function(c)
    }
}
