//! Actor runtime: contexts, mailboxes, futures and the tokio scheduler they run on.

mod config;
mod context;
mod future;
mod request;
mod runtime;
mod service;

pub use config::{ENV_SINGLE_THREAD, ENV_TIMEOUT_MS, ENV_WORKERS, RuntimeConfig};
pub use context::ContextState;
pub use future::{Completion, FutureHandle};
pub use request::{Request, RequestKind, Returns};
pub use runtime::{Runtime, RuntimeStats, StatsCounters};
pub use service::{ContextHandle, ContextId, ServiceHandle};
