//! Runtime scheduler and context management
//!
//! Every actor context runs as one tokio task. The runtime owns the tokio
//! runtime, spawns contexts on demand and gives host code a blocking facade for
//! constructing services, sending them requests and waiting on the results.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::context::{ContextState, ContextTask};
use super::request::{RequestKind, Returns};
use super::{Completion, ContextHandle, ContextId, FutureHandle, RuntimeConfig, ServiceHandle};
use crate::registry::Registry;
use crate::val::{Exception, Val};
use crate::vm::Callable;

/// Counters shared by every context of a runtime.
#[derive(Debug, Default)]
pub struct StatsCounters {
    contexts_spawned: AtomicU64,
    live_contexts: AtomicU64,
    futures_created: AtomicU64,
    requests_sent: AtomicU64,
    fibers_completed: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn context_spawned(&self) {
        self.contexts_spawned.fetch_add(1, Ordering::Relaxed);
        self.live_contexts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn context_stopped(&self) {
        self.live_contexts.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn future_created(&self) {
        self.futures_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fiber_completed(&self) {
        self.fibers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn futures_created(&self) -> u64 {
        self.futures_created.load(Ordering::Relaxed)
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    fn snapshot(&self, is_multi_threaded: bool) -> RuntimeStats {
        RuntimeStats {
            contexts_spawned: self.contexts_spawned.load(Ordering::Relaxed),
            live_contexts: self.live_contexts.load(Ordering::Relaxed),
            futures_created: self.futures_created.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            fibers_completed: self.fibers_completed.load(Ordering::Relaxed),
            is_multi_threaded,
        }
    }
}

/// Runtime statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub contexts_spawned: u64,
    pub live_contexts: u64,
    pub futures_created: u64,
    pub requests_sent: u64,
    pub fibers_completed: u64,
    pub is_multi_threaded: bool,
}

/// State shared between the runtime and all of its contexts.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: RuntimeConfig,
    pub(crate) stats: StatsCounters,
    handle: Option<tokio::runtime::Handle>,
    next_context: AtomicU64,
    next_fiber: AtomicU64,
}

impl Shared {
    pub(crate) fn new(registry: Arc<Registry>, config: RuntimeConfig, handle: Option<tokio::runtime::Handle>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            stats: StatsCounters::default(),
            handle,
            next_context: AtomicU64::new(1),
            next_fiber: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_fiber_id(&self) -> u64 {
        self.next_fiber.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a fresh context task and return its mailbox.
    pub(crate) fn spawn_context(self: &Arc<Self>, name: &str) -> Result<ContextHandle, Exception> {
        let Some(handle) = &self.handle else {
            return Err(Exception::internal(format!("cannot spawn {name} without a running runtime")));
        };
        let id = self.next_context_id();
        let name: Arc<str> = Arc::from(name);
        let (sender, mailbox) = mpsc::unbounded_channel();
        let state = ContextState::new(id, name.clone(), self.clone());
        self.stats.context_spawned();
        handle.spawn(ContextTask::new(state, mailbox).run());
        debug!(context = %id, name = %name, "context spawned");
        Ok(ContextHandle::new(id, name, sender))
    }
}

/// Host-side entry point: owns the tokio runtime the contexts run on.
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<Shared>,
    tokio_runtime: Option<tokio::runtime::Runtime>,
}

impl Runtime {
    /// Create a runtime as `config` asks, falling back to a current-thread
    /// runtime when a multi-thread one cannot be built.
    pub fn new(config: RuntimeConfig, registry: Arc<Registry>) -> Result<Self> {
        if config.single_thread {
            return Self::new_current_thread(config, registry);
        }
        match Self::new_multi_thread(config.clone(), registry.clone()) {
            Ok(runtime) => Ok(runtime),
            Err(err) => {
                let err_msg = err.to_string();
                Self::new_current_thread(config, registry).map_err(|fallback_err| {
                    anyhow!(
                        "Failed to create multi-thread runtime ({}) and fallback to current-thread runtime failed ({})",
                        err_msg,
                        fallback_err
                    )
                })
            }
        }
    }

    /// Create a new multi-threaded runtime
    pub fn new_multi_thread(config: RuntimeConfig, registry: Arc<Registry>) -> Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(workers) = config.worker_threads {
            builder.worker_threads(workers.max(1));
        }
        let tokio_runtime = builder
            .enable_all()
            .build()
            .map_err(|e| anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self::with_tokio(config, registry, tokio_runtime))
    }

    /// Create a new current-thread runtime; contexts only make progress inside
    /// [`Runtime::block_on`] and the blocking helpers built on it.
    pub fn new_current_thread(config: RuntimeConfig, registry: Arc<Registry>) -> Result<Self> {
        let tokio_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self::with_tokio(config, registry, tokio_runtime))
    }

    fn with_tokio(config: RuntimeConfig, registry: Arc<Registry>, tokio_runtime: tokio::runtime::Runtime) -> Self {
        let flavor = tokio_runtime.handle().runtime_flavor();
        info!(?flavor, classes = registry.class_names().len(), "runtime started");
        Self {
            shared: Shared::new(registry, config, Some(tokio_runtime.handle().clone())),
            tokio_runtime: Some(tokio_runtime),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    fn tokio(&self) -> Result<&tokio::runtime::Runtime> {
        self.tokio_runtime.as_ref().context("runtime already shut down")
    }

    /// Construct a service of class `class` in a new context. The future
    /// completes with the service handle once every constructor has run.
    pub fn construct(&self, class: &str, args: Vec<Val>) -> Result<FutureHandle> {
        let class = self
            .shared
            .registry
            .class(class)
            .cloned()
            .with_context(|| format!("unknown class {class}"))?;
        for arg in &args {
            arg.check_pass_through()?;
        }
        let context = self.shared.spawn_context(&class.name)?;
        let reply = self.new_future();
        context.post(
            RequestKind::Construct {
                class,
                args,
                context: context.clone(),
            },
            Some(reply.clone()),
            None,
            &self.shared.stats,
        )?;
        Ok(reply)
    }

    /// Invoke `method` on `service`. `Returns::None` sends the request without
    /// creating a future.
    pub fn invoke(
        &self,
        service: &ServiceHandle,
        method: &str,
        args: Vec<Val>,
        returns: Returns,
    ) -> Result<Option<FutureHandle>> {
        let object = service.object();
        let chain = object
            .class()
            .method(method)
            .cloned()
            .ok_or_else(|| Exception::no_such_method(service.name(), method))?;
        for arg in &args {
            arg.check_pass_through()?;
        }
        let reply = (returns != Returns::None).then(|| self.new_future());
        let kind = RequestKind::Invoke {
            callable: Callable::method(chain),
            target: Some(Val::Object(object.clone())),
            args,
            returns,
        };
        service.context().post(kind, reply.clone(), None, &self.shared.stats)?;
        Ok(reply)
    }

    /// Invoke `method` and wait for its single result.
    pub fn call(&self, service: &ServiceHandle, method: &str, args: Vec<Val>) -> Result<Val> {
        let future = self
            .invoke(service, method, args, Returns::One)?
            .context("invocation produced no future")?;
        self.wait(&future)
    }

    /// Read a service property. Atomic fields are read in place.
    pub fn get_property(&self, service: &ServiceHandle, field: &str) -> Result<FutureHandle> {
        let object = service.object();
        let index = object
            .class()
            .field_index(field)
            .ok_or_else(|| Exception::no_such_field(service.name(), field))?;
        let reply = self.new_future();
        if object.class().is_atomic(index) {
            let value = object
                .atomic(index)
                .ok_or_else(|| Exception::unassigned().with_cause(Exception::no_such_field(service.name(), field)));
            reply.complete(value);
            return Ok(reply);
        }
        let kind = RequestKind::GetProperty {
            target: object.clone(),
            field: index,
        };
        service.context().post(kind, Some(reply.clone()), None, &self.shared.stats)?;
        Ok(reply)
    }

    pub fn set_property(&self, service: &ServiceHandle, field: &str, value: Val) -> Result<()> {
        let object = service.object();
        let index = object
            .class()
            .field_index(field)
            .ok_or_else(|| Exception::no_such_field(service.name(), field))?;
        value.check_pass_through()?;
        if object.class().is_atomic(index) {
            object.set_atomic(index, value);
            return Ok(());
        }
        let kind = RequestKind::SetProperty {
            target: object.clone(),
            field: index,
            value,
        };
        service.context().post(kind, None, None, &self.shared.stats)?;
        Ok(())
    }

    /// Block until `future` completes.
    pub fn wait(&self, future: &FutureHandle) -> Result<Val> {
        let completion: Completion = self.block_on(future.wait())?;
        Ok(completion?)
    }

    /// Block until every future in `futures` completes; the first failure wins.
    pub fn wait_all(&self, futures: &[FutureHandle]) -> Result<Vec<Val>> {
        let completions = self.block_on(join_all(futures.iter().map(FutureHandle::wait)))?;
        Ok(completions.into_iter().collect::<Result<Vec<Val>, Exception>>()?)
    }

    /// Block on a future using the tokio runtime
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: std::future::Future,
    {
        Ok(self.tokio()?.block_on(future))
    }

    fn new_future(&self) -> FutureHandle {
        self.shared.stats.future_created();
        FutureHandle::new()
    }

    /// Get runtime statistics
    pub fn stats(&self) -> RuntimeStats {
        let is_multi_threaded = self.tokio_runtime.as_ref().is_some_and(|rt| {
            matches!(rt.handle().runtime_flavor(), tokio::runtime::RuntimeFlavor::MultiThread)
        });
        self.shared.stats.snapshot(is_multi_threaded)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let Some(runtime) = self.tokio_runtime.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::spawn(move || drop(runtime));
        } else {
            drop(runtime);
        }
    }
}
