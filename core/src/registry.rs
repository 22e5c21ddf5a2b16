use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::{ClassInfo, Exception, Val};
use crate::vm::{Exec, Native};

/// Classes and host functions visible to every context of a runtime.
///
/// The registry is built once up front and then shared read-only, so contexts look
/// classes up without any locking.
pub struct Registry {
    natives: FastHashMap<Arc<str>, Native>,
    classes: FastHashMap<Arc<str>, Arc<ClassInfo>>,
    array_class: Arc<ClassInfo>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("natives", &self.natives.len())
            .field("classes", &self.classes.len())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry with the core natives installed
    pub fn new() -> Self {
        let mut registry = Self {
            natives: fast_hash_map_new(),
            classes: fast_hash_map_new(),
            array_class: ClassInfo::builder("Array").build(),
        };
        registry.register_core_natives();
        registry
    }

    fn register_core_natives(&mut self) {
        self.register_native(Native::new("print", native_print));
        self.register_native(Native::new("context_id", native_context_id));
        self.register_native(Native::raw("is_pending", native_is_pending));
        self.register_native(Native::new("fail", native_fail));
    }

    /// Register a host function, replacing any previous one of the same name
    pub fn register_native(&mut self, native: Native) {
        self.natives.insert(native.name.clone(), native);
    }

    pub fn register_class(&mut self, class: Arc<ClassInfo>) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            bail!("class '{}' is already registered", class.name);
        }
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassInfo>> {
        self.classes.get(name)
    }

    pub fn native(&self, name: &str) -> Option<&Native> {
        self.natives.get(name)
    }

    /// Class backing arrays created by `NewArray`.
    pub fn array_class(&self) -> &Arc<ClassInfo> {
        &self.array_class
    }

    /// Get all registered class names, sorted
    pub fn class_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

fn native_print(_exec: &mut Exec<'_>, _this: Option<&Val>, args: &[Val]) -> Result<Val, Exception> {
    let line = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
    println!("{line}");
    Ok(Val::Nil)
}

fn native_context_id(exec: &mut Exec<'_>, _this: Option<&Val>, _args: &[Val]) -> Result<Val, Exception> {
    Ok(Val::Int(exec.context_id().0 as i64))
}

/// Registered raw, so it observes futures without waiting on them.
fn native_is_pending(_exec: &mut Exec<'_>, _this: Option<&Val>, args: &[Val]) -> Result<Val, Exception> {
    match args {
        [Val::Future(future)] => Ok(Val::Bool(future.is_pending())),
        [_] => Ok(Val::Bool(false)),
        _ => Err(Exception::arity("is_pending", 1, args.len())),
    }
}

fn native_fail(_exec: &mut Exec<'_>, _this: Option<&Val>, args: &[Val]) -> Result<Val, Exception> {
    match args {
        [message] => Err(Exception::user(message.to_string())),
        _ => Err(Exception::arity("fail", 1, args.len())),
    }
}
