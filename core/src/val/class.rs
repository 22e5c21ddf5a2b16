use std::fmt;
use std::sync::Arc;

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::vm::{DispatchChain, MethodBody};

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: Arc<str>,
    /// Atomic fields live outside the owning context's heap and may be read or
    /// written from any context.
    pub atomic: bool,
}

/// One constructor in a class's construction sequence, with the finalizer it
/// registers once it has run.
#[derive(Debug, Clone)]
pub struct ConstructorStep {
    pub body: Arc<MethodBody>,
    pub finalizer: Option<Arc<MethodBody>>,
}

/// Pre-resolved class shape handed to the core by the type system.
pub struct ClassInfo {
    pub name: Arc<str>,
    pub fields: Vec<FieldInfo>,
    pub methods: FastHashMap<Arc<str>, Arc<DispatchChain>>,
    /// Base-first.
    pub constructors: Vec<ConstructorStep>,
    pub service: bool,
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .field("methods", &self.methods.len())
            .field("service", &self.service)
            .finish()
    }
}

impl ClassInfo {
    pub fn builder(name: &str) -> ClassBuilder {
        ClassBuilder::new(name)
    }

    pub fn field_index(&self, name: &str) -> Option<u16> {
        self.fields
            .iter()
            .position(|f| f.name.as_ref() == name)
            .map(|i| i as u16)
    }

    pub fn field_name(&self, index: u16) -> &str {
        self.fields.get(index as usize).map(|f| f.name.as_ref()).unwrap_or("?")
    }

    pub fn is_atomic(&self, index: u16) -> bool {
        self.fields.get(index as usize).is_some_and(|f| f.atomic)
    }

    pub fn method(&self, name: &str) -> Option<&Arc<DispatchChain>> {
        self.methods.get(name)
    }
}

pub struct ClassBuilder {
    name: Arc<str>,
    base: Option<Arc<ClassInfo>>,
    fields: Vec<FieldInfo>,
    methods: Vec<(Arc<str>, Arc<MethodBody>)>,
    constructors: Vec<ConstructorStep>,
    service: bool,
}

impl ClassBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            base: None,
            fields: Vec::new(),
            methods: Vec::new(),
            constructors: Vec::new(),
            service: false,
        }
    }

    /// Inherit fields, constructors and method chains from `base`. Methods declared on
    /// this builder sit in front of the base's bodies in each dispatch chain.
    pub fn extends(mut self, base: Arc<ClassInfo>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.push(FieldInfo { name: Arc::from(name), atomic: false });
        self
    }

    pub fn atomic_field(mut self, name: &str) -> Self {
        self.fields.push(FieldInfo { name: Arc::from(name), atomic: true });
        self
    }

    pub fn method(mut self, name: &str, body: Arc<MethodBody>) -> Self {
        self.methods.push((Arc::from(name), body));
        self
    }

    pub fn constructor(mut self, body: Arc<MethodBody>, finalizer: Option<Arc<MethodBody>>) -> Self {
        self.constructors.push(ConstructorStep { body, finalizer });
        self
    }

    pub fn service(mut self) -> Self {
        self.service = true;
        self
    }

    pub fn build(self) -> Arc<ClassInfo> {
        let mut fields = Vec::new();
        let mut constructors = Vec::new();
        let mut bodies: FastHashMap<Arc<str>, Vec<Arc<MethodBody>>> = fast_hash_map_new();
        let mut service = self.service;

        for (name, body) in self.methods {
            bodies.entry(name).or_default().push(body);
        }
        if let Some(base) = &self.base {
            fields.extend(base.fields.iter().cloned());
            constructors.extend(base.constructors.iter().cloned());
            service |= base.service;
            for (name, chain) in &base.methods {
                bodies
                    .entry(name.clone())
                    .or_default()
                    .extend(chain.bodies().iter().cloned());
            }
        }
        fields.extend(self.fields);
        constructors.extend(self.constructors);

        let methods = bodies
            .into_iter()
            .map(|(name, bodies)| {
                let chain = Arc::new(DispatchChain::new(name.clone(), bodies));
                (name, chain)
            })
            .collect();

        Arc::new(ClassInfo {
            name: self.name,
            fields,
            methods,
            constructors,
            service,
        })
    }
}
