use std::sync::Arc;

use super::MethodBody;

/// Ordered method bodies for one method name, most-derived first.
///
/// Chains are immutable; the position being executed is a depth cursor carried by
/// frames and chain callables.
#[derive(Debug)]
pub struct DispatchChain {
    name: Arc<str>,
    bodies: Vec<Arc<MethodBody>>,
}

impl DispatchChain {
    pub fn new(name: Arc<str>, bodies: Vec<Arc<MethodBody>>) -> Self {
        Self { name, bodies }
    }

    pub fn single(body: Arc<MethodBody>) -> Arc<Self> {
        Arc::new(Self::new(body.name.clone(), vec![body]))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.bodies.len()
    }

    pub fn bodies(&self) -> &[Arc<MethodBody>] {
        &self.bodies
    }

    pub fn body(&self, depth: usize) -> Option<&Arc<MethodBody>> {
        self.bodies.get(depth)
    }

    pub fn top(&self) -> Option<&Arc<MethodBody>> {
        self.bodies.first()
    }

    /// Depth of the next body after `depth`, if there is one.
    pub fn super_of(&self, depth: usize) -> Option<usize> {
        let next = depth + 1;
        (next < self.bodies.len()).then_some(next)
    }

    pub fn is_native(&self, depth: usize) -> bool {
        self.body(depth).is_some_and(|b| b.is_native())
    }
}
