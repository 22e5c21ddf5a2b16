use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::{ClassInfo, Exception, Val};
use crate::rt::ContextId;

/// Handle to an object living in one context's heap.
///
/// Non-atomic state is only reachable through the owning context's [`Heap`];
/// atomic fields are shared through `atomics`.
#[derive(Clone)]
pub struct ObjectRef {
    context: ContextId,
    slot: u32,
    class: Arc<ClassInfo>,
    atomics: Arc<DashMap<u16, Val>>,
}

impl ObjectRef {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn class(&self) -> &Arc<ClassInfo> {
        &self.class
    }

    pub fn same(&self, other: &ObjectRef) -> bool {
        self.context == other.context && self.slot == other.slot
    }

    pub(crate) fn atomic(&self, field: u16) -> Option<Val> {
        self.atomics.get(&field).map(|v| v.value().clone())
    }

    pub(crate) fn set_atomic(&self, field: u16, value: Val) {
        self.atomics.insert(field, value);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.class.name, self.slot, self.context)
    }
}

#[derive(Debug)]
pub enum ObjectBody {
    Fields(Vec<Option<Val>>),
    Array(Vec<Val>),
}

/// Private object store of one context. Objects are never collected; they live until
/// the context is torn down.
#[derive(Debug)]
pub struct Heap {
    context: ContextId,
    objects: Vec<ObjectBody>,
}

impl Heap {
    pub fn new(context: ContextId) -> Self {
        Self { context, objects: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn push(&mut self, class: Arc<ClassInfo>, body: ObjectBody) -> ObjectRef {
        let slot = self.objects.len() as u32;
        self.objects.push(body);
        ObjectRef {
            context: self.context,
            slot,
            class,
            atomics: Arc::new(DashMap::new()),
        }
    }

    pub fn alloc(&mut self, class: Arc<ClassInfo>) -> ObjectRef {
        let fields = vec![None; class.fields.len()];
        self.push(class, ObjectBody::Fields(fields))
    }

    pub fn alloc_array(&mut self, class: Arc<ClassInfo>, items: Vec<Val>) -> ObjectRef {
        self.push(class, ObjectBody::Array(items))
    }

    fn body(&self, obj: &ObjectRef) -> Result<&ObjectBody, Exception> {
        if obj.context != self.context {
            return Err(Exception::cross_context(&obj.class.name));
        }
        self.objects
            .get(obj.slot as usize)
            .ok_or_else(|| Exception::internal(format!("dangling object {obj:?}")))
    }

    fn body_mut(&mut self, obj: &ObjectRef) -> Result<&mut ObjectBody, Exception> {
        if obj.context != self.context {
            return Err(Exception::cross_context(&obj.class.name));
        }
        self.objects
            .get_mut(obj.slot as usize)
            .ok_or_else(|| Exception::internal(format!("dangling object {obj:?}")))
    }

    /// `Ok(None)` for a field that has not been assigned yet.
    pub fn field(&self, obj: &ObjectRef, field: u16) -> Result<Option<Val>, Exception> {
        match self.body(obj)? {
            ObjectBody::Fields(fields) => fields
                .get(field as usize)
                .cloned()
                .ok_or_else(|| Exception::no_such_field(&obj.class.name, &format!("#{field}"))),
            ObjectBody::Array(_) => Err(Exception::type_mismatch("array has no fields")),
        }
    }

    pub fn set_field(&mut self, obj: &ObjectRef, field: u16, value: Val) -> Result<(), Exception> {
        let class = obj.class.name.clone();
        match self.body_mut(obj)? {
            ObjectBody::Fields(fields) => match fields.get_mut(field as usize) {
                Some(slot) => {
                    *slot = Some(value);
                    Ok(())
                }
                None => Err(Exception::no_such_field(&class, &format!("#{field}"))),
            },
            ObjectBody::Array(_) => Err(Exception::type_mismatch("array has no fields")),
        }
    }

    pub fn element(&self, obj: &ObjectRef, index: usize) -> Result<Val, Exception> {
        match self.body(obj)? {
            ObjectBody::Array(items) => items.get(index).cloned().ok_or_else(|| out_of_bounds(index, items.len())),
            ObjectBody::Fields(_) => Err(Exception::type_mismatch(format!("{} is not an array", obj.class.name))),
        }
    }

    pub fn set_element(&mut self, obj: &ObjectRef, index: usize, value: Val) -> Result<(), Exception> {
        let class = obj.class.name.clone();
        match self.body_mut(obj)? {
            ObjectBody::Array(items) => {
                let len = items.len();
                let slot = items.get_mut(index).ok_or_else(|| out_of_bounds(index, len))?;
                *slot = value;
                Ok(())
            }
            ObjectBody::Fields(_) => Err(Exception::type_mismatch(format!("{class} is not an array"))),
        }
    }
}

fn out_of_bounds(index: usize, len: usize) -> Exception {
    Exception::type_mismatch(format!("index {index} out of bounds for length {len}"))
}
