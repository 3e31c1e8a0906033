use ahash::AHashMap;

use crate::{
    ClassId, ContextId, Entity, FunctionId, InternedId, ModuleId, ObjectRef,
    ProcessId, TaskId,
};

/// Class-specific payload of an [`Object`].
///
/// Payload entities (array elements, tuple slots, a bound receiver) are heap
/// edges exactly like members and must only be written through the heap.
#[derive(Debug, Clone, Default)]
pub enum Internal {
    #[default]
    None,
    String(String),
    Array(Vec<Entity>),
    Tuple(Box<[Entity]>),
    Class(ClassId),
    Module(ModuleId),
    Function(FunctionId),
    FunctionRef(BoundFunction),
    Future(FutureCell),
    Task(TaskId),
    Context(ContextId),
    /// `None` until a user-created process object has been started.
    Process(Option<ProcessId>),
    Remote(RemoteRef),
}

/// A function paired with its receiver and, for anonymous functions, the
/// context it closes over.
#[derive(Debug, Clone, Copy)]
pub struct BoundFunction {
    pub function: FunctionId,
    pub receiver: Entity,
    pub capture: Option<ContextId>,
}

/// Result cell over a task of the owning process.
///
/// `memoized` flips once the task's resval has been copied into the
/// future's `value` member.
#[derive(Debug, Clone, Copy)]
pub struct FutureCell {
    pub task: TaskId,
    pub memoized: bool,
}

/// An object living in another process's heap.
#[derive(Debug, Clone, Copy)]
pub struct RemoteRef {
    pub process: ProcessId,
    pub object: ObjectRef,
}

/// Called on allocation (init) and on reclamation (delete) for built-in
/// classes with custom payloads.
pub type ObjectHook = fn(&mut Object);

#[derive(Debug, Clone)]
pub struct Object {
    class: ClassId,
    pub(crate) members: AHashMap<InternedId, Entity>,
    pub(crate) internal: Internal,
}

impl Object {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            members: AHashMap::new(),
            internal: Internal::None,
        }
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn member(&self, key: InternedId) -> Option<Entity> {
        self.members.get(&key).copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (InternedId, Entity)> + '_ {
        self.members.iter().map(|(&k, &v)| (k, v))
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn internal(&self) -> &Internal {
        &self.internal
    }

    /// Replace the payload. Only valid for payloads without entities; the
    /// heap owns every edge-carrying write.
    pub fn set_plain_internal(&mut self, internal: Internal) {
        debug_assert!(!internal.carries_entities());
        self.internal = internal;
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.internal {
            Internal::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Entity]> {
        match &self.internal {
            Internal::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Entity]> {
        match &self.internal {
            Internal::Tuple(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<FutureCell> {
        match self.internal {
            Internal::Future(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_bound(&self) -> Option<BoundFunction> {
        match self.internal {
            Internal::FunctionRef(bound) => Some(bound),
            _ => None,
        }
    }
}

impl Internal {
    pub fn carries_entities(&self) -> bool {
        matches!(
            self,
            Internal::Array(_) | Internal::Tuple(_) | Internal::FunctionRef(_)
        )
    }
}

/// Enumerates the outgoing heap edges of a value.
///
/// Visiting an object yields only its direct children; the collector and
/// the edge audit drive the traversal.
pub trait Visitable {
    fn visit_edges(&self, visitor: &mut impl FnMut(ObjectRef));
}

impl Visitable for Entity {
    #[inline]
    fn visit_edges(&self, visitor: &mut impl FnMut(ObjectRef)) {
        if let Entity::Object(r) = self {
            visitor(*r);
        }
    }
}

impl Visitable for [Entity] {
    #[inline]
    fn visit_edges(&self, visitor: &mut impl FnMut(ObjectRef)) {
        self.iter().for_each(|e| e.visit_edges(visitor));
    }
}

impl Visitable for Internal {
    fn visit_edges(&self, visitor: &mut impl FnMut(ObjectRef)) {
        match self {
            Internal::Array(items) => items.visit_edges(visitor),
            Internal::Tuple(items) => items.visit_edges(visitor),
            Internal::FunctionRef(bound) => bound.receiver.visit_edges(visitor),
            // remote objects live in another heap, futures memoize into a
            // member
            _ => (),
        }
    }
}

impl Visitable for Object {
    fn visit_edges(&self, visitor: &mut impl FnMut(ObjectRef)) {
        self.members.values().for_each(|e| e.visit_edges(visitor));
        self.internal.visit_edges(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(index: u32) -> ObjectRef {
        ObjectRef {
            index,
            generation: 0,
        }
    }

    #[test]
    fn visits_members_and_payload() {
        let strings = crate::InternedStrings::new();
        let mut obj = Object::new(ClassId(0));
        obj.members.insert(strings.add("a"), Entity::Object(r(1)));
        obj.members.insert(strings.add("b"), Entity::int(3));
        obj.internal = Internal::Array(vec![
            Entity::Object(r(2)),
            Entity::None,
            Entity::Object(r(1)),
        ]);

        let mut seen = Vec::new();
        obj.visit_edges(&mut |child| seen.push(child.index));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 1, 2]);
    }

    #[test]
    fn remote_payload_has_no_local_edges() {
        let mut obj = Object::new(ClassId(0));
        obj.internal = Internal::Remote(RemoteRef {
            process: ProcessId(1),
            object: r(4),
        });
        let mut count = 0;
        obj.visit_edges(&mut |_| count += 1);
        assert_eq!(count, 0);
    }
}
