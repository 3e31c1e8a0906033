use ahash::AHashMap;

use crate::{
    BoundFunction, Entity, Heap, Internal, ObjectRef, RuntimeResult,
    SpecialClasses, reflect,
};

/// Deep copy of entities from one heap into another.
///
/// Each source object is copied once per copier: shared children stay
/// shared and cycles are reproduced instead of followed forever. Classes,
/// modules and functions are never copied; they map to the target heap's
/// reflection singletons. Futures, tasks and contexts are process-local
/// and arrive as None. A function ref keeps its function and receiver but
/// loses any captured context.
pub struct EntityCopier<'a> {
    source: &'a Heap,
    target: &'a mut Heap,
    special: &'a SpecialClasses,
    copy_map: AHashMap<ObjectRef, ObjectRef>,
    worklist: Vec<(ObjectRef, ObjectRef)>,
}

impl<'a> EntityCopier<'a> {
    pub fn new(source: &'a Heap, target: &'a mut Heap, special: &'a SpecialClasses) -> Self {
        Self {
            source,
            target,
            special,
            copy_map: AHashMap::new(),
            worklist: Vec::new(),
        }
    }

    pub fn copy(&mut self, entity: Entity) -> RuntimeResult<Entity> {
        let copied = self.map_entity(entity)?;
        while let Some((from, to)) = self.worklist.pop() {
            self.fill(from, to)?;
        }
        Ok(copied)
    }

    /// Number of distinct objects copied so far.
    pub fn copied_objects(&self) -> usize {
        self.copy_map.len()
    }

    fn map_entity(&mut self, entity: Entity) -> RuntimeResult<Entity> {
        match entity {
            Entity::Object(r) => self.map_object(r),
            other => Ok(other),
        }
    }

    fn map_object(&mut self, from: ObjectRef) -> RuntimeResult<Entity> {
        if let Some(&to) = self.copy_map.get(&from) {
            return Ok(to.into());
        }
        let source = self.source;
        let object = source.get(from)?;
        let aliased = match *object.internal() {
            Internal::Class(c) => Some(reflect::class_object(self.target, self.special, c)?),
            Internal::Module(m) => Some(reflect::module_object(self.target, self.special, m)?),
            Internal::Function(f) => {
                Some(reflect::function_object(self.target, self.special, f)?)
            }
            Internal::Future(_) | Internal::Task(_) | Internal::Context(_) => {
                return Ok(Entity::None);
            }
            _ => None,
        };
        let to = match aliased {
            Some(to) => to,
            None => {
                let to = self.target.allocate(object.class());
                self.worklist.push((from, to));
                to
            }
        };
        self.copy_map.insert(from, to);
        Ok(to.into())
    }

    fn fill(&mut self, from: ObjectRef, to: ObjectRef) -> RuntimeResult<()> {
        let source = self.source;
        let object = source.get(from)?;
        for (key, value) in object.members() {
            let value = self.map_entity(value)?;
            self.target.set_member(to, key, value)?;
        }
        let internal = match object.internal() {
            Internal::Array(items) => Internal::Array(self.map_all(items)?),
            Internal::Tuple(items) => {
                Internal::Tuple(self.map_all(items)?.into_boxed_slice())
            }
            Internal::FunctionRef(bound) => Internal::FunctionRef(BoundFunction {
                function: bound.function,
                receiver: self.map_entity(bound.receiver)?,
                capture: None,
            }),
            other => other.clone(),
        };
        self.target.replace_internal(to, internal)?;
        Ok(())
    }

    fn map_all(&mut self, items: &[Entity]) -> RuntimeResult<Vec<Entity>> {
        items.iter().map(|&e| self.map_entity(e)).collect()
    }
}
