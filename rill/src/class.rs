use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{FunctionId, InternedId, ModuleId, ObjectHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassHooks {
    pub init: Option<ObjectHook>,
    pub delete: Option<ObjectHook>,
}

/// A class: single inheritance, methods keyed by interned name.
///
/// Only the root `Object` class has no superclass. The superclass can be
/// rebound after registration (`$__set_super`), which is why it sits behind
/// a lock together with the method table.
#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name: InternedId,
    pub module: ModuleId,
    pub fields: Vec<InternedId>,
    pub hooks: ClassHooks,
    super_class: RwLock<Option<ClassId>>,
    methods: RwLock<AHashMap<InternedId, FunctionId>>,
}

impl Class {
    pub fn new(
        id: ClassId,
        name: InternedId,
        module: ModuleId,
        super_class: Option<ClassId>,
        fields: Vec<InternedId>,
        hooks: ClassHooks,
    ) -> Self {
        Self {
            id,
            name,
            module,
            fields,
            hooks,
            super_class: RwLock::new(super_class),
            methods: RwLock::new(AHashMap::new()),
        }
    }

    pub fn super_class(&self) -> Option<ClassId> {
        *self.super_class.read()
    }

    pub(crate) fn set_super_unchecked(&self, super_class: Option<ClassId>) {
        *self.super_class.write() = super_class;
    }

    /// Method defined directly on this class (no chain walk).
    pub fn own_method(&self, name: InternedId) -> Option<FunctionId> {
        self.methods.read().get(&name).copied()
    }

    pub fn add_method(&self, name: InternedId, function: FunctionId) {
        self.methods.write().insert(name, function);
    }

    pub fn method_names(&self) -> Vec<InternedId> {
        self.methods.read().keys().copied().collect()
    }
}
