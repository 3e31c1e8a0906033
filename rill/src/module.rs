use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{ClassId, FunctionId, InternedId, Tape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// A registered module: its tape plus the classes and free functions it
/// defines.
///
/// Module-level variables are not stored here: they live as members of the
/// module's reflection object in each process heap, so every process
/// initializes its own copy lazily.
#[derive(Debug)]
pub struct Module {
    pub id: ModuleId,
    pub name: InternedId,
    pub tape: Arc<Tape>,
    classes: RwLock<Vec<ClassId>>,
    functions: RwLock<AHashMap<InternedId, FunctionId>>,
}

impl Module {
    pub fn new(id: ModuleId, name: InternedId, tape: Tape) -> Self {
        Self {
            id,
            name,
            tape: Arc::new(tape),
            classes: RwLock::new(Vec::new()),
            functions: RwLock::new(AHashMap::new()),
        }
    }

    pub fn classes(&self) -> Vec<ClassId> {
        self.classes.read().clone()
    }

    pub fn add_class(&self, class: ClassId) {
        self.classes.write().push(class);
    }

    pub fn function(&self, name: InternedId) -> Option<FunctionId> {
        self.functions.read().get(&name).copied()
    }

    pub fn functions(&self) -> Vec<(InternedId, FunctionId)> {
        self.functions.read().iter().map(|(&k, &v)| (k, v)).collect()
    }

    pub fn add_function(&self, name: InternedId, function: FunctionId) {
        self.functions.write().insert(name, function);
    }
}
