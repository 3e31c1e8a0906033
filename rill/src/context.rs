use ahash::AHashMap;

use crate::{Entity, FunctionId, InternedId, ModuleId, ObjectRef, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Top-level code of a module; `LET` writes module members.
    ModuleRoot,
    /// Function entry.
    Function,
    /// Lexical block opened by `NBLK`.
    Block,
}

/// One activation or block frame.
///
/// `previous` is the lexical lookup chain (the enclosing block, or the
/// context an anonymous function closed over); it never owns anything.
#[derive(Debug, Clone)]
pub struct Context {
    pub task: TaskId,
    pub kind: ContextKind,
    pub previous: Option<ContextId>,
    pub self_: Entity,
    pub module: ModuleId,
    pub function: Option<FunctionId>,
    pub ip: usize,
    pub locals: AHashMap<InternedId, Entity>,
    pub error: Option<ObjectRef>,
    pub catch_ins: Option<usize>,
    /// Referenced by a closure or reflection object; never recycled.
    pub pinned: bool,
}

impl Context {
    pub fn new(
        task: TaskId,
        kind: ContextKind,
        module: ModuleId,
        function: Option<FunctionId>,
        ip: usize,
    ) -> Self {
        Self {
            task,
            kind,
            previous: None,
            self_: Entity::None,
            module,
            function,
            ip,
            locals: AHashMap::new(),
            error: None,
            catch_ins: None,
            pinned: false,
        }
    }

    /// Everything this frame keeps alive.
    pub fn visit_entities(&self, visitor: &mut dyn FnMut(Entity)) {
        visitor(self.self_);
        self.locals.values().for_each(|&e| visitor(e));
        if let Some(err) = self.error {
            visitor(err.into());
        }
    }
}
