use std::fmt;

use bitflags::bitflags;

use crate::{BackgroundFn, ClassId, InternedId, ModuleId, NativeFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u8 {
        const CONST = 1 << 0;
        /// Calls return a Future instead of parking the caller.
        const ASYNC = 1 << 1;
        /// Native body runs on the background pool.
        const BACKGROUND = 1 << 2;
        const NATIVE = 1 << 3;
        const ANON = 1 << 4;
    }
}

#[derive(Clone, Copy)]
pub enum FunctionKind {
    /// Bytecode starting at `ins_pos` in the owning module's tape.
    User { ins_pos: usize },
    Native(NativeFn),
    Background(BackgroundFn),
}

pub struct Function {
    pub id: FunctionId,
    pub name: InternedId,
    pub module: ModuleId,
    pub kind: FunctionKind,
    pub flags: FunctionFlags,
    pub parent_class: Option<ClassId>,
}

impl Function {
    pub fn is_async(&self) -> bool {
        self.flags.contains(FunctionFlags::ASYNC)
    }

    pub fn is_native(&self) -> bool {
        !matches!(self.kind, FunctionKind::User { .. })
    }

    pub fn is_anon(&self) -> bool {
        self.flags.contains(FunctionFlags::ANON)
    }
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::User { ins_pos } => write!(f, "User({ins_pos})"),
            FunctionKind::Native(_) => f.write_str("Native"),
            FunctionKind::Background(_) => f.write_str("Background"),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("module", &self.module)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("parent_class", &self.parent_class)
            .finish()
    }
}
