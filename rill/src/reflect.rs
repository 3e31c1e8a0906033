//! Runtime values standing for classes, modules and functions.
//!
//! Each heap holds at most one reflection object per class, module and
//! function. They are rooted for the life of the heap, and a copy between
//! heaps maps to the target heap's own singleton.
use crate::{
    ClassId, FunctionId, Heap, Internal, ModuleId, ObjectRef, Reflected,
    RuntimeResult, SpecialClasses,
};

fn singleton(
    heap: &mut Heap,
    key: Reflected,
    meta: ClassId,
    internal: Internal,
) -> RuntimeResult<ObjectRef> {
    if let Some(r) = heap.reflection(key) {
        return Ok(r);
    }
    let r = heap.allocate(meta);
    heap.set_plain_internal(r, internal)?;
    heap.register_reflection(key, r)?;
    Ok(r)
}

pub fn class_object(
    heap: &mut Heap,
    special: &SpecialClasses,
    class: ClassId,
) -> RuntimeResult<ObjectRef> {
    singleton(heap, Reflected::Class(class), special.class, Internal::Class(class))
}

/// Module-level variables of this process live as members of the returned
/// object.
pub fn module_object(
    heap: &mut Heap,
    special: &SpecialClasses,
    module: ModuleId,
) -> RuntimeResult<ObjectRef> {
    singleton(
        heap,
        Reflected::Module(module),
        special.module,
        Internal::Module(module),
    )
}

pub fn function_object(
    heap: &mut Heap,
    special: &SpecialClasses,
    function: FunctionId,
) -> RuntimeResult<ObjectRef> {
    singleton(
        heap,
        Reflected::Function(function),
        special.function,
        Internal::Function(function),
    )
}
