//! The `builtins` module: core classes, their native methods and the free
//! functions every module can see.
use crate::{
    BackgroundFn, ClassHooks, ClassId, FunctionFlags, FunctionKind,
    InternedStrings, ModuleId, NativeFn, Registry, SpecialClasses, Tape,
    VmError,
};

mod concurrency;
mod io;
mod types;

/// A native function as listed in a builtin table.
#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub kind: FunctionKind,
    pub flags: FunctionFlags,
}

impl Builtin {
    pub const fn native(name: &'static str, body: NativeFn) -> Self {
        Self {
            name,
            kind: FunctionKind::Native(body),
            flags: FunctionFlags::empty(),
        }
    }

    /// Runs on the background pool; `ASYNC` hands the caller a Future.
    pub const fn background(
        name: &'static str,
        body: BackgroundFn,
        flags: FunctionFlags,
    ) -> Self {
        Self {
            name,
            kind: FunctionKind::Background(body),
            flags,
        }
    }
}

/// Register the builtins module and return it together with the classes
/// the runtime needs by id.
pub fn install(
    strings: &InternedStrings,
    registry: &Registry,
) -> Result<(ModuleId, SpecialClasses), VmError> {
    let module = registry.add_module(strings, "builtins", Tape::default())?;

    let add = |name: &str, super_class: Option<ClassId>, fields: &[&str], hooks: ClassHooks| {
        let fields = fields.iter().map(|f| strings.add(f)).collect();
        registry.add_class(strings.add(name), module, super_class, fields, hooks)
    };
    let object = add("Object", None, &[], ClassHooks::default());
    let plain = |name: &str| add(name, Some(object), &[], ClassHooks::default());
    let hooked = |name: &str, hooks: ClassHooks| add(name, Some(object), &[], hooks);

    let special = SpecialClasses {
        object,
        class: plain("Class"),
        module: plain("Module"),
        function: plain("Function"),
        function_ref: plain("FunctionRef"),
        int: plain("Int"),
        float: plain("Float"),
        char: plain("Char"),
        string: hooked("String", types::STRING_HOOKS),
        array: hooked("Array", types::ARRAY_HOOKS),
        tuple: hooked("Tuple", types::TUPLE_HOOKS),
        error: add("Error", Some(object), &["message", "stacktrace"], ClassHooks::default()),
        stack_line: add(
            "StackLine",
            Some(object),
            &["module", "function", "line", "col", "text"],
            ClassHooks::default(),
        ),
        future: plain("Future"),
        task: plain("Task"),
        context: plain("Context"),
        process: hooked("Process", concurrency::PROCESS_HOOKS),
        remote: plain("Remote"),
    };

    let free = [io::FUNCTIONS, types::FUNCTIONS, concurrency::FUNCTIONS];
    for builtin in free.into_iter().flatten() {
        registry.add_function(strings.add(builtin.name), module, builtin.kind, builtin.flags, None);
    }
    let methods = types::methods(&special)
        .into_iter()
        .chain(concurrency::methods(&special));
    for (class, table) in methods {
        for builtin in table {
            registry.add_function(
                strings.add(builtin.name),
                module,
                builtin.kind,
                builtin.flags,
                Some(class),
            );
        }
    }

    log::debug!("builtins installed: {} classes", registry.class_count());
    Ok((module, special))
}
