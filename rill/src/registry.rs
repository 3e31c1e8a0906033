use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::{
    Class, ClassHooks, ClassId, CompiledModule, Function, FunctionFlags,
    FunctionId, FunctionKind, InternedId, InternedStrings, Module, ModuleId,
    Tape, VmError,
};

/// Classes the runtime itself instantiates or dispatches on.
#[derive(Debug, Clone, Copy)]
pub struct SpecialClasses {
    pub object: ClassId,
    pub class: ClassId,
    pub module: ClassId,
    pub function: ClassId,
    pub function_ref: ClassId,
    pub int: ClassId,
    pub float: ClassId,
    pub char: ClassId,
    pub string: ClassId,
    pub array: ClassId,
    pub tuple: ClassId,
    pub error: ClassId,
    pub stack_line: ClassId,
    pub future: ClassId,
    pub task: ClassId,
    pub context: ClassId,
    pub process: ClassId,
    pub remote: ClassId,
}

/// Process-wide store of every class, function and module.
///
/// These are immutable singletons shared by all processes; heaps refer to
/// them by id and never copy them.
#[derive(Debug, Default)]
pub struct Registry {
    classes: RwLock<Vec<Arc<Class>>>,
    functions: RwLock<Vec<Arc<Function>>>,
    modules: RwLock<Vec<Arc<Module>>>,
    module_names: RwLock<AHashMap<InternedId, ModuleId>>,
    /// Held across the cycle check and write of a superclass rebind.
    hierarchy: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(&self, id: ClassId) -> Arc<Class> {
        self.classes.read()[id.0 as usize].clone()
    }

    pub fn function(&self, id: FunctionId) -> Arc<Function> {
        self.functions.read()[id.0 as usize].clone()
    }

    pub fn module(&self, id: ModuleId) -> Arc<Module> {
        self.modules.read()[id.0 as usize].clone()
    }

    pub fn module_by_name(&self, name: InternedId) -> Option<ModuleId> {
        self.module_names.read().get(&name).copied()
    }

    pub fn class_count(&self) -> usize {
        self.classes.read().len()
    }

    pub fn add_module(
        &self,
        strings: &InternedStrings,
        text: &str,
        tape: Tape,
    ) -> Result<ModuleId, VmError> {
        let name = strings.add(text);
        let mut modules = self.modules.write();
        let mut names = self.module_names.write();
        if names.contains_key(&name) {
            return Err(VmError::DuplicateModule(text.to_string()));
        }
        let id = ModuleId(modules.len() as u32);
        modules.push(Arc::new(Module::new(id, name, tape)));
        names.insert(name, id);
        Ok(id)
    }

    pub fn add_class(
        &self,
        name: InternedId,
        module: ModuleId,
        super_class: Option<ClassId>,
        fields: Vec<InternedId>,
        hooks: ClassHooks,
    ) -> ClassId {
        let id = {
            let mut classes = self.classes.write();
            let id = ClassId(classes.len() as u32);
            classes.push(Arc::new(Class::new(
                id,
                name,
                module,
                super_class,
                fields,
                hooks,
            )));
            id
        };
        self.module(module).add_class(id);
        id
    }

    /// Register a function. Methods are attached to their class, free
    /// functions to their module.
    pub fn add_function(
        &self,
        name: InternedId,
        module: ModuleId,
        kind: FunctionKind,
        mut flags: FunctionFlags,
        parent_class: Option<ClassId>,
    ) -> FunctionId {
        match kind {
            FunctionKind::User { .. } => (),
            FunctionKind::Native(_) => flags |= FunctionFlags::NATIVE,
            FunctionKind::Background(_) => {
                flags |= FunctionFlags::NATIVE | FunctionFlags::BACKGROUND
            }
        }
        let id = {
            let mut functions = self.functions.write();
            let id = FunctionId(functions.len() as u32);
            functions.push(Arc::new(Function {
                id,
                name,
                module,
                kind,
                flags,
                parent_class,
            }));
            id
        };
        match parent_class {
            Some(class) => self.class(class).add_method(name, id),
            None => self.module(module).add_function(name, id),
        }
        id
    }

    /// Walks the superclass chain of `class` looking for `ancestor`.
    pub fn inherits_from(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        let mut steps = 0;
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            steps += 1;
            // chains are acyclic by construction; bail out if that broke
            debug_assert!(steps <= self.class_count(), "inheritance cycle");
            if steps > self.class_count() {
                return false;
            }
            current = self.class(c).super_class();
        }
        false
    }

    /// Method resolution through the class chain.
    pub fn find_method(
        &self,
        class: ClassId,
        name: InternedId,
    ) -> Option<FunctionId> {
        let mut current = Some(class);
        let mut steps = 0;
        while let Some(c) = current {
            let class = self.class(c);
            if let Some(f) = class.own_method(name) {
                return Some(f);
            }
            steps += 1;
            if steps > self.class_count() {
                return None;
            }
            current = class.super_class();
        }
        None
    }

    /// Rebind the superclass of `class`; refuses rebinds that would make the
    /// chain cyclic.
    pub fn set_super(
        &self,
        strings: &InternedStrings,
        class: ClassId,
        super_class: ClassId,
    ) -> Result<(), VmError> {
        let _hierarchy = self.hierarchy.lock();
        if self.inherits_from(super_class, class) {
            let name = strings.get(self.class(class).name);
            return Err(VmError::InheritanceCycle(name.to_string()));
        }
        self.class(class).set_super_unchecked(Some(super_class));
        Ok(())
    }

    pub fn find_class_in_module(
        &self,
        module: ModuleId,
        name: InternedId,
    ) -> Option<ClassId> {
        self.module(module)
            .classes()
            .into_iter()
            .find(|&c| self.class(c).name == name)
    }

    /// Turn a compiled module into registered classes and functions.
    ///
    /// Superclasses resolve against the module's own classes first, then
    /// against `builtins`; classes without one inherit from `root`.
    pub fn register_compiled(
        &self,
        strings: &InternedStrings,
        compiled: CompiledModule,
        builtins: Option<ModuleId>,
        root: ClassId,
    ) -> Result<ModuleId, VmError> {
        compiled.validate()?;
        let name = strings.add(&compiled.name);
        if self.module_by_name(name).is_some() {
            return Err(VmError::DuplicateModule(compiled.name));
        }
        let module = self.add_module(strings, &compiled.name, compiled.tape)?;

        // first pass: create every class so supers can refer forward
        let mut created = Vec::with_capacity(compiled.classes.len());
        for def in &compiled.classes {
            let fields = def.fields.iter().map(|f| strings.add(f)).collect();
            let class = self.add_class(
                strings.add(&def.name),
                module,
                Some(root),
                fields,
                ClassHooks::default(),
            );
            created.push(class);
        }

        // second pass: wire supers
        for (def, &class) in compiled.classes.iter().zip(&created) {
            let Some(super_name) = &def.super_name else {
                continue;
            };
            let super_id = strings.add(super_name);
            let resolved = self
                .find_class_in_module(module, super_id)
                .or_else(|| {
                    builtins.and_then(|b| self.find_class_in_module(b, super_id))
                })
                .ok_or_else(|| VmError::UnknownSuperclass {
                    class: def.name.clone(),
                    super_name: super_name.clone(),
                })?;
            if resolved == class || self.inherits_from(resolved, class) {
                return Err(VmError::InheritanceCycle(def.name.clone()));
            }
            self.class(class).set_super_unchecked(Some(resolved));
        }

        for def in &compiled.functions {
            let parent = match &def.class {
                Some(class_name) => {
                    let id = strings.add(class_name);
                    Some(self.find_class_in_module(module, id).ok_or_else(
                        || {
                            VmError::MalformedModule(format!(
                                "method `{}` names unknown class `{class_name}`",
                                def.name
                            ))
                        },
                    )?)
                }
                None => None,
            };
            self.add_function(
                strings.add(&def.name),
                module,
                FunctionKind::User {
                    ins_pos: def.ins_pos,
                },
                def.flags,
                parent,
            );
        }
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassDef, FunctionDef, Instruction, Op};

    fn setup() -> (InternedStrings, Registry, ModuleId, ClassId) {
        let strings = InternedStrings::new();
        let registry = Registry::new();
        let builtins = registry
            .add_module(&strings, "builtins", Tape::default())
            .unwrap();
        let object = registry.add_class(
            strings.add("Object"),
            builtins,
            None,
            Vec::new(),
            ClassHooks::default(),
        );
        (strings, registry, builtins, object)
    }

    fn compiled(classes: Vec<ClassDef>, functions: Vec<FunctionDef>) -> CompiledModule {
        CompiledModule {
            name: "shapes".into(),
            tape: Tape {
                instructions: vec![Instruction::bare(Op::Nop); 4],
                ..Default::default()
            },
            functions,
            classes,
        }
    }

    fn class_def(name: &str, super_name: Option<&str>) -> ClassDef {
        ClassDef {
            name: name.into(),
            super_name: super_name.map(Into::into),
            fields: vec!["x".into()],
            start: 0,
            end: 4,
        }
    }

    #[test]
    fn registers_classes_with_forward_supers() {
        let (strings, registry, builtins, object) = setup();
        let module = registry
            .register_compiled(
                &strings,
                compiled(
                    vec![class_def("Square", Some("Shape")), class_def("Shape", None)],
                    vec![FunctionDef {
                        name: "area".into(),
                        ins_pos: 1,
                        class: Some("Shape".into()),
                        flags: FunctionFlags::empty(),
                    }],
                ),
                Some(builtins),
                object,
            )
            .unwrap();

        let square = registry
            .find_class_in_module(module, strings.add("Square"))
            .unwrap();
        let shape = registry
            .find_class_in_module(module, strings.add("Shape"))
            .unwrap();
        assert!(registry.inherits_from(square, shape));
        assert!(registry.inherits_from(square, object));
        assert!(!registry.inherits_from(shape, square));
        assert!(registry.find_method(square, strings.add("area")).is_some());
        assert!(registry.find_method(square, strings.add("volume")).is_none());
    }

    #[test]
    fn unknown_super_is_rejected() {
        let (strings, registry, builtins, object) = setup();
        let err = registry
            .register_compiled(
                &strings,
                compiled(vec![class_def("A", Some("Missing"))], vec![]),
                Some(builtins),
                object,
            )
            .unwrap_err();
        assert!(matches!(err, VmError::UnknownSuperclass { .. }));
    }

    #[test]
    fn set_super_refuses_cycles() {
        let (strings, registry, builtins, object) = setup();
        let module = registry
            .register_compiled(
                &strings,
                compiled(vec![class_def("A", None), class_def("B", Some("A"))], vec![]),
                Some(builtins),
                object,
            )
            .unwrap();
        let a = registry.find_class_in_module(module, strings.add("A")).unwrap();
        let b = registry.find_class_in_module(module, strings.add("B")).unwrap();
        let err = registry.set_super(&strings, a, b).unwrap_err();
        assert_eq!(err.to_string(), "class `A` would inherit from itself");
        assert!(registry.set_super(&strings, b, object).is_ok());
        assert!(!registry.inherits_from(b, a));
    }

    #[test]
    fn concurrent_rebinds_never_close_a_cycle() {
        let (strings, registry, builtins, object) = setup();
        let module = registry
            .register_compiled(
                &strings,
                compiled(vec![class_def("A", None), class_def("B", None)], vec![]),
                Some(builtins),
                object,
            )
            .unwrap();
        let a = registry.find_class_in_module(module, strings.add("A")).unwrap();
        let b = registry.find_class_in_module(module, strings.add("B")).unwrap();
        for _ in 0..200 {
            registry.class(a).set_super_unchecked(Some(object));
            registry.class(b).set_super_unchecked(Some(object));
            let barrier = std::sync::Barrier::new(2);
            let (first, second) = std::thread::scope(|s| {
                let first = s.spawn(|| {
                    barrier.wait();
                    registry.set_super(&strings, a, b).is_ok()
                });
                let second = s.spawn(|| {
                    barrier.wait();
                    registry.set_super(&strings, b, a).is_ok()
                });
                (first.join().unwrap(), second.join().unwrap())
            });
            assert!(first != second, "exactly one rebind wins");
            assert!(!(registry.inherits_from(a, b) && registry.inherits_from(b, a)));
        }
    }

    #[test]
    fn duplicate_module_errors_name_the_module() {
        let (strings, registry, _, _) = setup();
        let err = registry
            .add_module(&strings, "builtins", Tape::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "module `builtins` is already registered");
    }

    #[test]
    fn duplicate_module_names_fail() {
        let (strings, registry, builtins, object) = setup();
        registry
            .register_compiled(&strings, compiled(vec![], vec![]), Some(builtins), object)
            .unwrap();
        let err = registry
            .register_compiled(&strings, compiled(vec![], vec![]), Some(builtins), object)
            .unwrap_err();
        assert!(matches!(err, VmError::DuplicateModule(_)));
    }
}
