use std::{fmt::Write as _, sync::Arc};

use crate::{
    BoundFunction, ClassId, ContextId, ContextKind, Entity, FunctionId, Heap,
    Internal, InternedId, ModuleId, Object, ObjectRef, Primitive, Process,
    ProcessCore, RuntimeError, RuntimeResult, SpecialClasses, Task, TaskId,
    TaskState, VmShared, reflect,
};

/// One frame of an error's stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub module: String,
    pub function: String,
    pub line: u32,
    pub col: u32,
    pub text: String,
}

/// Everything an instruction or a native function may touch while a task
/// runs: the VM, the running process with its heap lock held, and the task.
pub struct Machine<'a> {
    pub vm: &'a Arc<VmShared>,
    pub process: &'a Arc<Process>,
    pub core: &'a mut ProcessCore,
    pub task: TaskId,
}

impl<'a> Machine<'a> {
    pub fn new(
        vm: &'a Arc<VmShared>,
        process: &'a Arc<Process>,
        core: &'a mut ProcessCore,
        task: TaskId,
    ) -> Self {
        Self {
            vm,
            process,
            core,
            task,
        }
    }

    pub fn special(&self) -> &'a SpecialClasses {
        let vm: &'a Arc<VmShared> = self.vm;
        &vm.special
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.core.heap
    }

    pub fn current_task(&self) -> &Task {
        self.core.task(self.task)
    }

    pub fn current_task_mut(&mut self) -> &mut Task {
        self.core.task_mut(self.task)
    }

    pub fn current_context(&self) -> Option<ContextId> {
        self.current_task().top_context()
    }

    pub fn name(&self, id: InternedId) -> Arc<str> {
        self.vm.strings.get(id)
    }

    pub fn intern(&self, value: &str) -> InternedId {
        self.vm.strings.add(value)
    }

    // ── operand stack and register ──────────────────────────────────

    pub fn resval(&self) -> Entity {
        self.current_task().resval
    }

    pub fn set_resval(&mut self, value: Entity) {
        self.current_task_mut().resval = value;
    }

    pub fn push(&mut self, value: Entity) {
        self.current_task_mut().stack.push(value);
    }

    pub fn pop(&mut self) -> RuntimeResult<Entity> {
        self.current_task_mut()
            .stack
            .pop()
            .ok_or(RuntimeError::StackUnderflow)
    }

    pub fn pop_n(&mut self, n: usize) -> RuntimeResult<Vec<Entity>> {
        let stack = &mut self.current_task_mut().stack;
        let at = stack
            .len()
            .checked_sub(n)
            .ok_or(RuntimeError::StackUnderflow)?;
        Ok(stack.split_off(at))
    }

    pub fn peek(&self, depth: usize) -> RuntimeResult<Entity> {
        let stack = &self.current_task().stack;
        stack
            .len()
            .checked_sub(depth + 1)
            .map(|i| stack[i])
            .ok_or(RuntimeError::StackUnderflow)
    }

    // ── allocation ──────────────────────────────────────────────────

    pub fn new_object(&mut self, class: ClassId) -> ObjectRef {
        self.core.heap.allocate(class)
    }

    pub fn new_string(&mut self, value: impl Into<String>) -> Entity {
        let class = self.special().string;
        self.core.heap.new_string(class, value).into()
    }

    pub fn new_array(&mut self, items: Vec<Entity>) -> RuntimeResult<Entity> {
        let class = self.special().array;
        Ok(self.core.heap.new_array(class, items)?.into())
    }

    pub fn new_tuple(&mut self, items: Vec<Entity>) -> RuntimeResult<Entity> {
        let class = self.special().tuple;
        Ok(self.core.heap.new_tuple(class, items)?.into())
    }

    pub fn function_ref(
        &mut self,
        function: FunctionId,
        receiver: Entity,
        capture: Option<ContextId>,
    ) -> RuntimeResult<Entity> {
        if let Some(c) = capture {
            self.core.pin_context_chain(c);
        }
        let r = self.new_object(self.special().function_ref);
        self.core.heap.replace_internal(
            r,
            Internal::FunctionRef(BoundFunction {
                function,
                receiver,
                capture,
            }),
        )?;
        Ok(r.into())
    }

    /// A future over `task`; the task's error will no longer be reported
    /// as uncaught.
    pub fn future_for(&mut self, task: TaskId) -> RuntimeResult<Entity> {
        self.core.task_mut(task).observed = true;
        let r = self.new_object(self.special().future);
        self.core.heap.set_plain_internal(
            r,
            Internal::Future(crate::FutureCell {
                task,
                memoized: false,
            }),
        )?;
        Ok(r.into())
    }

    pub fn class_object(&mut self, class: ClassId) -> RuntimeResult<Entity> {
        let special = self.special();
        Ok(reflect::class_object(&mut self.core.heap, special, class)?.into())
    }

    pub fn module_object(&mut self, module: ModuleId) -> RuntimeResult<ObjectRef> {
        let special = self.special();
        reflect::module_object(&mut self.core.heap, special, module)
    }

    pub fn function_object(&mut self, function: FunctionId) -> RuntimeResult<Entity> {
        let special = self.special();
        Ok(reflect::function_object(&mut self.core.heap, special, function)?.into())
    }

    pub fn task_object(&mut self, task: TaskId) -> RuntimeResult<Entity> {
        let r = self.new_object(self.special().task);
        self.core.heap.set_plain_internal(r, Internal::Task(task))?;
        Ok(r.into())
    }

    pub fn context_object(&mut self, context: ContextId) -> RuntimeResult<Entity> {
        self.core.pin_context_chain(context);
        let r = self.new_object(self.special().context);
        self.core.heap.set_plain_internal(r, Internal::Context(context))?;
        Ok(r.into())
    }

    // ── inspection ──────────────────────────────────────────────────

    pub fn object(&self, r: ObjectRef) -> RuntimeResult<&Object> {
        self.core.heap.get(r)
    }

    pub fn str_value(&self, entity: Entity) -> Option<&str> {
        match entity {
            Entity::Object(r) => self.core.heap.get(r).ok()?.as_str(),
            _ => None,
        }
    }

    pub fn expect_str(&self, entity: Entity) -> RuntimeResult<String> {
        self.str_value(entity)
            .map(str::to_owned)
            .ok_or_else(|| RuntimeError::TypeError {
                expected: "String",
                got: self.type_name(entity),
            })
    }

    pub fn expect_object(&self, entity: Entity, expected: &'static str) -> RuntimeResult<ObjectRef> {
        entity.as_object().ok_or_else(|| RuntimeError::TypeError {
            expected,
            got: self.type_name(entity),
        })
    }

    pub fn class_of(&self, entity: Entity) -> Option<ClassId> {
        let special = self.special();
        match entity {
            Entity::None => None,
            Entity::Primitive(Primitive::Int(_)) => Some(special.int),
            Entity::Primitive(Primitive::Float(_)) => Some(special.float),
            Entity::Primitive(Primitive::Char(_)) => Some(special.char),
            Entity::Object(r) => self.core.heap.class_of(r).ok(),
        }
    }

    pub fn type_name(&self, entity: Entity) -> String {
        match self.class_of(entity) {
            Some(class) => self.name(self.vm.registry.class(class).name).to_string(),
            None => "none".to_string(),
        }
    }

    pub fn is_instance(&self, entity: Entity, class: ClassId) -> bool {
        self.class_of(entity)
            .is_some_and(|c| self.vm.registry.inherits_from(c, class))
    }

    /// Text form used by `print` and `str`.
    pub fn display(&self, entity: Entity) -> String {
        let mut out = String::new();
        self.display_into(entity, &mut out, 0);
        out
    }

    fn display_into(&self, entity: Entity, out: &mut String, depth: usize) {
        let r = match entity {
            Entity::None => {
                out.push_str("none");
                return;
            }
            Entity::Primitive(p) => {
                let _ = write!(out, "{p}");
                return;
            }
            Entity::Object(r) => r,
        };
        let Ok(object) = self.core.heap.get(r) else {
            out.push_str("<stale>");
            return;
        };
        let registry = &self.vm.registry;
        let sequence = match (object.as_array(), object.as_tuple()) {
            (Some(items), _) => Some(('[', items, ']')),
            (_, Some(items)) => Some(('(', items, ')')),
            _ => None,
        };
        if let Some((open, items, close)) = sequence {
            if depth >= 8 {
                out.push_str("...");
                return;
            }
            out.push(open);
            for (i, &item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                self.display_into(item, out, depth + 1);
            }
            out.push(close);
            return;
        }
        match object.internal() {
            Internal::String(s) => out.push_str(s),
            Internal::Class(c) => {
                let _ = write!(out, "<class {}>", self.name(registry.class(*c).name));
            }
            Internal::Module(m) => {
                let _ = write!(out, "<module {}>", self.name(registry.module(*m).name));
            }
            Internal::Function(f) => {
                let _ = write!(out, "<function {}>", self.name(registry.function(*f).name));
            }
            Internal::FunctionRef(b) => {
                let _ = write!(
                    out,
                    "<function {}>",
                    self.name(registry.function(b.function).name)
                );
            }
            _ => {
                let class = self.name(registry.class(object.class()).name);
                if self.is_instance(entity, self.special().error) {
                    let message = object
                        .member(self.vm.names.message)
                        .and_then(|m| self.str_value(m))
                        .unwrap_or("");
                    let _ = write!(out, "{class}: {message}");
                } else {
                    let _ = write!(out, "<{class}>");
                }
            }
        }
    }

    /// `EQ` semantics: numeric with promotion, content for strings,
    /// identity otherwise.
    pub fn entity_eq(&self, lhs: Entity, rhs: Entity) -> bool {
        match (lhs, rhs) {
            (Entity::None, Entity::None) => true,
            (Entity::Primitive(a), Entity::Primitive(b)) => crate::ops::primitive_eq(a, b),
            (Entity::Object(a), Entity::Object(b)) => {
                a == b
                    || matches!(
                        (self.str_value(lhs), self.str_value(rhs)),
                        (Some(x), Some(y)) if x == y
                    )
            }
            _ => false,
        }
    }

    // ── name resolution ─────────────────────────────────────────────

    /// Look `name` up: `self`, the lexical context chain, members and
    /// methods of `self`, the current module, then the builtins module.
    pub fn resolve(&mut self, name: InternedId) -> RuntimeResult<Entity> {
        let Some(top) = self.current_context() else {
            return Err(RuntimeError::UnknownIdentifier(self.name(name).to_string()));
        };
        let context = self.core.context(top);
        let (self_, module) = (context.self_, context.module);
        if name == self.vm.names.self_ {
            return Ok(self_);
        }

        let mut current = Some(top);
        while let Some(c) = current {
            let context = self.core.context(c);
            if let Some(&value) = context.locals.get(&name) {
                return Ok(value);
            }
            current = context.previous;
        }

        if let Entity::Object(r) = self_ {
            if let Some(value) = self.core.heap.member(r, name)? {
                return Ok(value);
            }
            let class = self.core.heap.class_of(r)?;
            if let Some(f) = self.vm.registry.find_method(class, name) {
                return self.function_ref(f, self_, None);
            }
        }

        if let Some(value) = self.module_member(module, name)? {
            return Ok(value);
        }
        let builtins = self.vm.builtins;
        if module != builtins {
            if let Some(value) = self.module_member(builtins, name)? {
                return Ok(value);
            }
        }
        Err(RuntimeError::UnknownIdentifier(self.name(name).to_string()))
    }

    /// A module's variables, then its free functions, then its classes.
    ///
    /// Anonymous functions come back as function refs closing over the
    /// current context.
    pub fn module_member(
        &mut self,
        module: ModuleId,
        name: InternedId,
    ) -> RuntimeResult<Option<Entity>> {
        let mobj = self.module_object(module)?;
        if let Some(value) = self.core.heap.member(mobj, name)? {
            return Ok(Some(value));
        }
        let vm = self.vm;
        let registry = &vm.registry;
        if let Some(f) = registry.module(module).function(name) {
            if registry.function(f).is_anon() {
                let capture = self.current_context();
                let receiver = capture
                    .map(|c| self.core.context(c).self_)
                    .unwrap_or_default();
                return self.function_ref(f, receiver, capture).map(Some);
            }
            return self.function_object(f).map(Some);
        }
        if let Some(c) = registry.find_class_in_module(module, name) {
            return self.class_object(c).map(Some);
        }
        Ok(None)
    }

    /// `LET`: bind in the current context; at module top level this writes
    /// the module object.
    pub fn bind(&mut self, name: InternedId, value: Entity) -> RuntimeResult<()> {
        let top = self.current_context().ok_or(RuntimeError::ContextUnderflow)?;
        let context = self.core.context(top);
        let (kind, module) = (context.kind, context.module);
        if kind == ContextKind::ModuleRoot {
            let mobj = self.module_object(module)?;
            return self.core.heap.set_member(mobj, name, value);
        }
        self.core.context_mut(top).locals.insert(name, value);
        Ok(())
    }

    /// `SET`: overwrite the nearest existing binding, or bind afresh.
    pub fn assign(&mut self, name: InternedId, value: Entity) -> RuntimeResult<()> {
        let top = self.current_context().ok_or(RuntimeError::ContextUnderflow)?;
        let mut current = Some(top);
        while let Some(c) = current {
            let context = self.core.context_mut(c);
            if let Some(slot) = context.locals.get_mut(&name) {
                *slot = value;
                return Ok(());
            }
            current = context.previous;
        }

        let context = self.core.context(top);
        let (self_, module) = (context.self_, context.module);
        if let Entity::Object(r) = self_ {
            if self.core.heap.member(r, name)?.is_some() {
                return self.core.heap.set_member(r, name, value);
            }
        }
        let mobj = self.module_object(module)?;
        if self.core.heap.member(mobj, name)?.is_some() {
            return self.core.heap.set_member(mobj, name, value);
        }
        self.bind(name, value)
    }

    /// `GET`: a member, or a method bound to the target.
    pub fn get_member(&mut self, target: Entity, name: InternedId) -> RuntimeResult<Entity> {
        let vm = self.vm;
        let registry = &vm.registry;
        let class = match target {
            Entity::Object(r) => {
                let object = self.core.heap.get(r)?;
                if let Some(value) = object.member(name) {
                    return Ok(value);
                }
                match *object.internal() {
                    Internal::Module(m) => {
                        if let Some(value) = self.module_member(m, name)? {
                            return Ok(value);
                        }
                    }
                    Internal::Class(c) => {
                        if let Some(f) = registry.find_method(c, name) {
                            return self.function_object(f);
                        }
                    }
                    _ => (),
                }
                self.core.heap.class_of(r)?
            }
            other => match self.class_of(other) {
                Some(class) => class,
                None => {
                    return Err(RuntimeError::NoMember {
                        target: "none".into(),
                        member: self.name(name).to_string(),
                    });
                }
            },
        };
        match registry.find_method(class, name) {
            Some(f) => self.function_ref(f, target, None),
            None => Err(RuntimeError::NoMember {
                target: self.type_name(target),
                member: self.name(name).to_string(),
            }),
        }
    }

    pub fn set_member(
        &mut self,
        target: Entity,
        name: InternedId,
        value: Entity,
    ) -> RuntimeResult<()> {
        let r = self.expect_object(target, "object")?;
        self.core.heap.set_member(r, name, value)
    }

    // ── errors ──────────────────────────────────────────────────────

    /// Trace of `task` followed by the tasks that called it.
    pub fn stack_trace(&self, task: TaskId) -> Vec<TraceLine> {
        let registry = &self.vm.registry;
        let mut lines = Vec::new();
        let mut current = Some(task);
        let mut innermost = true;
        while let Some(t) = current {
            let task = self.core.task(t);
            if let Some(c) = task.top_context() {
                let context = self.core.context(c);
                // suspended callers sit one past their call instruction
                let ip = if innermost {
                    context.ip
                } else {
                    context.ip.saturating_sub(1)
                };
                let module = registry.module(context.module);
                let function = match context.function {
                    Some(f) => {
                        let function = registry.function(f);
                        match function.parent_class {
                            Some(class) => format!(
                                "{}.{}",
                                self.name(registry.class(class).name),
                                self.name(function.name)
                            ),
                            None => self.name(function.name).to_string(),
                        }
                    }
                    None => "<module>".to_string(),
                };
                let loc = module.tape.source_at(ip).unwrap_or_default();
                lines.push(TraceLine {
                    module: self.name(module.name).to_string(),
                    function,
                    line: loc.line,
                    col: loc.col,
                    text: module.tape.line_text(loc.line).unwrap_or("").to_string(),
                });
            }
            innermost = false;
            current = task.parent;
            if lines.len() > 256 {
                break;
            }
        }
        lines
    }

    fn trace_array(&mut self, task: TaskId) -> RuntimeResult<Entity> {
        let names = self.vm.names;
        let class = self.special().stack_line;
        let mut items = Vec::new();
        for line in self.stack_trace(task) {
            let r = self.new_object(class);
            let module = self.new_string(line.module);
            let function = self.new_string(line.function);
            let text = self.new_string(line.text);
            let heap = &mut self.core.heap;
            heap.set_member(r, names.module, module)?;
            heap.set_member(r, names.function, function)?;
            heap.set_member(r, names.line, Entity::int(line.line as i64))?;
            heap.set_member(r, names.col, Entity::int(line.col as i64))?;
            heap.set_member(r, names.text, text)?;
            items.push(r.into());
        }
        self.new_array(items)
    }

    /// Fill `message` and `stacktrace` of an error object from the running
    /// task.
    pub fn init_error(&mut self, r: ObjectRef, message: Entity) -> RuntimeResult<()> {
        let names = self.vm.names;
        let trace = self.trace_array(self.task)?;
        self.core.heap.set_member(r, names.message, message)?;
        self.core.heap.set_member(r, names.stacktrace, trace)
    }

    pub fn new_error(&mut self, class: ClassId, message: &str) -> ObjectRef {
        let r = self.new_object(class);
        let message = self.new_string(message);
        if let Err(err) = self.init_error(r, message) {
            log::error!("could not build error object: {err}");
        }
        r
    }

    /// The error object a failure is reported as.
    pub fn error_object(&mut self, err: RuntimeError) -> ObjectRef {
        match err {
            RuntimeError::Raised(r) if self.core.heap.is_live(r) => r,
            other => {
                let class = self.special().error;
                self.new_error(class, &other.to_string())
            }
        }
    }

    /// Put an error on the running task's innermost context; the
    /// interpreter unwinds before the next instruction.
    pub fn raise(&mut self, err: RuntimeError) {
        let obj = self.error_object(err);
        match self.current_context() {
            Some(c) => self.core.context_mut(c).error = Some(obj),
            None => {
                let task = self.current_task_mut();
                task.resval = obj.into();
                task.state = TaskState::Error;
            }
        }
    }

    /// `ClassName: message` followed by one line per stack frame.
    pub fn render_error(&self, err: Entity) -> String {
        let names = self.vm.names;
        let Entity::Object(r) = err else {
            return format!("error: {}\n", self.display(err));
        };
        let Ok(object) = self.core.heap.get(r) else {
            return "error: <stale>\n".to_string();
        };
        let mut out = String::new();
        let message = object
            .member(names.message)
            .map(|m| self.display(m))
            .unwrap_or_default();
        let _ = writeln!(out, "{}: {}", self.type_name(err), message);
        let frames = object
            .member(names.stacktrace)
            .and_then(Entity::as_object)
            .and_then(|t| self.core.heap.get(t).ok())
            .and_then(|t| t.as_array().map(<[Entity]>::to_vec))
            .unwrap_or_default();
        for frame in frames {
            let Some(frame) = frame.as_object().and_then(|f| self.core.heap.get(f).ok()) else {
                continue;
            };
            let field = |key| frame.member(key).map(|v| self.display(v)).unwrap_or_default();
            let _ = writeln!(
                out,
                "  at {}.{} ({}:{}) {}",
                field(names.module),
                field(names.function),
                field(names.line),
                field(names.col),
                field(names.text),
            );
        }
        out
    }

    /// The `errorln` path for errors nobody handles.
    pub fn report_uncaught(&mut self, err: Entity) {
        let text = self.render_error(err);
        log::warn!(
            "uncaught error in process {}: {}",
            self.process.id,
            text.lines().next().unwrap_or("")
        );
        self.vm.write_err(&text);
        self.core.uncaught_errors += 1;
    }

    // ── futures ─────────────────────────────────────────────────────

    /// `Some((value, failed))` once the future's task has finished; the
    /// value is memoized into the future on first read.
    pub fn future_state(&mut self, future: ObjectRef) -> RuntimeResult<Option<(Entity, bool)>> {
        let value_key = self.vm.names.value;
        let cell = self
            .core
            .heap
            .get(future)?
            .as_future()
            .ok_or_else(|| RuntimeError::TypeError {
                expected: "Future",
                got: self.type_name(future.into()),
            })?;
        let task = self.core.task(cell.task);
        let failed = task.state == TaskState::Error;
        if cell.memoized {
            let value = self.core.heap.member(future, value_key)?.unwrap_or_default();
            return Ok(Some((value, failed)));
        }
        if !task.state.is_finished() {
            return Ok(None);
        }
        let value = task.resval;
        self.core.heap.set_member(future, value_key, value)?;
        self.core.heap.set_plain_internal(
            future,
            Internal::Future(crate::FutureCell {
                task: cell.task,
                memoized: true,
            }),
        )?;
        Ok(Some((value, failed)))
    }
}
