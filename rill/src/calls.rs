//! Everything that starts or joins another unit of execution: calls,
//! constructors, background natives, futures, module initialization and
//! process spawning.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    BackgroundCall, BackgroundFn, ClassId, Completion, Context, ContextId,
    ContextKind, Delivery, Entity, EntityCopier, Function, FunctionId,
    FunctionKind, Internal, InternedId, Machine, ModuleId, ModuleState,
    ObjectRef, ProcessCore, ProcessId, RemoteLink, RuntimeError, RuntimeResult, TaskId,
    TaskState, WaitReason,
};

/// What a call produced for the instruction that issued it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallOutcome {
    /// Finished inline; the value goes to resval.
    Value(Entity),
    /// The calling task parked; its resval is delivered when it wakes.
    Suspended,
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Create a task that runs a user function from `ins_pos`.
pub(crate) fn start_call(
    core: &mut ProcessCore,
    function: &Function,
    ins_pos: usize,
    receiver: Entity,
    capture: Option<ContextId>,
    arg: Entity,
    parent: Option<TaskId>,
) -> TaskId {
    let task = core.new_task(parent);
    let mut context = Context::new(
        task,
        ContextKind::Function,
        function.module,
        Some(function.id),
        ins_pos,
    );
    context.self_ = receiver;
    context.previous = capture;
    let context = core.new_context(context);
    let t = core.task_mut(task);
    t.contexts.push(context);
    t.resval = arg;
    task
}

/// Create a task that runs a module's top-level code and mark the module
/// as initializing.
pub(crate) fn start_module_init(
    core: &mut ProcessCore,
    module: ModuleId,
    parent: Option<TaskId>,
) -> TaskId {
    let task = core.new_task(parent);
    let context = core.new_context(Context::new(task, ContextKind::ModuleRoot, module, None, 0));
    let t = core.task_mut(task);
    t.contexts.push(context);
    t.module_init = Some(module);
    core.modules.insert(module, ModuleState::Initializing(task));
    task
}

impl Machine<'_> {
    /// Park the running task until something wakes it.
    pub fn park(&mut self, reason: WaitReason) {
        self.current_task_mut().park(reason);
        self.core.waiting.insert(self.task);
        log::trace!("task {} parked: {reason:?}", self.task.0);
    }

    /// Call `callee` with one argument.
    pub fn call(&mut self, callee: Entity, arg: Entity) -> RuntimeResult<CallOutcome> {
        self.call_with(callee, arg, Delivery::Result)
    }

    /// Call `callee` for its effect only. A suspended caller wakes with its
    /// resval untouched.
    pub fn call_discarding(&mut self, callee: Entity, arg: Entity) -> RuntimeResult<CallOutcome> {
        self.call_with(callee, arg, Delivery::Keep)
    }

    fn call_with(
        &mut self,
        callee: Entity,
        arg: Entity,
        delivery: Delivery,
    ) -> RuntimeResult<CallOutcome> {
        let not_callable = || RuntimeError::NotCallable(self.type_name(callee));
        let Entity::Object(r) = callee else {
            return Err(not_callable());
        };
        match *self.object(r)?.internal() {
            Internal::Class(class) => self.construct(class, arg),
            Internal::Function(function) => {
                self.invoke(function, Entity::None, None, arg, delivery)
            }
            Internal::FunctionRef(bound) => {
                self.invoke(bound.function, bound.receiver, bound.capture, arg, delivery)
            }
            _ => Err(not_callable()),
        }
    }

    pub fn invoke(
        &mut self,
        function: FunctionId,
        receiver: Entity,
        capture: Option<ContextId>,
        arg: Entity,
        delivery: Delivery,
    ) -> RuntimeResult<CallOutcome> {
        let function = self.vm.registry.function(function);
        match function.kind {
            FunctionKind::Native(body) => body(self, receiver, arg).map(CallOutcome::Value),
            FunctionKind::Background(body) => {
                self.launch_background(&function, body, receiver, arg, delivery)
            }
            FunctionKind::User { ins_pos } => {
                let task = start_call(
                    self.core,
                    &function,
                    ins_pos,
                    receiver,
                    capture,
                    arg,
                    Some(self.task),
                );
                self.process.enqueue(task);
                if function.is_async() {
                    return self.future_for(task).map(CallOutcome::Value);
                }
                self.core.task_mut(task).add_dependent(self.task, delivery);
                self.park(WaitReason::WaitingOnCall);
                Ok(CallOutcome::Suspended)
            }
        }
    }

    /// Allocate an instance with every declared field of the class chain
    /// set to None.
    pub fn instantiate(&mut self, class: ClassId) -> RuntimeResult<ObjectRef> {
        let r = self.new_object(class);
        let mut current = Some(class);
        while let Some(c) = current {
            let class = self.vm.registry.class(c);
            for &field in &class.fields {
                if self.core.heap.member(r, field)?.is_none() {
                    self.core.heap.set_member(r, field, Entity::None)?;
                }
            }
            current = class.super_class();
        }
        Ok(r)
    }

    /// The caller always receives the new object, never what `new`
    /// returned.
    fn construct(&mut self, class: ClassId, arg: Entity) -> RuntimeResult<CallOutcome> {
        let object = self.instantiate(class)?;
        let Some(new) = self.vm.registry.find_method(class, self.vm.names.new) else {
            return Ok(CallOutcome::Value(object.into()));
        };
        let function = self.vm.registry.function(new);
        match function.kind {
            FunctionKind::Native(body) => {
                body(self, object.into(), arg)?;
                Ok(CallOutcome::Value(object.into()))
            }
            FunctionKind::Background(_) => Err(RuntimeError::message(
                "constructors cannot run in the background",
            )),
            FunctionKind::User { ins_pos } => {
                let task = start_call(
                    self.core,
                    &function,
                    ins_pos,
                    object.into(),
                    None,
                    arg,
                    Some(self.task),
                );
                self.set_resval(object.into());
                self.core.task_mut(task).add_dependent(self.task, Delivery::Keep);
                self.process.enqueue(task);
                self.park(WaitReason::WaitingOnCall);
                Ok(CallOutcome::Suspended)
            }
        }
    }

    /// Run a background native on the pool behind a carrier task.
    fn launch_background(
        &mut self,
        function: &Function,
        body: BackgroundFn,
        receiver: Entity,
        arg: Entity,
        delivery: Delivery,
    ) -> RuntimeResult<CallOutcome> {
        let carrier = self.core.new_task(Some(self.task));
        self.core.task_mut(carrier).park(WaitReason::WaitingOnFuture);
        self.core.waiting.insert(carrier);

        let mut held = Vec::new();
        for entity in [receiver, arg] {
            if let Entity::Object(r) = entity {
                self.core.heap.root(r)?;
                held.push(r);
            }
        }
        self.core.in_flight += 1;

        let vm = Arc::clone(self.vm);
        let process = Arc::clone(self.process);
        self.vm.pool.submit(Box::new(move || {
            let call = BackgroundCall::new(vm, Arc::clone(&process));
            let result = panic::catch_unwind(AssertUnwindSafe(|| body(&call, receiver, arg)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    log::error!("background call panicked: {message}");
                    Err(RuntimeError::message(format!("background call panicked: {message}")))
                });
            held.extend(call.take_held());
            process.push_completion(Completion {
                task: carrier,
                result,
                held,
            });
        }));

        if function.is_async() {
            return self.future_for(carrier).map(CallOutcome::Value);
        }
        self.core.task_mut(carrier).add_dependent(self.task, delivery);
        self.park(WaitReason::WaitingOnFuture);
        Ok(CallOutcome::Suspended)
    }

    /// `WAIT`: block on a future until its task finishes; anything else
    /// passes through.
    pub fn wait(&mut self, value: Entity) -> RuntimeResult<CallOutcome> {
        let Entity::Object(r) = value else {
            return Ok(CallOutcome::Value(value));
        };
        let Some(cell) = self.object(r)?.as_future() else {
            return Ok(CallOutcome::Value(value));
        };
        match self.future_state(r)? {
            Some((result, false)) => Ok(CallOutcome::Value(result)),
            Some((result, true)) => match result {
                Entity::Object(err) => Err(RuntimeError::Raised(err)),
                _ => Err(RuntimeError::message("awaited task failed")),
            },
            None => {
                self.core.task_mut(cell.task).add_dependent(self.task, Delivery::Result);
                self.park(WaitReason::WaitingOnFuture);
                Ok(CallOutcome::Suspended)
            }
        }
    }

    fn is_self_or_ancestor(&self, task: TaskId) -> bool {
        let mut current = Some(self.task);
        while let Some(t) = current {
            if t == task {
                return true;
            }
            current = self.core.task(t).parent;
        }
        false
    }

    /// `LMDL`: bind a module on the current module object, initializing it
    /// in this process first if needed.
    pub fn load_module(&mut self, name: InternedId) -> RuntimeResult<CallOutcome> {
        let module = self.vm.modules.resolve(self.vm, name)?;
        let loaded = self.module_object(module)?;
        let top = self.current_context().ok_or(RuntimeError::ContextUnderflow)?;
        let current = self.core.context(top).module;
        let importer = self.module_object(current)?;
        self.core.heap.set_member(importer, name, loaded.into())?;

        match self.core.module_state(module) {
            Some(ModuleState::Ready) => Ok(CallOutcome::Value(loaded.into())),
            // circular import: the importer sees a partly initialized module
            Some(ModuleState::Initializing(t)) if self.is_self_or_ancestor(t) => {
                Ok(CallOutcome::Value(loaded.into()))
            }
            Some(ModuleState::Initializing(t)) => {
                self.set_resval(loaded.into());
                self.core.task_mut(t).add_dependent(self.task, Delivery::Keep);
                self.park(WaitReason::WaitingOnCall);
                Ok(CallOutcome::Suspended)
            }
            None => {
                log::debug!(
                    "process {}: initializing module {}",
                    self.process.id,
                    self.name(name)
                );
                let init = start_module_init(self.core, module, Some(self.task));
                self.set_resval(loaded.into());
                self.core.task_mut(init).add_dependent(self.task, Delivery::Keep);
                self.process.enqueue(init);
                self.park(WaitReason::WaitingOnCall);
                Ok(CallOutcome::Suspended)
            }
        }
    }

    /// Start `callee(arg)` as the entry task of a new process and return a
    /// future over its result.
    ///
    /// The callee, the argument and the module variables of the callee's
    /// module are deep-copied into the new heap; the module counts as
    /// initialized there.
    pub fn spawn_process(
        &mut self,
        callee: Entity,
        arg: Entity,
    ) -> RuntimeResult<(ProcessId, Entity)> {
        let r = self.expect_object(callee, "Function")?;
        let (function, receiver) = match *self.object(r)?.internal() {
            Internal::Function(f) => (f, Entity::None),
            Internal::FunctionRef(bound) => (bound.function, bound.receiver),
            _ => return Err(RuntimeError::NotCallable(self.type_name(callee))),
        };
        let function = self.vm.registry.function(function);
        let FunctionKind::User { ins_pos } = function.kind else {
            return Err(RuntimeError::message(
                "a process must start with a user-defined function",
            ));
        };

        let source_module = self.module_object(function.module)?;
        let child = self.vm.new_process()?;
        let carrier = self.core.new_task(Some(self.task));
        self.core.task_mut(carrier).park(WaitReason::WaitingOnFuture);
        self.core.waiting.insert(carrier);

        let entry = {
            // the child's id is higher, so it locks after us
            let mut child_core = child.lock();
            let child_core = &mut *child_core;
            let mut copier = EntityCopier::new(&self.core.heap, &mut child_core.heap, self.special());
            let receiver = copier.copy(receiver)?;
            let arg = copier.copy(arg)?;
            let variables: Vec<(InternedId, Entity)> =
                self.core.heap.get(source_module)?.members().collect();
            let variables = variables
                .into_iter()
                .map(|(name, value)| Ok((name, copier.copy(value)?)))
                .collect::<RuntimeResult<Vec<_>>>()?;
            drop(copier);

            let target_module = crate::reflect::module_object(
                &mut child_core.heap,
                self.special(),
                function.module,
            )?;
            for (name, value) in variables {
                child_core.heap.set_member(target_module, name, value)?;
            }
            child_core.modules.insert(function.module, ModuleState::Ready);

            let entry = start_call(child_core, &function, ins_pos, receiver, None, arg, None);
            let task = child_core.task_mut(entry);
            task.remote = Some(RemoteLink {
                process: Arc::clone(self.process),
                task: carrier,
            });
            child_core.entry_task = Some(entry);
            entry
        };
        child.enqueue(entry);
        log::info!(
            "process {} spawned process {} running {}",
            self.process.id,
            child.id,
            self.name(function.name)
        );
        let id = child.id;
        self.vm.spawn_process_thread(child);
        Ok((id, self.future_for(carrier)?))
    }

    /// Finish a task of this process: settle module state, wake dependents
    /// with the result, and report errors nobody is waiting for.
    pub fn finish_task(&mut self, task: TaskId) {
        let t = self.core.task_mut(task);
        let state = t.state;
        let resval = t.resval;
        let dependents = std::mem::take(&mut t.dependents);
        let observed = t.observed;
        let remote = t.remote.is_some();
        if let Some(module) = t.module_init.take() {
            self.core.modules.insert(module, ModuleState::Ready);
        }
        self.core.waiting.remove(&task);
        self.core.release_task_contexts(task);
        log::trace!("task {} finished: {}", task.0, state.name());

        let failed = state == TaskState::Error;
        for dependent in &dependents {
            let waiter = self.core.task_mut(dependent.task);
            if waiter.state.is_finished() {
                continue;
            }
            if failed {
                let err = resval.as_object();
                match (waiter.top_context(), err) {
                    (Some(c), Some(err)) => self.core.context_mut(c).error = Some(err),
                    _ => {
                        waiter.state = TaskState::Error;
                        waiter.resval = resval;
                        continue;
                    }
                }
            } else if dependent.delivery == Delivery::Result {
                waiter.resval = resval;
            }
            self.wake(dependent.task);
        }

        if failed && dependents.is_empty() && !observed && !remote {
            self.report_uncaught(resval);
        }
    }

    /// Move a parked task back onto the run queue.
    pub fn wake(&mut self, task: TaskId) {
        let t = self.core.task_mut(task);
        if t.state.is_finished() {
            return;
        }
        t.state = TaskState::Running;
        t.wait_reason = WaitReason::NotWaiting;
        self.core.waiting.remove(&task);
        self.process.enqueue(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassHooks, FunctionFlags, Heap, HeapSettings, InternedStrings, Registry, Tape};

    #[test]
    fn start_call_sets_up_a_function_context() {
        let strings = InternedStrings::new();
        let registry = Arc::new(Registry::new());
        let module = registry.add_module(&strings, "m", Tape::default()).unwrap();
        let class = registry.add_class(strings.add("C"), module, None, vec![], ClassHooks::default());
        let f = registry.add_function(
            strings.add("f"),
            module,
            FunctionKind::User { ins_pos: 7 },
            FunctionFlags::empty(),
            None,
        );
        let mut core = ProcessCore::new(Heap::new(HeapSettings::default(), registry.clone()));
        let receiver = core.heap.allocate(class);
        let task = start_call(
            &mut core,
            &registry.function(f),
            7,
            receiver.into(),
            None,
            Entity::int(3),
            None,
        );
        let t = core.task(task);
        assert_eq!(t.state, TaskState::New);
        assert_eq!(t.resval, Entity::int(3));
        let ctx = core.context(t.top_context().unwrap());
        assert_eq!(ctx.ip, 7);
        assert_eq!(ctx.kind, ContextKind::Function);
        assert_eq!(ctx.function, Some(f));
        assert!(ctx.self_.same_object(receiver.into()));
    }

    #[test]
    fn module_init_marks_the_module() {
        let strings = InternedStrings::new();
        let registry = Arc::new(Registry::new());
        let module = registry.add_module(&strings, "m", Tape::default()).unwrap();
        let mut core = ProcessCore::new(Heap::new(HeapSettings::default(), registry));
        let task = start_module_init(&mut core, module, None);
        assert_eq!(core.module_state(module), Some(ModuleState::Initializing(task)));
        assert_eq!(core.task(task).module_init, Some(module));
    }
}
