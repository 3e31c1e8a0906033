use std::{collections::VecDeque, fmt, sync::Arc};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    Context, ContextId, Entity, External, Heap, ModuleId, ObjectRef,
    RootProvider, RuntimeError, RuntimeResult, Task, TaskId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lazy module initialization, tracked per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Initializing(TaskId),
    Ready,
}

/// Result of a background native call, handed back to the scheduler.
#[derive(Debug)]
pub struct Completion {
    pub task: TaskId,
    pub result: RuntimeResult<Entity>,
    /// Objects rooted for the duration of the call.
    pub held: Vec<ObjectRef>,
}

#[derive(Debug, Default)]
pub struct Inbox {
    pub run_queue: VecDeque<TaskId>,
    pub completions: Vec<Completion>,
    /// Set when another thread changed this process's waiting set.
    pub poked: bool,
}

/// Everything guarded by the process lock: the heap and the task and
/// context arenas that reference it.
pub struct ProcessCore {
    pub heap: Heap,
    tasks: Vec<Task>,
    contexts: Vec<Context>,
    free_contexts: Vec<ContextId>,
    pub waiting: AHashSet<TaskId>,
    pub modules: AHashMap<ModuleId, ModuleState>,
    /// Background calls submitted and not yet drained.
    pub in_flight: usize,
    pub exit_value: Option<Entity>,
    /// The process reflection object, rooted.
    pub reflection: Option<ObjectRef>,
    /// Raised in the next task to run (out of memory after collection).
    pub pending_fault: Option<RuntimeError>,
    pub entry_task: Option<TaskId>,
    pub uncaught_errors: usize,
}

impl ProcessCore {
    pub fn new(heap: Heap) -> Self {
        Self {
            heap,
            tasks: Vec::new(),
            contexts: Vec::new(),
            free_contexts: Vec::new(),
            waiting: AHashSet::new(),
            modules: AHashMap::new(),
            in_flight: 0,
            exit_value: None,
            reflection: None,
            pending_fault: None,
            entry_task: None,
            uncaught_errors: 0,
        }
    }

    // ── tasks ───────────────────────────────────────────────────────

    pub fn new_task(&mut self, parent: Option<TaskId>) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(Task::new(id, parent));
        log::trace!("task {} created (parent {parent:?})", id.0);
        id
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0 as usize]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0 as usize]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ── contexts ────────────────────────────────────────────────────

    pub fn new_context(&mut self, context: Context) -> ContextId {
        match self.free_contexts.pop() {
            Some(id) => {
                self.contexts[id.0 as usize] = context;
                id
            }
            None => {
                let id = ContextId(self.contexts.len() as u32);
                self.contexts.push(context);
                id
            }
        }
    }

    pub fn context(&self, id: ContextId) -> &Context {
        &self.contexts[id.0 as usize]
    }

    pub fn context_mut(&mut self, id: ContextId) -> &mut Context {
        &mut self.contexts[id.0 as usize]
    }

    /// Return a popped context to the arena unless something still refers
    /// to it.
    pub fn release_context(&mut self, id: ContextId) {
        let context = &mut self.contexts[id.0 as usize];
        if context.pinned {
            return;
        }
        context.locals.clear();
        context.error = None;
        context.self_ = Entity::None;
        self.free_contexts.push(id);
    }

    /// Keep `id` and its lexical chain alive for a closure or a reflection
    /// object.
    pub fn pin_context_chain(&mut self, id: ContextId) {
        let mut current = Some(id);
        while let Some(c) = current {
            let context = &mut self.contexts[c.0 as usize];
            if context.pinned {
                break;
            }
            context.pinned = true;
            current = context.previous;
        }
    }

    /// Pop every context of a finished task.
    pub fn release_task_contexts(&mut self, task: TaskId) {
        let contexts = std::mem::take(&mut self.task_mut(task).contexts);
        for c in contexts.into_iter().rev() {
            self.release_context(c);
        }
    }

    // ── modules ─────────────────────────────────────────────────────

    pub fn module_state(&self, module: ModuleId) -> Option<ModuleState> {
        self.modules.get(&module).copied()
    }

    // ── collection ──────────────────────────────────────────────────

    /// Run a full collection with this core's tasks and contexts as roots.
    pub fn collect_garbage(&mut self) -> usize {
        let ProcessCore {
            heap,
            tasks,
            contexts,
            exit_value,
            entry_task,
            ..
        } = self;
        // the entry task's result outlives the task for the exit status
        let entry_result = (*entry_task).and_then(|t| tasks.get(t.0 as usize)).map(|t| t.resval);
        let mut roots = CoreRoots {
            tasks: tasks.as_slice(),
            contexts: contexts.as_slice(),
            extra: exit_value.iter().copied().chain(entry_result).collect(),
            visited: AHashSet::new(),
        };
        heap.collect_garbage(&mut roots)
    }
}

impl fmt::Debug for ProcessCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCore")
            .field("heap", &self.heap)
            .field("tasks", &self.tasks.len())
            .field("contexts", &self.contexts.len())
            .field("waiting", &self.waiting.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

struct CoreRoots<'a> {
    tasks: &'a [Task],
    contexts: &'a [Context],
    extra: Vec<Entity>,
    visited: AHashSet<ContextId>,
}

impl CoreRoots<'_> {
    fn visit_chain(&mut self, start: ContextId, visitor: &mut dyn FnMut(Entity)) {
        let mut current = Some(start);
        while let Some(id) = current {
            if !self.visited.insert(id) {
                break;
            }
            let context = &self.contexts[id.0 as usize];
            context.visit_entities(visitor);
            current = context.previous;
        }
    }
}

impl RootProvider for CoreRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Entity)) {
        self.extra.iter().for_each(|&e| visitor(e));
        let tasks = self.tasks;
        for task in tasks.iter().filter(|t| !t.state.is_finished()) {
            task.visit_entities(visitor);
            for &c in &task.contexts {
                self.visit_chain(c, visitor);
            }
        }
    }

    fn visit_external(&mut self, external: External, visitor: &mut dyn FnMut(Entity)) {
        match external {
            External::Context(c) => self.visit_chain(c, visitor),
            External::Task(t) => {
                if let Some(task) = self.tasks.get(t.0 as usize) {
                    visitor(task.resval);
                }
            }
        }
    }
}

/// An OS-thread-backed execution unit owning one heap.
pub struct Process {
    pub id: ProcessId,
    core: Mutex<ProcessCore>,
    inbox: Mutex<Inbox>,
    wakeup: Condvar,
}

impl Process {
    pub fn new(id: ProcessId, heap: Heap) -> Arc<Self> {
        Arc::new(Self {
            id,
            core: Mutex::new(ProcessCore::new(heap)),
            inbox: Mutex::new(Inbox::default()),
            wakeup: Condvar::new(),
        })
    }

    /// Acquire the heap lock. Lock order: core before inbox, and across
    /// processes by ascending id.
    pub fn lock(&self) -> MutexGuard<'_, ProcessCore> {
        self.core.lock()
    }

    pub fn enqueue(&self, task: TaskId) {
        self.inbox.lock().run_queue.push_back(task);
        self.wakeup.notify_one();
    }

    pub fn push_completion(&self, completion: Completion) {
        self.inbox.lock().completions.push(completion);
        self.wakeup.notify_one();
    }

    /// Wake the scheduler so it re-checks whether it is done.
    pub fn poke(&self) {
        self.inbox.lock().poked = true;
        self.wakeup.notify_one();
    }

    pub fn pop_runnable(&self) -> Option<TaskId> {
        self.inbox.lock().run_queue.pop_front()
    }

    pub fn take_completions(&self) -> Vec<Completion> {
        std::mem::take(&mut self.inbox.lock().completions)
    }

    pub fn run_queue_len(&self) -> usize {
        self.inbox.lock().run_queue.len()
    }

    pub fn is_queued(&self, task: TaskId) -> bool {
        self.inbox.lock().run_queue.contains(&task)
    }

    /// Park the scheduler thread until there is something to run or drain.
    pub fn wait_for_work(&self) {
        let mut inbox = self.inbox.lock();
        while inbox.run_queue.is_empty() && inbox.completions.is_empty() && !inbox.poked {
            self.wakeup.wait(&mut inbox);
        }
        inbox.poked = false;
    }

    pub fn has_work(&self) -> bool {
        let inbox = self.inbox.lock();
        !inbox.run_queue.is_empty() || !inbox.completions.is_empty()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").field("id", &self.id).finish()
    }
}

/// Lock two distinct processes in ascending id order and hand the guards
/// back as `(first, second)` in argument order.
pub fn lock_pair<'a>(
    first: &'a Process,
    second: &'a Process,
) -> (MutexGuard<'a, ProcessCore>, MutexGuard<'a, ProcessCore>) {
    debug_assert_ne!(first.id, second.id);
    if first.id < second.id {
        let a = first.lock();
        let b = second.lock();
        (a, b)
    } else {
        let b = second.lock();
        let a = first.lock();
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextKind, HeapSettings, InternedStrings, Registry, Tape};

    fn core() -> (ProcessCore, ModuleId, crate::ClassId) {
        let strings = InternedStrings::new();
        let registry = Arc::new(Registry::new());
        let module = registry
            .add_module(&strings, "m", Tape::default())
            .expect("module");
        let class = registry.add_class(
            strings.add("Thing"),
            module,
            None,
            Vec::new(),
            Default::default(),
        );
        (
            ProcessCore::new(Heap::new(HeapSettings::default(), registry)),
            module,
            class,
        )
    }

    #[test]
    fn live_task_state_is_a_root() {
        let (mut core, module, class) = core();
        let strings = InternedStrings::new();
        let on_stack = core.heap.allocate(class);
        let in_local = core.heap.allocate(class);
        let in_done = core.heap.allocate(class);
        let garbage = core.heap.allocate(class);

        let live = core.new_task(None);
        let mut ctx = Context::new(live, ContextKind::Function, module, None, 0);
        ctx.locals.insert(strings.add("x"), in_local.into());
        let ctx = core.new_context(ctx);
        core.task_mut(live).contexts.push(ctx);
        core.task_mut(live).stack.push(on_stack.into());

        let done = core.new_task(None);
        core.task_mut(done).resval = in_done.into();
        core.task_mut(done).state = crate::TaskState::Complete;

        assert_eq!(core.collect_garbage(), 2);
        assert!(core.heap.is_live(on_stack));
        assert!(core.heap.is_live(in_local));
        assert!(!core.heap.is_live(in_done));
        assert!(!core.heap.is_live(garbage));
    }

    #[test]
    fn released_contexts_are_reused_unless_pinned() {
        let (mut core, module, _) = core();
        let task = core.new_task(None);
        let a = core.new_context(Context::new(task, ContextKind::Block, module, None, 0));
        let b = core.new_context(Context::new(task, ContextKind::Block, module, None, 0));
        core.pin_context_chain(b);
        core.release_context(a);
        core.release_context(b);
        let c = core.new_context(Context::new(task, ContextKind::Block, module, None, 0));
        assert_eq!(c, a);
        let d = core.new_context(Context::new(task, ContextKind::Block, module, None, 0));
        assert_ne!(d, b);
    }

    #[test]
    fn pair_locking_orders_by_id() {
        let (core_a, ..) = core();
        let (core_b, ..) = core();
        let low = Arc::new(Process {
            id: ProcessId(1),
            core: Mutex::new(core_a),
            inbox: Mutex::new(Inbox::default()),
            wakeup: Condvar::new(),
        });
        let high = Arc::new(Process {
            id: ProcessId(2),
            core: Mutex::new(core_b),
            inbox: Mutex::new(Inbox::default()),
            wakeup: Condvar::new(),
        });
        let (h, l) = lock_pair(&high, &low);
        assert_eq!(h.task_count(), 0);
        assert_eq!(l.task_count(), 0);
    }
}
