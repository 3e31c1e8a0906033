use std::{fmt, sync::Arc};

use crate::{ContextId, Entity, ModuleId, Process};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Running,
    Waiting,
    Complete,
    Error,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Complete => "complete",
            TaskState::Error => "error",
        }
    }
}

/// Why a task sits in the waiting set. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    NotWaiting,
    WaitingToStart,
    WaitingOnCall,
    WaitingOnFuture,
}

/// What a dependent receives when the task it waits on completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The result replaces the dependent's resval.
    Result,
    /// The dependent's resval is left alone (constructors, module init, stores).
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependent {
    pub task: TaskId,
    pub delivery: Delivery,
}

/// Completion of this task must be copied into a task of another process.
#[derive(Clone)]
pub struct RemoteLink {
    pub process: Arc<Process>,
    pub task: TaskId,
}

impl fmt::Debug for RemoteLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLink")
            .field("process", &self.process.id)
            .field("task", &self.task)
            .finish()
    }
}

/// A cooperative unit of execution.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub wait_reason: WaitReason,
    pub contexts: Vec<ContextId>,
    pub stack: Vec<Entity>,
    pub resval: Entity,
    pub parent: Option<TaskId>,
    pub dependents: Vec<Dependent>,
    pub remote: Option<RemoteLink>,
    /// A Future refers to this task, so an error is not reported as
    /// uncaught.
    pub observed: bool,
    /// Set when this task runs a module's top-level code.
    pub module_init: Option<ModuleId>,
}

impl Task {
    pub fn new(id: TaskId, parent: Option<TaskId>) -> Self {
        Self {
            id,
            state: TaskState::New,
            wait_reason: WaitReason::WaitingToStart,
            contexts: Vec::new(),
            stack: Vec::new(),
            resval: Entity::None,
            parent,
            dependents: Vec::new(),
            remote: None,
            observed: false,
            module_init: None,
        }
    }

    pub fn top_context(&self) -> Option<ContextId> {
        self.contexts.last().copied()
    }

    pub fn park(&mut self, reason: WaitReason) {
        self.state = TaskState::Waiting;
        self.wait_reason = reason;
    }

    pub fn add_dependent(&mut self, task: TaskId, delivery: Delivery) {
        self.dependents.push(Dependent { task, delivery });
    }

    /// Operand stack and register; contexts are visited separately.
    pub fn visit_entities(&self, visitor: &mut dyn FnMut(Entity)) {
        visitor(self.resval);
        self.stack.iter().for_each(|&e| visitor(e));
    }
}
