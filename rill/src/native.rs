use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    Entity, Internal, Machine, ObjectRef, Process, ProcessCore, RuntimeError,
    RuntimeResult, VmShared,
};

/// A native function run inline on the scheduler thread, with the heap lock
/// held. Receives the receiver (`self`, None for free functions) and the
/// argument entity.
pub type NativeFn = fn(&mut Machine<'_>, Entity, Entity) -> RuntimeResult<Entity>;

/// A native function run on the background pool. It holds no lock when
/// called and must go through [`BackgroundCall::with_core`] to touch the
/// heap.
pub type BackgroundFn = fn(&BackgroundCall, Entity, Entity) -> RuntimeResult<Entity>;

/// Handle a background native gets to the process that called it.
pub struct BackgroundCall {
    pub vm: Arc<VmShared>,
    pub process: Arc<Process>,
    held: Mutex<Vec<ObjectRef>>,
}

impl BackgroundCall {
    pub fn new(vm: Arc<VmShared>, process: Arc<Process>) -> Self {
        Self {
            vm,
            process,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` under the calling process's heap lock.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut ProcessCore) -> R) -> R {
        let mut core = self.process.lock();
        f(&mut core)
    }

    /// Root an object created off-thread until the call's completion has
    /// been delivered, so a collection in between cannot take it.
    pub fn hold(&self, core: &mut ProcessCore, entity: Entity) -> RuntimeResult<Entity> {
        if let Entity::Object(r) = entity {
            core.heap.root(r)?;
            self.held.lock().push(r);
        }
        Ok(entity)
    }

    pub fn new_string(&self, value: impl Into<String>) -> RuntimeResult<Entity> {
        let value = value.into();
        self.with_core(|core| {
            let r = core.heap.new_string(self.vm.special.string, value);
            self.hold(core, r.into())
        })
    }

    /// Read a String argument.
    pub fn string_arg(&self, entity: Entity) -> RuntimeResult<String> {
        self.with_core(|core| match entity {
            Entity::Object(r) => match core.heap.get(r)?.internal() {
                Internal::String(s) => Ok(s.clone()),
                _ => Err(RuntimeError::TypeError {
                    expected: "String",
                    got: "object".into(),
                }),
            },
            other => Err(RuntimeError::TypeError {
                expected: "String",
                got: format!("{other:?}"),
            }),
        })
    }

    pub(crate) fn take_held(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut self.held.lock())
    }
}
