use std::{thread, time::Duration};

use crate::{
    BackgroundCall, ClassHooks, ClassId, Entity, EntityCopier, FunctionFlags,
    Heap, Internal, InternedId, Machine, Object, ObjectRef, RemoteRef,
    RuntimeError, RuntimeResult, SpecialClasses, lock_pair,
};

use super::Builtin;

pub(super) const PROCESS_HOOKS: ClassHooks = ClassHooks {
    init: Some(init_process),
    delete: Some(delete_process),
};

fn init_process(object: &mut Object) {
    object.set_plain_internal(Internal::Process(None));
}

fn delete_process(object: &mut Object) {
    if let Internal::Process(Some(id)) = object.internal() {
        log::trace!("handle to process {id} collected");
    }
}

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::background("sleep", sleep, FunctionFlags::ASYNC),
    Builtin::native("remote", remote),
    Builtin::native("current_task", current_task),
    Builtin::native("current_context", current_context),
];

const FUTURE: &[Builtin] = &[
    Builtin::native("is_complete", future_is_complete),
    Builtin::native("get", future_get),
];

const TASK: &[Builtin] = &[
    Builtin::native("id", task_id),
    Builtin::native("state", task_state),
];

const CONTEXT: &[Builtin] = &[
    Builtin::native("module", context_module),
    Builtin::native("function", context_function),
];

const PROCESS: &[Builtin] = &[
    Builtin::native("new", process_new),
    Builtin::native("start", process_start),
    Builtin::native("id", process_id),
];

const REMOTE: &[Builtin] = &[Builtin::background("get", remote_get, FunctionFlags::empty())];

pub(super) fn methods(special: &SpecialClasses) -> Vec<(ClassId, &'static [Builtin])> {
    vec![
        (special.future, FUTURE),
        (special.task, TASK),
        (special.context, CONTEXT),
        (special.process, PROCESS),
        (special.remote, REMOTE),
    ]
}

// ── free functions ──────────────────────────────────────────────────

/// `sleep(ms)`; Float milliseconds are accepted.
fn sleep(_: &BackgroundCall, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let millis = match arg.as_primitive() {
        Some(p) if p.as_f64() >= 0.0 => p.as_f64(),
        _ => {
            return Err(RuntimeError::TypeError {
                expected: "non-negative number of milliseconds",
                got: format!("{arg:?}"),
            });
        }
    };
    let duration = Duration::try_from_secs_f64(millis / 1000.0).map_err(|_| {
        RuntimeError::message(format!("cannot sleep for {millis} milliseconds"))
    })?;
    thread::sleep(duration);
    Ok(Entity::None)
}

/// A handle other processes can read members of.
fn remote(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let object = m.expect_object(arg, "object")?;
    let process = m.process.id;
    let r = m.new_object(m.special().remote);
    m.heap()
        .set_plain_internal(r, Internal::Remote(RemoteRef { process, object }))?;
    Ok(r.into())
}

fn current_task(m: &mut Machine<'_>, _: Entity, _: Entity) -> RuntimeResult<Entity> {
    m.task_object(m.task)
}

fn current_context(m: &mut Machine<'_>, _: Entity, _: Entity) -> RuntimeResult<Entity> {
    match m.current_context() {
        Some(c) => m.context_object(c),
        None => Ok(Entity::None),
    }
}

// ── Future ──────────────────────────────────────────────────────────

fn future_is_complete(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Future")?;
    Ok(Entity::from_bool(m.future_state(r)?.is_some()))
}

/// The result without waiting. A failed task yields its error object
/// instead of raising it.
fn future_get(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Future")?;
    m.future_state(r)?
        .map(|(value, _)| value)
        .ok_or_else(|| RuntimeError::message("future is not complete"))
}

// ── Task and Context ────────────────────────────────────────────────

fn task_id(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Task")?;
    match *m.object(r)?.internal() {
        Internal::Task(t) => Ok(Entity::int(t.0 as i64)),
        _ => Ok(Entity::None),
    }
}

fn task_state(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Task")?;
    match *m.object(r)?.internal() {
        Internal::Task(t) => {
            let state = m.core.task(t).state.name();
            Ok(m.new_string(state))
        }
        _ => Ok(Entity::None),
    }
}

fn context_module(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Context")?;
    match *m.object(r)?.internal() {
        Internal::Context(c) => {
            let module = m.core.context(c).module;
            Ok(m.module_object(module)?.into())
        }
        _ => Ok(Entity::None),
    }
}

fn context_function(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Context")?;
    match *m.object(r)?.internal() {
        Internal::Context(c) => match m.core.context(c).function {
            Some(f) => m.function_object(f),
            None => Ok(Entity::None),
        },
        _ => Ok(Entity::None),
    }
}

// ── Process ─────────────────────────────────────────────────────────

fn function_key(m: &Machine<'_>) -> InternedId {
    m.vm.names.function
}

/// `Process(fn)`: remembers the entry function until `start`.
fn process_new(m: &mut Machine<'_>, receiver: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Process")?;
    let key = function_key(m);
    m.set_member(r.into(), key, arg)?;
    Ok(receiver)
}

/// `start(arg)`: run the entry function in a new process; returns a Future
/// over its result.
fn process_start(m: &mut Machine<'_>, receiver: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Process")?;
    if let Internal::Process(Some(id)) = *m.object(r)?.internal() {
        return Err(RuntimeError::message(format!(
            "process {id} has already been started"
        )));
    }
    let key = function_key(m);
    let callee = m
        .heap()
        .member(r, key)?
        .ok_or_else(|| RuntimeError::message("process has no entry function"))?;
    let (id, future) = m.spawn_process(callee, arg)?;
    m.heap().set_plain_internal(r, Internal::Process(Some(id)))?;
    Ok(future)
}

fn process_id(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Process")?;
    match *m.object(r)?.internal() {
        Internal::Process(Some(id)) => Ok(Entity::int(id.0 as i64)),
        _ => Ok(Entity::None),
    }
}

// ── Remote ──────────────────────────────────────────────────────────

fn remote_member(heap: &Heap, object: ObjectRef, key: InternedId, name: &str) -> RuntimeResult<Entity> {
    let object = heap.get(object).map_err(|_| RuntimeError::RemoteGone)?;
    object.member(key).ok_or_else(|| RuntimeError::NoMember {
        target: "remote object".into(),
        member: name.to_string(),
    })
}

/// `get(name)`: copy one member of the remote object into this heap.
fn remote_get(call: &BackgroundCall, receiver: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let name = call.string_arg(arg)?;
    let key = call.vm.strings.add(&name);
    let target = call.with_core(|core| {
        let r = receiver.as_object().ok_or(RuntimeError::StaleReference)?;
        match *core.heap.get(r)?.internal() {
            Internal::Remote(remote) => Ok(remote),
            _ => Err(RuntimeError::TypeError {
                expected: "Remote",
                got: "object".into(),
            }),
        }
    })?;

    if target.process == call.process.id {
        return call.with_core(|core| {
            let value = remote_member(&core.heap, target.object, key, &name)?;
            call.hold(core, value)
        });
    }

    let process = call
        .vm
        .process(target.process)
        .ok_or(RuntimeError::RemoteGone)?;
    let (mut own, other) = lock_pair(&call.process, &process);
    let value = remote_member(&other.heap, target.object, key, &name)?;
    let copied = EntityCopier::new(&other.heap, &mut own.heap, &call.vm.special).copy(value)?;
    drop(other);
    call.hold(&mut own, copied)
}
