//! The instruction loop.
//!
//! A task runs until it finishes or parks. The cursor of a context always
//! points at the next instruction to execute; a suspending instruction
//! advances it before control returns to the scheduler, so the task resumes
//! right after the instruction once it is woken.
use std::sync::Arc;

use crate::{
    CallOutcome, Context, ContextId, ContextKind, Entity, Instruction,
    Internal, InternedId, Machine, ModuleId, Op, Operand, Primitive,
    RuntimeError, RuntimeResult, Tape, TaskState, WaitReason, ops,
};

/// How the cursor moves after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Jump(usize),
    /// The instruction already placed every cursor itself.
    Stay,
    Suspend,
    Finished,
}

/// Run the machine's task until it completes, fails or parks.
pub fn execute_task(m: &mut Machine<'_>) {
    if m.current_task().state.is_finished() {
        return;
    }
    {
        let task = m.current_task_mut();
        task.state = TaskState::Running;
        task.wait_reason = WaitReason::NotWaiting;
    }
    if let Some(fault) = m.core.pending_fault.take() {
        m.raise(fault);
    }

    let mut tape_module: Option<ModuleId> = None;
    let mut tape: Arc<Tape> = Arc::default();
    loop {
        let Some(top) = m.current_context() else {
            m.current_task_mut().state = TaskState::Complete;
            return;
        };
        let context = m.core.context(top);
        if context.error.is_some() {
            if unwind(m) {
                continue;
            }
            return;
        }
        let (module, ip) = (context.module, context.ip);
        if m.core.heap.should_collect() && safepoint(m) {
            continue;
        }
        if tape_module != Some(module) {
            tape = m.vm.registry.module(module).tape.clone();
            tape_module = Some(module);
        }
        // running off the end is an implicit return
        let Some(&ins) = tape.get(ip) else {
            m.current_task_mut().state = TaskState::Complete;
            return;
        };

        match step(m, top, ip, ins) {
            Ok(Flow::Next) => m.core.context_mut(top).ip = ip + 1,
            Ok(Flow::Jump(target)) => m.core.context_mut(top).ip = target,
            Ok(Flow::Stay) => (),
            Ok(Flow::Suspend) => {
                m.core.context_mut(top).ip = ip + 1;
                return;
            }
            Ok(Flow::Finished) => {
                m.current_task_mut().state = TaskState::Complete;
                return;
            }
            Err(err) => m.raise(err),
        }
    }
}

/// Walk the context stack outward to the nearest handler. Returns false
/// when the task ran out of contexts and failed.
fn unwind(m: &mut Machine<'_>) -> bool {
    loop {
        let Some(top) = m.current_context() else {
            m.current_task_mut().state = TaskState::Error;
            return false;
        };
        let context = m.core.context_mut(top);
        let Some(err) = context.error.take() else {
            return true;
        };
        if let Some(catch) = context.catch_ins.take() {
            context.ip = catch;
            m.set_resval(err.into());
            return true;
        }
        m.current_task_mut().contexts.pop();
        m.core.release_context(top);
        match m.current_context() {
            Some(next) => m.core.context_mut(next).error = Some(err),
            None => {
                let task = m.current_task_mut();
                task.resval = err.into();
                task.state = TaskState::Error;
                log::trace!("task {} failed", task.id.0);
                return false;
            }
        }
    }
}

/// Collect between instructions once the heap crosses its threshold.
/// Returns true when the heap is still over its limit and an out-of-memory
/// error was raised in the running task.
fn safepoint(m: &mut Machine<'_>) -> bool {
    let reclaimed = m.core.collect_garbage();
    log::trace!("process {}: safepoint collected {reclaimed} objects", m.process.id);
    match m.core.heap.over_limit() {
        Some(err) => {
            log::error!("process {}: {err}", m.process.id);
            m.raise(err);
            true
        }
        None => false,
    }
}

fn jump_target(ip: usize, operand: Operand) -> RuntimeResult<usize> {
    operand
        .as_int()
        .and_then(|k| usize::try_from(ip as i64 + k).ok())
        .ok_or(RuntimeError::MalformedInstruction {
            ins: ip,
            reason: "bad jump offset",
        })
}

fn identifier(ip: usize, operand: Operand) -> RuntimeResult<InternedId> {
    operand.as_id().ok_or(RuntimeError::MalformedInstruction {
        ins: ip,
        reason: "expected an identifier",
    })
}

/// Operand as a value: literals as themselves, strings freshly allocated,
/// identifiers resolved.
fn operand_value(m: &mut Machine<'_>, operand: Operand) -> RuntimeResult<Entity> {
    match operand {
        Operand::None => Ok(Entity::None),
        Operand::Primitive(p) => Ok(p.into()),
        Operand::Str(id) => {
            let text = m.name(id);
            Ok(m.new_string(&*text))
        }
        Operand::Id(id) => m.resolve(id),
    }
}

fn outcome(m: &mut Machine<'_>, outcome: CallOutcome) -> Flow {
    match outcome {
        CallOutcome::Value(value) => {
            m.set_resval(value);
            Flow::Next
        }
        CallOutcome::Suspended => Flow::Suspend,
    }
}

fn step(m: &mut Machine<'_>, top: ContextId, ip: usize, ins: Instruction) -> RuntimeResult<Flow> {
    let Instruction { op, operand } = ins;
    match op {
        Op::Nop => (),

        Op::Res => {
            let value = match operand {
                Operand::None => m.pop()?,
                operand => operand_value(m, operand)?,
            };
            m.set_resval(value);
        }
        Op::Push => {
            let value = match operand {
                Operand::None => m.resval(),
                operand => operand_value(m, operand)?,
            };
            m.push(value);
        }
        Op::Peek => {
            let depth = operand.as_int().unwrap_or(0) as usize;
            let value = m.peek(depth)?;
            m.set_resval(value);
        }
        Op::Dup => {
            let value = m.peek(0)?;
            m.push(value);
        }
        Op::Pnil => m.push(Entity::None),
        Op::Rnil => m.set_resval(Entity::None),

        Op::Fld => {
            let name = identifier(ip, operand)?;
            let target = m.pop()?;
            let value = m.resval();
            m.set_member(target, name, value)?;
        }
        Op::Let => {
            let value = m.resval();
            m.bind(identifier(ip, operand)?, value)?;
        }
        Op::Set => {
            let value = m.resval();
            m.assign(identifier(ip, operand)?, value)?;
        }
        Op::Get | Op::Gtsh => {
            let target = m.resval();
            let value = m.get_member(target, identifier(ip, operand)?)?;
            m.set_resval(value);
            if op == Op::Gtsh {
                m.push(value);
            }
        }

        Op::Call => {
            let callee = match operand {
                Operand::Id(id) => m.resolve(id)?,
                _ => m.pop()?,
            };
            let arg = m.resval();
            let result = m.call(callee, arg)?;
            return Ok(outcome(m, result));
        }
        Op::Clln => {
            let callee = match operand {
                Operand::Id(id) => m.resolve(id)?,
                _ => m.resval(),
            };
            let result = m.call(callee, Entity::None)?;
            return Ok(outcome(m, result));
        }

        Op::Jmp => return jump_target(ip, operand).map(Flow::Jump),
        Op::If | Op::Ifn => {
            let truthy = m.resval().is_truthy();
            if truthy == (op == Op::If) {
                return jump_target(ip, operand).map(Flow::Jump);
            }
        }
        Op::Ctch => {
            let target = jump_target(ip, operand)?;
            m.core.context_mut(top).catch_ins = Some(target);
        }
        Op::Ret => {
            if operand != Operand::None {
                let value = operand_value(m, operand)?;
                m.set_resval(value);
            }
            return Ok(Flow::Finished);
        }
        Op::Exit => {
            if operand != Operand::None {
                let value = operand_value(m, operand)?;
                m.set_resval(value);
            }
            m.core.exit_value = Some(m.resval());
            return Ok(Flow::Finished);
        }
        Op::Nblk => {
            let parent = m.core.context(top);
            let mut block = Context::new(
                m.task,
                ContextKind::Block,
                parent.module,
                parent.function,
                ip + 1,
            );
            block.self_ = parent.self_;
            block.previous = Some(top);
            let block = m.core.new_context(block);
            m.current_task_mut().contexts.push(block);
            return Ok(Flow::Stay);
        }
        Op::Bblk => {
            let contexts = &m.current_task().contexts;
            if m.core.context(top).kind != ContextKind::Block || contexts.len() < 2 {
                return Err(RuntimeError::ContextUnderflow);
            }
            let parent = contexts[contexts.len() - 2];
            m.current_task_mut().contexts.pop();
            m.core.release_context(top);
            m.core.context_mut(parent).ip = ip + 1;
            return Ok(Flow::Stay);
        }

        Op::Anew | Op::Tupl => {
            let count = operand.as_int().unwrap_or(0) as usize;
            let items = m.pop_n(count)?;
            let value = if op == Op::Anew {
                m.new_array(items)?
            } else {
                m.new_tuple(items)?
            };
            m.set_resval(value);
        }
        Op::Aidx => {
            let collection = m.pop()?;
            let index = m.resval();
            if let Some(value) = fast_index(m, collection, index)? {
                m.set_resval(value);
            } else {
                let method = m.get_member(collection, m.vm.names.index)?;
                let result = m.call(method, index)?;
                return Ok(outcome(m, result));
            }
        }
        Op::Aset => {
            let index = m.pop()?;
            let collection = m.pop()?;
            let value = m.resval();
            if !fast_store(m, collection, index, value)? {
                let method = m.get_member(collection, m.vm.names.set)?;
                let pair = m.new_tuple(vec![index, value])?;
                let result = m.call_discarding(method, pair)?;
                // resval stays `value` whatever `__set__` returns
                m.set_resval(value);
                if result == CallOutcome::Suspended {
                    return Ok(Flow::Suspend);
                }
            }
        }
        Op::Tget | Op::Tgte => {
            let index = operand.as_int().unwrap_or(0);
            let top_value = m.peek(0)?;
            match tuple_element(m, top_value, index)? {
                Some(value) => m.set_resval(value),
                None if op == Op::Tgte => (),
                None => {
                    return Err(RuntimeError::MissingArgument(index as usize));
                }
            }
        }
        Op::Tlen => {
            let top_value = m.peek(0)?;
            let len = match top_value {
                Entity::None => 0,
                Entity::Object(r) => m.object(r)?.as_tuple().map_or(1, <[Entity]>::len),
                Entity::Primitive(_) => 1,
            };
            m.set_resval(Entity::int(len as i64));
        }

        Op::Not => {
            let value = m.resval();
            m.set_resval(Entity::from_bool(!value.is_truthy()));
        }
        Op::Inc | Op::Dec => {
            let delta = Primitive::Int(if op == Op::Inc { 1 } else { -1 });
            let current = match operand {
                Operand::Id(id) => m.resolve(id)?,
                _ => m.resval(),
            };
            let Entity::Primitive(p) = current else {
                return Err(RuntimeError::UnsupportedOperands {
                    op: op.name(),
                    lhs: m.type_name(current),
                    rhs: "Int".into(),
                });
            };
            let updated: Entity = ops::arithmetic(Op::Add, p, delta)?.into();
            if let Operand::Id(id) = operand {
                m.assign(id, updated)?;
            }
            m.set_resval(updated);
        }
        op if op.is_binary() => {
            let (lhs, rhs) = match operand {
                Operand::None => (m.pop()?, m.resval()),
                operand => (m.resval(), operand_value(m, operand)?),
            };
            let value = binary(m, op, lhs, rhs)?;
            m.set_resval(value);
        }

        Op::Is => {
            let (value, class) = match operand {
                Operand::Id(id) => (m.resval(), m.resolve(id)?),
                _ => (m.pop()?, m.resval()),
            };
            let class = match class {
                Entity::Object(r) => match *m.object(r)?.internal() {
                    Internal::Class(c) => c,
                    _ => {
                        return Err(RuntimeError::TypeError {
                            expected: "Class",
                            got: m.type_name(class),
                        });
                    }
                },
                other => {
                    return Err(RuntimeError::TypeError {
                        expected: "Class",
                        got: m.type_name(other),
                    });
                }
            };
            let is = m.is_instance(value, class);
            m.set_resval(Entity::from_bool(is));
        }
        Op::Lmdl => {
            let result = m.load_module(identifier(ip, operand)?)?;
            return Ok(outcome(m, result));
        }
        Op::Rais => {
            let value = m.resval();
            if !m.is_instance(value, m.special().error) {
                return Err(RuntimeError::NotAnError(m.type_name(value)));
            }
            let err = m.expect_object(value, "Error")?;
            return Err(RuntimeError::Raised(err));
        }
        Op::Wait => {
            let value = m.resval();
            let result = m.wait(value)?;
            return Ok(outcome(m, result));
        }

        _ => {
            return Err(RuntimeError::MalformedInstruction {
                ins: ip,
                reason: "unknown opcode",
            });
        }
    }
    Ok(Flow::Next)
}

/// Binary operators, including string concatenation and the null
/// coalescing form of `BOR`.
pub(crate) fn binary(m: &mut Machine<'_>, op: Op, lhs: Entity, rhs: Entity) -> RuntimeResult<Entity> {
    match op {
        Op::And => return Ok(Entity::from_bool(lhs.is_truthy() && rhs.is_truthy())),
        Op::Or => return Ok(Entity::from_bool(lhs.is_truthy() || rhs.is_truthy())),
        Op::Eq => return Ok(Entity::from_bool(m.entity_eq(lhs, rhs))),
        Op::Neq => return Ok(Entity::from_bool(!m.entity_eq(lhs, rhs))),
        Op::Bor if lhs.as_primitive().is_none() || rhs.as_primitive().is_none() => {
            return Ok(if lhs.is_none() { rhs } else { lhs });
        }
        _ => (),
    }

    if let (Entity::Primitive(a), Entity::Primitive(b)) = (lhs, rhs) {
        if ops::is_comparison(op) {
            return Ok(Entity::from_bool(ops::compare(op, a, b)));
        }
        return Ok(ops::arithmetic(op, a, b)?.into());
    }

    if let (Some(a), Some(b)) = (m.str_value(lhs), m.str_value(rhs)) {
        if op == Op::Add {
            let joined = format!("{a}{b}");
            return Ok(m.new_string(joined));
        }
        if ops::is_comparison(op) {
            return Ok(Entity::from_bool(ops::compare_str(op, a, b)));
        }
    }

    Err(RuntimeError::UnsupportedOperands {
        op: op.name(),
        lhs: m.type_name(lhs),
        rhs: m.type_name(rhs),
    })
}

/// Built-in indexing of arrays, tuples and strings by integer.
fn fast_index(m: &Machine<'_>, collection: Entity, index: Entity) -> RuntimeResult<Option<Entity>> {
    let (Entity::Object(r), Some(i)) = (collection, index.as_int()) else {
        return Ok(None);
    };
    let object = m.object(r)?;
    match object.internal() {
        Internal::Array(_) | Internal::Tuple(_) => m.core.heap.slot_get(r, i).map(Some),
        Internal::String(s) => usize::try_from(i)
            .ok()
            .and_then(|at| s.as_bytes().get(at))
            .map(|&b| Some(Entity::char(b as i8)))
            .ok_or(RuntimeError::IndexOutOfBounds {
                index: i,
                len: s.len(),
            }),
        _ => Ok(None),
    }
}

fn fast_store(
    m: &mut Machine<'_>,
    collection: Entity,
    index: Entity,
    value: Entity,
) -> RuntimeResult<bool> {
    let (Entity::Object(r), Some(i)) = (collection, index.as_int()) else {
        return Ok(false);
    };
    let indexable = matches!(
        m.object(r)?.internal(),
        Internal::Array(_) | Internal::Tuple(_)
    );
    if indexable {
        m.core.heap.slot_set(r, i, value)?;
    }
    Ok(indexable)
}

/// Element `index` of a tuple; anything else counts as a 1-tuple and None
/// as the empty tuple.
fn tuple_element(m: &Machine<'_>, value: Entity, index: i64) -> RuntimeResult<Option<Entity>> {
    if let Entity::Object(r) = value {
        if let Some(items) = m.object(r)?.as_tuple() {
            return Ok(usize::try_from(index).ok().and_then(|i| items.get(i).copied()));
        }
    }
    Ok(match (value, index) {
        (Entity::None, _) => None,
        (value, 0) => Some(value),
        _ => None,
    })
}
