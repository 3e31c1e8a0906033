//! Per-process scheduler loop.
//!
//! Each process runs this loop on its own thread: drain finished background
//! calls, run the next ready task under the heap lock, settle whatever it
//! finished, collect garbage when the heap crosses its threshold, and
//! sleep when nothing is runnable but something is still pending.
use std::sync::Arc;

use crate::{
    Completion, Entity, EntityCopier, Machine, Process, ProcessCore,
    RemoteLink, TaskId, TaskState, VmShared, interpreter, lock_pair,
};

/// A finished task whose result belongs to a task of another process.
struct Outgoing {
    task: TaskId,
    link: RemoteLink,
}

/// Run `process` until it has nothing left to run or wait for.
pub fn run_process(vm: &Arc<VmShared>, process: &Arc<Process>) {
    log::info!("process {} started", process.id);
    loop {
        let mut outgoing = Vec::new();
        let mut progressed = false;
        let finished = {
            let mut core = process.lock();

            for completion in process.take_completions() {
                settle_completion(vm, process, &mut core, completion);
                progressed = true;
            }

            if let Some(task) = process.pop_runnable() {
                progressed = true;
                run_task(vm, process, &mut core, task, &mut outgoing);
            }

            if core.heap.should_collect() {
                collect(process, &mut core);
            }

            !progressed
                && core.waiting.is_empty()
                && core.in_flight == 0
                && !process.has_work()
        };

        for out in outgoing {
            propagate(vm, process, out);
        }
        if finished {
            break;
        }
        if !progressed {
            log::trace!("process {} idle, waiting for work", process.id);
            process.wait_for_work();
        }
    }
    let core = process.lock();
    log::info!(
        "process {} finished: {} tasks, {} uncaught errors, {} live objects",
        process.id,
        core.task_count(),
        core.uncaught_errors,
        core.heap.live_count()
    );
}

fn run_task(
    vm: &Arc<VmShared>,
    process: &Arc<Process>,
    core: &mut ProcessCore,
    task: TaskId,
    outgoing: &mut Vec<Outgoing>,
) {
    let mut m = Machine::new(vm, process, core, task);
    interpreter::execute_task(&mut m);
    if !m.current_task().state.is_finished() {
        return;
    }
    // the link stays on the task so its failure is not reported here
    if let Some(link) = m.current_task().remote.clone() {
        // keep the result alive until it has been copied out
        if let Entity::Object(r) = m.resval() {
            if let Err(err) = m.core.heap.root(r) {
                log::error!("cannot hold result of task {}: {err}", task.0);
            }
        }
        outgoing.push(Outgoing { task, link });
    }
    m.finish_task(task);
}

/// Hand a background call's result to its carrier task.
fn settle_completion(
    vm: &Arc<VmShared>,
    process: &Arc<Process>,
    core: &mut ProcessCore,
    completion: Completion,
) {
    let Completion { task, result, held } = completion;
    for r in held {
        // the object may already be gone if it was never reachable
        let _ = core.heap.unroot(r);
    }
    core.in_flight = core.in_flight.saturating_sub(1);

    let mut m = Machine::new(vm, process, core, task);
    let (state, value) = match result {
        Ok(value) => (TaskState::Complete, value),
        Err(err) => (TaskState::Error, m.error_object(err).into()),
    };
    let carrier = m.current_task_mut();
    carrier.resval = value;
    carrier.state = state;
    m.finish_task(task);
}

fn collect(process: &Process, core: &mut ProcessCore) {
    let reclaimed = core.collect_garbage();
    log::trace!("process {}: collected {reclaimed} objects", process.id);
    if let Some(err) = core.heap.over_limit() {
        log::error!("process {}: {err}", process.id);
        core.pending_fault = Some(err);
    }
}

/// Copy a finished task's result into the carrier task waiting for it in
/// another process, then finish the carrier there.
fn propagate(vm: &Arc<VmShared>, source: &Arc<Process>, out: Outgoing) {
    let Outgoing { task, link } = out;
    let target = &link.process;
    let (mut src, mut dst) = lock_pair(source, target);

    let (mut state, resval) = {
        let t = src.task(task);
        (t.state, t.resval)
    };
    let copied = EntityCopier::new(&src.heap, &mut dst.heap, &vm.special).copy(resval);
    if let Entity::Object(r) = resval {
        let _ = src.heap.unroot(r);
    }
    drop(src);

    let mut m = Machine::new(vm, target, &mut dst, link.task);
    let value = match copied {
        Ok(value) => value,
        Err(err) => {
            state = TaskState::Error;
            m.error_object(err).into()
        }
    };
    let carrier = m.current_task_mut();
    carrier.resval = value;
    carrier.state = state;
    log::debug!(
        "process {} delivered task {} ({}) to process {}",
        source.id,
        task.0,
        state.name(),
        target.id
    );
    m.finish_task(link.task);
    drop(dst);
    target.poke();
}
