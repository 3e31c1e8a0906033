mod common;

use std::time::{Duration, Instant};

use common::{run, run_modules};
use rill::{Entity, VmCreateInfo};

fn src(lines: &[&str]) -> String {
    lines.join("\n")
}

// ── calls ───────────────────────────────────────────────────────────

#[test]
fn call_parks_the_caller_until_the_callee_returns() {
    let r = run(&src(&[
        "res 20",
        "call double",
        "add 2",
        "ret",
        ".func double",
        "let x",
        "add x",
        "ret",
    ]));
    assert!(!r.status.failed);
    assert_eq!(r.status.value, Entity::int(42));
}

#[test]
fn recursion_builds_a_task_per_call() {
    let r = run(&src(&[
        "res 10",
        "call sum",
        "ret",
        ".func sum",
        "let n",
        "res n",
        "lte 0",
        "ifn @recurse",
        "res 0",
        "ret",
        "recurse:",
        "res n",
        "sub 1",
        "call sum",
        "add n",
        "ret",
    ]));
    assert_eq!(r.status.display, "55");
}

#[test]
fn exit_with_a_computed_value() {
    let r = run(&src(&["res 1", "add 2", "let x", "exit x"]));
    assert_eq!(r.status.value, Entity::int(3));
}

#[test]
fn module_variables_drive_a_loop() {
    let r = run(&src(&[
        "res 0",
        "let total",
        "res 1",
        "let i",
        "top:",
        "res i",
        "gt 5",
        "if @done",
        "res total",
        "add i",
        "set total",
        "inc i",
        "jmp @top",
        "done:",
        "res total",
        "ret",
    ]));
    assert_eq!(r.status.display, "15");
}

#[test]
fn several_arguments_travel_as_a_tuple() {
    let r = run(&src(&[
        "push 7",
        "push 5",
        "tupl 2",
        "call minus",
        "ret",
        ".func minus",
        "push",
        "tget 0",
        "let a",
        "tget 1",
        "let b",
        "res a",
        "sub b",
        "ret",
    ]));
    assert_eq!(r.status.display, "2");
}

#[test]
fn default_arguments_use_tgte() {
    let r = run(&src(&[
        "res 4",
        "call scaled",
        "ret",
        ".func scaled",
        "push",
        "tget 0",
        "let x",
        "res 10",
        "tgte 1",
        "let factor",
        "res x",
        "mult factor",
        "ret",
    ]));
    assert_eq!(r.status.display, "40");
}

#[test]
fn anonymous_functions_close_over_their_context() {
    let r = run(&src(&[
        "res 3",
        "call make_adder",
        "push",
        "res 4",
        "call",
        "ret",
        ".func make_adder",
        "let base",
        "res adder",
        "ret",
        ".func adder anon",
        "add base",
        "ret",
    ]));
    assert_eq!(r.status.display, "7");
}

// ── objects ─────────────────────────────────────────────────────────

const COUNTER: &[&str] = &[
    ".class Counter count",
    ".func new",
    "push self",
    "res 0",
    "fld count",
    "ret",
    ".func increment",
    "push self",
    "res self",
    "get count",
    "add 1",
    "fld count",
    "ret",
    ".end",
];

#[test]
fn constructor_and_methods_update_members() {
    let mut lines = vec![
        "clln Counter",
        "let c",
        "res c",
        "get increment",
        "clln",
        "res c",
        "get increment",
        "clln",
        "res c",
        "get count",
        "ret",
    ];
    lines.extend_from_slice(COUNTER);
    let r = run(&src(&lines));
    assert_eq!(r.status.display, "2");
}

#[test]
fn each_increment_returns_the_new_count() {
    let mut lines = vec![
        "clln Counter",
        "let c",
        "get increment",
        "clln",
        "push",
        "res c",
        "get increment",
        "clln",
        "push",
        "res c",
        "get increment",
        "clln",
        "push",
        "tupl 3",
        "ret",
    ];
    lines.extend_from_slice(COUNTER);
    let r = run(&src(&lines));
    assert_eq!(r.status.display, "(1, 2, 3)");
}

#[test]
fn instances_answer_is_checks() {
    let mut lines = vec![
        "clln Counter",
        "is Counter",
        "push",
        "res 1",
        "is Error",
        "push",
        "tupl 2",
        "ret",
    ];
    lines.extend_from_slice(COUNTER);
    let r = run(&src(&lines));
    assert_eq!(r.status.display, "(1, none)");
}

#[test]
fn methods_are_inherited() {
    let r = run(&src(&[
        "clln Child",
        "get greet",
        "clln",
        "ret",
        ".class Base",
        ".func greet",
        "res \"hello\"",
        "ret",
        ".end",
        ".class Child : Base",
        ".end",
    ]));
    assert_eq!(r.status.display, "hello");
}

#[test]
fn superclass_rebinding_refuses_cycles() {
    let r = run(&src(&[
        "ctch @cycle",
        "push Base",
        "push Child",
        "tupl 2",
        "call $__set_super",
        "ret \"no error\"",
        "cycle:",
        "get message",
        "ret",
        ".class Base",
        ".end",
        ".class Child : Base",
        ".end",
    ]));
    assert!(r.status.display.contains("would inherit from itself"), "{}", r.status.display);
}

#[test]
fn arrays_index_and_store() {
    let r = run(&src(&[
        "push 1",
        "push 2",
        "push 3",
        "anew 3",
        "let xs",
        "push xs",
        "push 1",
        "res 20",
        "aset",
        "push xs",
        "res 1",
        "aidx",
        "push",
        "res xs",
        "get len",
        "clln",
        "add",
        "ret",
    ]));
    assert_eq!(r.status.display, "23");
}

const BOX: &[&str] = &[
    ".class Box last",
    ".func __set__",
    "push",
    "tget 1",
    "let v",
    "push self",
    "res v",
    "fld last",
    "ret \"from_set\"",
    ".func __index__",
    "mult 10",
    "ret",
    ".end",
];

#[test]
fn indexing_dispatches_to_dunder_methods() {
    let mut lines = vec![
        "clln Box",
        "let b",
        "push b",
        "push 3",
        "res 99",
        "aset",
        "push",
        "push b",
        "res 4",
        "aidx",
        "push",
        "res b",
        "get last",
        "push",
        "tupl 3",
        "ret",
    ];
    lines.extend_from_slice(BOX);
    let r = run(&src(&lines));
    assert!(!r.status.failed, "{}", r.err);
    assert_eq!(r.status.display, "(99, 40, 99)");
}

#[test]
fn counter_is_held_by_a_single_edge() {
    let mut lines = vec![
        "clln Counter",
        "let c",
        "get increment",
        "clln",
        "res c",
        "get increment",
        "clln",
        "res c",
        "get increment",
        "clln",
        "res c",
        "ret",
    ];
    lines.extend_from_slice(COUNTER);
    let r = run(&src(&lines));
    let counter = r.status.value.as_object().expect("a Counter");
    let mut core = r.status.process.lock();
    // drop the bound methods that still point at the counter
    core.collect_garbage();
    let heap = &core.heap;
    assert_eq!(heap.incoming_edges(counter).unwrap(), 1);
    assert!(heap.live_objects().all(|o| heap.edge_count(counter, o).unwrap() == 0));
}

#[test]
fn print_joins_tuple_arguments() {
    let r = run(&src(&[
        "push \"a\"",
        "push 1",
        "push 2.5",
        "tupl 3",
        "call println",
        "res \"x\"",
        "add \"y\"",
        "call print",
        "ret",
    ]));
    assert_eq!(r.out, "a 1 2.5\nxy");
}

// ── futures and async ───────────────────────────────────────────────

#[test]
fn async_call_returns_a_future() {
    let r = run(&src(&[
        "res 1",
        "call slow",
        "let f",
        "get is_complete",
        "clln",
        "let before",
        "res f",
        "wait",
        "let result",
        "res f",
        "get is_complete",
        "clln",
        "push before",
        "push",
        "push result",
        "tupl 3",
        "ret",
        ".func slow async",
        "add 1",
        "ret",
    ]));
    assert_eq!(r.status.display, "(none, 1, 2)");
}

#[test]
fn sleep_runs_in_the_background() {
    let started = Instant::now();
    let r = run(&src(&["res 20", "call sleep", "wait", "res 7", "ret"]));
    assert_eq!(r.status.display, "7");
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn tasks_waiting_on_background_sleeps_resume() {
    let r = run(&src(&[
        "res 0",
        "call napper",
        "let a",
        "res 1",
        "call napper",
        "let b",
        "res a",
        "wait",
        "push",
        "res b",
        "wait",
        "push",
        "tupl 2",
        "ret",
        ".func napper async",
        "let id",
        "res 30",
        "call sleep",
        "wait",
        "res id",
        "ret",
    ]));
    assert_eq!(r.status.display, "(0, 1)");
}

#[test]
fn unrepresentable_sleeps_raise() {
    for millis in ["1e300", "+inf"] {
        let res = format!("res {millis}");
        let r = run(&src(&[
            "ctch @bad",
            res.as_str(),
            "call sleep",
            "wait",
            "ret \"slept\"",
            "bad:",
            "get message",
            "ret",
        ]));
        assert!(!r.status.failed, "{}", r.err);
        assert!(r.status.display.starts_with("cannot sleep for"), "{}", r.status.display);
    }
}

#[test]
fn observed_async_errors_stay_silent() {
    let r = run(&src(&[
        "res 0",
        "call fails",
        "let f",
        "res 1",
        "ret",
        ".func fails async",
        "res 1",
        "div 0",
        "ret",
    ]));
    assert!(!r.status.failed);
    assert_eq!(r.status.uncaught_errors, 0);
    assert_eq!(r.err, "");
}

#[test]
fn future_get_hands_back_the_error_object() {
    let r = run(&src(&[
        "res 0",
        "call fails",
        "let f",
        "ctch @settled",
        "wait",
        "settled:",
        "res f",
        "get get",
        "clln",
        "is Error",
        "ret",
        ".func fails async",
        "res \"nope\"",
        "call Error",
        "rais",
    ]));
    assert_eq!(r.status.display, "1");
}

// ── processes ───────────────────────────────────────────────────────

#[test]
fn child_process_result_is_copied_back() {
    let r = run(&src(&[
        "res 5",
        "let base",
        "res worker",
        "call Process",
        "get start",
        "push",
        "res 16",
        "call",
        "wait",
        "ret",
        ".func worker",
        "add base",
        "push",
        "push \"done\"",
        "anew 2",
        "ret",
    ]));
    assert!(!r.status.failed);
    assert_eq!(r.status.display, "[21, done]");
}

#[test]
fn child_process_error_fails_the_future() {
    let r = run(&src(&[
        "res worker",
        "call Process",
        "get start",
        "clln",
        "let f",
        "ctch @failed",
        "res f",
        "wait",
        "ret \"no error\"",
        "failed:",
        "get message",
        "ret",
        ".func worker",
        "res \"boom\"",
        "call Error",
        "rais",
    ]));
    assert_eq!(r.status.display, "boom");
    assert_eq!(r.err, "");
}

#[test]
fn parent_keeps_running_while_a_child_fails() {
    let r = run(&src(&[
        "res worker",
        "call Process",
        "get start",
        "clln",
        "let f",
        "res 0",
        "call other",
        "let g",
        "ctch @failed",
        "res f",
        "wait",
        "ret \"no error\"",
        "failed:",
        "get message",
        "add \" caught\"",
        "call println",
        "res g",
        "wait",
        "ret",
        ".func worker",
        "res 30",
        "call sleep",
        "wait",
        "res \"boom\"",
        "call Error",
        "rais",
        ".func other async",
        "res \"other done\"",
        "call println",
        "ret 5",
    ]));
    assert!(!r.status.failed, "{}", r.err);
    assert_eq!(r.out, "other done\nboom caught\n");
    assert_eq!(r.status.display, "5");
    assert_eq!(r.err, "");
}

#[test]
fn process_handles_report_their_id() {
    let r = run(&src(&[
        "res worker",
        "call Process",
        "let p",
        "get id",
        "clln",
        "let before",
        "res p",
        "get start",
        "clln",
        "wait",
        "res p",
        "get id",
        "clln",
        "push before",
        "push",
        "tupl 2",
        "ret",
        ".func worker",
        "ret 0",
    ]));
    assert_eq!(r.status.display, "(none, 2)");
}

#[test]
fn remote_members_are_read_across_processes() {
    let r = run(&src(&[
        "clln Box",
        "let b",
        "push b",
        "res 7",
        "fld v",
        "res b",
        "call remote",
        "let handle",
        "res worker",
        "call Process",
        "get start",
        "push",
        "res handle",
        "call",
        "wait",
        "ret",
        ".class Box v",
        ".end",
        ".func worker",
        "get get",
        "push",
        "res \"v\"",
        "call",
        "add 1",
        "ret",
    ]));
    assert_eq!(r.status.display, "8");
}

#[test]
fn exit_records_the_value() {
    let main = src(&["nblk", "exit 3", "bblk", "ret 4"]);
    let r = run_modules(VmCreateInfo::default(), &[("main", main.as_str())]);
    assert_eq!(r.status.value, Entity::int(3));
}
