mod common;

use common::run_modules;
use rill::{HeapCreateInfo, VmCreateInfo};

fn src(lines: &[&str]) -> String {
    lines.join("\n")
}

fn limited(max: usize) -> VmCreateInfo {
    VmCreateInfo {
        heap: HeapCreateInfo {
            max_object_count: Some(max),
            ..Default::default()
        },
        ..Default::default()
    }
}

const GROW: &[&str] = &[
    "anew 0",
    "let xs",
    "top:",
    "res xs",
    "get push",
    "push",
    "res \"item\"",
    "call",
    "jmp @top",
];

#[test]
fn out_of_memory_is_catchable() {
    let mut lines = vec!["ctch @oom"];
    lines.extend_from_slice(GROW);
    lines.extend_from_slice(&["oom:", "get message", "ret"]);
    let main = src(&lines);
    let r = run_modules(limited(200), &[("main", main.as_str())]);
    assert!(!r.status.failed, "{}", r.err);
    assert!(r.status.display.starts_with("out of memory"), "{}", r.status.display);
}

#[test]
fn uncaught_out_of_memory_fails_the_task() {
    let main = src(GROW);
    let r = run_modules(limited(200), &[("main", main.as_str())]);
    assert!(r.status.failed);
    assert!(r.err.starts_with("Error: out of memory"), "{}", r.err);
}

#[test]
fn garbage_is_reclaimed_while_a_task_runs() {
    let main = src(&[
        "res 0",
        "let i",
        "top:",
        "res i",
        "gte 10000",
        "if @done",
        "res \"garbage\"",
        "add \"more\"",
        "inc i",
        "jmp @top",
        "done:",
        "res i",
        "ret",
    ]);
    let r = run_modules(limited(500), &[("main", main.as_str())]);
    assert!(!r.status.failed, "{}", r.err);
    assert_eq!(r.status.display, "10000");
    let stats = r.status.process.lock().heap.stats();
    assert!(stats.collections > 0);
    assert!(stats.reclaimed > 10000);
}
