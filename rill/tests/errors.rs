mod common;

use common::run;

fn src(lines: &[&str]) -> String {
    lines.join("\n")
}

#[test]
fn uncaught_error_prints_a_trace() {
    let r = run(&src(&["res 1", "div 0", "ret"]));
    assert!(r.status.failed);
    assert_eq!(r.status.uncaught_errors, 1);
    assert!(r.err.starts_with("Error: division by zero\n"), "{}", r.err);
    assert!(r.err.contains("  at main.<module> (2:1) div 0\n"), "{}", r.err);
}

#[test]
fn trace_follows_the_calling_tasks() {
    let r = run(&src(&[
        "res 0",
        "call outer",
        "ret",
        ".func outer",
        "call inner",
        "ret",
        ".func inner",
        "res 1",
        "div 0",
        "ret",
    ]));
    assert_eq!(r.status.uncaught_errors, 1);
    let frames: Vec<&str> = r.err.lines().skip(1).collect();
    assert_eq!(
        frames,
        [
            "  at main.inner (9:1) div 0",
            "  at main.outer (5:1) call inner",
            "  at main.<module> (2:1) call outer",
        ]
    );
}

#[test]
fn caller_catches_a_callee_error() {
    let r = run(&src(&[
        "ctch @handler",
        "call bad",
        "ret \"unreached\"",
        "handler:",
        "get message",
        "ret",
        ".func bad",
        "res \"bad\"",
        "call Error",
        "rais",
    ]));
    assert!(!r.status.failed);
    assert_eq!(r.status.display, "bad");
    assert_eq!(r.err, "");
}

#[test]
fn only_error_objects_can_be_raised() {
    let r = run(&src(&["ctch @h", "res 5", "rais", "h:", "get message", "ret"]));
    assert_eq!(r.status.display, "can only raise Error objects, got Int");
}

#[test]
fn unknown_identifiers_raise() {
    let r = run(&src(&["ctch @h", "res nope", "h:", "get message", "ret"]));
    assert_eq!(r.status.display, "unknown identifier `nope`");
}

#[test]
fn error_subclasses_render_their_class() {
    let r = run(&src(&[
        "res \"oops\"",
        "call ParseError",
        "rais",
        ".class ParseError : Error",
        ".end",
    ]));
    assert!(r.status.failed);
    assert!(r.err.starts_with("ParseError: oops\n"), "{}", r.err);
}

#[test]
fn errorln_prints_without_failing() {
    let r = run(&src(&["res \"x\"", "call Error", "call errorln", "ret 0"]));
    assert!(!r.status.failed);
    assert_eq!(r.status.uncaught_errors, 0);
    assert!(r.err.starts_with("Error: x\n"), "{}", r.err);
}

#[test]
fn a_catch_handles_one_error() {
    let r = run(&src(&[
        "ctch @first",
        "res 1",
        "div 0",
        "ret \"none\"",
        "first:",
        "res 1",
        "div 0",
        "ret \"second\"",
    ]));
    assert!(r.status.failed);
    assert!(r.err.contains("(7:1) div 0"), "{}", r.err);
}

#[test]
fn blocks_unwind_to_the_enclosing_catch() {
    let r = run(&src(&[
        "ctch @caught",
        "nblk",
        "res 1",
        "div 0",
        "bblk",
        "ret \"no\"",
        "caught:",
        "ret \"caught\"",
    ]));
    assert_eq!(r.status.display, "caught");
}

#[test]
fn errors_inside_methods_name_the_class() {
    let r = run(&src(&[
        "clln Parser",
        "get parse",
        "clln",
        "ret",
        ".class Parser",
        ".func parse",
        "res missing",
        "ret",
        ".end",
    ]));
    assert!(r.err.contains("  at main.Parser.parse (7:1) res missing\n"), "{}", r.err);
}
