//! End-to-end source-to-stdout scenarios (§8 concrete scenario set), driven
//! through `run_source` exactly as the CLI drives it. Top-level `return` is
//! a compile error (§4.3), so each scenario's observable result is what it
//! prints, captured by redirecting fd 1 for the duration of the run.
//!
//! Tests share the process's stdout, so `STDOUT_LOCK` serializes every
//! capturing test against the others.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use ember_runtime::{run_source, Config};

static STDOUT_LOCK: Mutex<()> = Mutex::new(());
static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Runs `source`, returning everything it printed. Panics on a compile or
/// runtime error so a failing scenario shows up as a test failure, not a
/// silently empty capture.
fn run_and_capture(source: &str) -> String {
    run_and_capture_with(source, Config::default())
}

fn run_and_capture_with(source: &str, config: Config) -> String {
    let _guard = STDOUT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let path = std::env::temp_dir().join(format!(
        "ember-scenario-{}-{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    ));
    let file = std::fs::File::create(&path).expect("create capture file");

    std::io::stdout().flush().unwrap();
    let saved_fd = unsafe { libc::dup(1) };
    assert!(saved_fd >= 0, "dup(1) failed");
    unsafe { libc::dup2(file.as_raw_fd(), 1) };

    let result = run_source(source, config);

    std::io::stdout().flush().unwrap();
    unsafe {
        libc::dup2(saved_fd, 1);
        libc::close(saved_fd);
    }
    drop(file);

    let mut output = String::new();
    std::fs::File::open(&path).unwrap().read_to_string(&mut output).unwrap();
    let _ = std::fs::remove_file(&path);

    result.unwrap_or_else(|e| panic!("{e}"));
    output
}

fn lines(output: &str) -> Vec<&str> {
    output.lines().collect()
}

#[test]
fn arithmetic_and_strings() {
    let out = run_and_capture(r#"print 1 + 2; print "a" + "b";"#);
    assert_eq!(lines(&out), vec!["3", "ab"]);
}

#[test]
fn closures_share_captured_state_across_calls() {
    let source = r#"
        fun mk() {
            var i = 0;
            fun inc() { i = i + 1; return i; }
            return inc;
        }
        var f = mk();
        print f();
        print f();
        print f();
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["1", "2", "3"]);
}

#[test]
fn closures_from_the_same_scope_see_one_anothers_writes() {
    let source = r#"
        fun mk() {
            var i = 0;
            fun get() { return i; }
            fun set(v) { i = v; }
            set(41);
            print get();
        }
        mk();
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["41"]);
}

#[test]
fn inheritance_and_super_calls_run_in_order() {
    let source = r#"
        class A { greet() { print "A"; } }
        class B < A {
            greet() { super.greet(); print "B"; }
        }
        B().greet();
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["A", "B"]);
}

#[test]
fn async_functions_preserve_call_order_across_sleeps() {
    let source = r#"
        async fun g(x) { sleep(10); return x; }
        async fun h() {
            print await g(1);
            print await g(2);
        }
        h();
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["1", "2"]);
}

#[test]
fn switch_does_not_fall_through() {
    let source = r#"
        switch (2) {
            case 1: print "a";
            case 2: print "b";
            default: print "d";
        }
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["b"]);
}

#[test]
fn template_strings_interpolate_expressions() {
    let source = r#"
        var n = 3;
        print "x={n+1}!";
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["x=4!"]);
}

#[test]
fn string_interning_gives_identity_equality() {
    let source = r#"
        var a = "hello" + "";
        var b = "hel" + "lo";
        print a == b;
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["true"]);
}

#[test]
fn array_and_string_length_round_trip() {
    let source = r#"
        print [1, 2, 3].length;
        print "abc".length;
    "#;
    assert_eq!(lines(&run_and_capture(source)), vec!["3", "3"]);
}

#[test]
fn gc_stress_survives_nested_allocation() {
    let source = r#"
        class Node {
            init(value) { this.value = value; this.next = nil; }
        }
        var head = nil;
        var i = 0;
        while (i < 200) {
            var n = Node(i);
            n.next = head;
            head = n;
            i = i + 1;
        }
        var sum = 0;
        var cur = head;
        while (cur != nil) {
            sum = sum + cur.value;
            cur = cur.next;
        }
        print sum;
    "#;
    let mut config = Config::default();
    config.gc_stress = true;

    let output = run_and_capture_with(source, config);
    assert_eq!(lines(&output), vec![(0..200i64).sum::<i64>().to_string()]);
}
