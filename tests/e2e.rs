//! End-to-end tests that spawn the real binary: program output, error
//! reporting on stderr, and exit codes.

use std::process::Command;

/// Run opal on `source` with extra CLI args; returns (stdout, stderr, code).
fn run_opal_with(source: &str, args: &[&str]) -> (String, String, Option<i32>) {
    // Unique temp file per test so parallel runs don't collide.
    let temp_dir = std::env::temp_dir();
    let unique_id = std::thread::current().id();
    let temp_file = temp_dir.join(format!("opal_test_{:?}.opal", unique_id));
    std::fs::write(&temp_file, source).unwrap();

    let mut cmd_args: Vec<&str> = args.to_vec();
    let path = temp_file.to_str().unwrap().to_string();
    cmd_args.push(&path);

    let output = Command::new(env!("CARGO_BIN_EXE_opal"))
        .args(&cmd_args)
        .output()
        .expect("failed to execute opal");

    std::fs::remove_file(&temp_file).ok();

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code(),
    )
}

fn run_opal(source: &str) -> (String, String, Option<i32>) {
    run_opal_with(source, &[])
}

fn assert_output(source: &str, expected: &str) {
    let (stdout, stderr, code) = run_opal(source);
    assert_eq!(code, Some(0), "program should succeed, stderr:\n{}", stderr);
    assert_eq!(stdout, expected);
}

#[test]
fn test_arithmetic() {
    assert_output("print 1 + 2 * 3;", "7\n");
}

#[test]
fn test_string_concatenation() {
    assert_output(r#"var a = "he"; var b = "llo"; print a + b;"#, "hello\n");
}

#[test]
fn test_closures() {
    assert_output(
        "fun mk(x) { fun inner() { return x; } return inner; } var f = mk(42); print f();",
        "42\n",
    );
}

#[test]
fn test_classes_and_fields() {
    assert_output(
        r#"class A { greet() { return "hi " + this.name; } } var a = A(); a.name = "bob"; print a.greet();"#,
        "hi bob\n",
    );
}

#[test]
fn test_inheritance_and_super() {
    assert_output(
        r#"class A { greet() { return "hi " + this.name; } } class B < A { init(n) { this.name = n; } } class C < B { greet() { return "yo " + super.greet(); } } print C("sam").greet();"#,
        "yo hi sam\n",
    );
}

#[test]
fn test_continue_in_for_loop() {
    assert_output(
        "for (var i = 0; i < 3; i = i + 1) { if (i == 1) continue; print i; }",
        "0\n2\n",
    );
}

#[test]
fn test_fibonacci() {
    let source = r#"
fun fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
print fib(15);
"#;
    assert_output(source, "610\n");
}

#[test]
fn test_compile_error_exits_65() {
    let (stdout, stderr, code) = run_opal("print 1 +;");
    assert_eq!(code, Some(65));
    assert_eq!(stdout, "");
    assert!(stderr.contains("Expect expression."), "stderr:\n{}", stderr);
    assert!(stderr.contains("[line 1] Error"), "stderr:\n{}", stderr);
}

#[test]
fn test_compile_error_reports_lexeme() {
    let (_, stderr, code) = run_opal("var 1 = 2;");
    assert_eq!(code, Some(65));
    assert!(
        stderr.contains("Error at '1': Expect variable name."),
        "stderr:\n{}",
        stderr
    );
}

#[test]
fn test_runtime_error_exits_70_with_trace() {
    let source = "fun inner() { return 1 + nil; }\nfun outer() { return inner(); }\nouter();";
    let (_, stderr, code) = run_opal(source);
    assert_eq!(code, Some(70));
    assert!(
        stderr.contains("Operands must be two numbers or two strings."),
        "stderr:\n{}",
        stderr
    );
    // Innermost frame first.
    let inner_pos = stderr.find("[line 1] in inner()").expect("inner frame");
    let outer_pos = stderr.find("[line 2] in outer()").expect("outer frame");
    let script_pos = stderr.find("[line 3] in script").expect("script frame");
    assert!(inner_pos < outer_pos && outer_pos < script_pos);
}

#[test]
fn test_undefined_variable_message() {
    let (_, stderr, code) = run_opal("print missing;");
    assert_eq!(code, Some(70));
    assert!(stderr.contains("Undefined variable 'missing'."));
}

#[test]
fn test_stack_overflow_message() {
    let (_, stderr, code) = run_opal("fun f() { f(); } f();");
    assert_eq!(code, Some(70));
    assert!(stderr.contains("Stack overflow."));
}

#[test]
fn test_missing_file_exits_74() {
    let output = Command::new(env!("CARGO_BIN_EXE_opal"))
        .arg("does_not_exist.opal")
        .output()
        .expect("failed to execute opal");
    assert_eq!(output.status.code(), Some(74));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Could not open file"));
}

#[test]
fn test_bad_flag_exits_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_opal"))
        .arg("--no-such-flag")
        .output()
        .expect("failed to execute opal");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_repl_reads_lines_and_keeps_globals() {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Command::new(env!("CARGO_BIN_EXE_opal"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn repl");

    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(b"var a = 20;\nprint a + 1;\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("21"), "stdout:\n{}", stdout);
    assert!(stdout.contains("> "), "stdout:\n{}", stdout);
}

#[test]
fn test_trace_mode_disassembles_to_stderr() {
    let (stdout, stderr, code) = run_opal_with("print 1 + 2;", &["-d"]);
    assert_eq!(code, Some(0));
    // Program output is unchanged; the trace goes to stderr.
    assert_eq!(stdout, "3\n");
    assert!(stderr.contains("== trace =="), "stderr:\n{}", stderr);
    assert!(stderr.contains("OP_ADD"), "stderr:\n{}", stderr);
    assert!(stderr.contains("OP_CONSTANT"), "stderr:\n{}", stderr);
}

#[test]
fn test_gc_stats_flag_reports() {
    let source = r#"
var s = "";
for (var i = 0; i < 200; i = i + 1) { s = s + "x"; }
print 1;
"#;
    let (stdout, stderr, code) = run_opal_with(source, &["--gc-stress", "--gc-stats"]);
    assert_eq!(code, Some(0), "stderr:\n{}", stderr);
    assert_eq!(stdout, "1\n");
    assert!(stderr.contains("[GC] Collections:"), "stderr:\n{}", stderr);
}

#[test]
fn test_multiline_strings_count_lines() {
    let source = "var s = \"a\nb\";\nprint missing;";
    let (_, stderr, code) = run_opal(source);
    assert_eq!(code, Some(70));
    // The error is on source line 3; the string spanned lines 1-2.
    assert!(stderr.contains("[line 3] in script"), "stderr:\n{}", stderr);
}
