//! In-process integration tests that exercise the public API directly,
//! with `print` output captured through `VM::with_output`.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use opal::vm::Heap;
use opal::{compiler, InterpretError, RuntimeConfig, VM};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> Result<String, InterpretError> {
    run_with(source, RuntimeConfig::default())
}

fn run_with(source: &str, config: RuntimeConfig) -> Result<String, InterpretError> {
    let buf = SharedBuf::default();
    let mut vm = VM::with_output(config, Box::new(buf.clone()));
    vm.interpret(source)?;
    let bytes = buf.0.lock().unwrap().clone();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn expect(source: &str, expected: &str) {
    assert_eq!(run(source).as_deref(), Ok(expected), "source:\n{}", source);
}

// The six canonical end-to-end scenarios.

#[test]
fn test_scenario_arithmetic() {
    expect("print 1 + 2 * 3;", "7\n");
}

#[test]
fn test_scenario_concatenation() {
    expect(r#"var a = "he"; var b = "llo"; print a + b;"#, "hello\n");
}

#[test]
fn test_scenario_closure() {
    expect(
        "fun mk(x) { fun inner() { return x; } return inner; } var f = mk(42); print f();",
        "42\n",
    );
}

#[test]
fn test_scenario_class_with_fields() {
    expect(
        r#"class A { greet() { return "hi " + this.name; } } var a = A(); a.name = "bob"; print a.greet();"#,
        "hi bob\n",
    );
}

#[test]
fn test_scenario_inheritance_chain() {
    expect(
        r#"class A { greet() { return "hi " + this.name; } } class B < A { init(n) { this.name = n; } } class C < B { greet() { return "yo " + super.greet(); } } print C("sam").greet();"#,
        "yo hi sam\n",
    );
}

#[test]
fn test_scenario_continue() {
    expect(
        "for (var i = 0; i < 3; i = i + 1) { if (i == 1) continue; print i; }",
        "0\n2\n",
    );
}

// Value formatting.

#[test]
fn test_print_formats() {
    expect("print nil;", "nil\n");
    expect("print true;", "true\n");
    expect("print false;", "false\n");
    expect("print 3.5;", "3.5\n");
    expect("print 3.0;", "3\n");
    expect(r#"print "text";"#, "text\n");
    expect("fun f() {} print f;", "<fn f>\n");
    expect("print clock;", "<native fn>\n");
    expect("class A {} print A;", "A\n");
    expect("class A {} print A();", "A instance\n");
    expect("class A { m() {} } print A().m;", "<fn m>\n");
}

// Language behaviors beyond the canonical scenarios.

#[test]
fn test_shadowing_and_block_scopes() {
    expect(
        "var a = 1; { var a = 2; print a; } print a;",
        "2\n1\n",
    );
}

#[test]
fn test_upvalues_close_on_scope_exit() {
    let source = r#"
var f;
{
    var captured = "inner";
    fun get() { return captured; }
    f = get;
}
print f();
"#;
    expect(source, "inner\n");
}

#[test]
fn test_sibling_closures_share_one_cell() {
    let source = r#"
fun pair() {
    var n = 0;
    fun inc() { n = n + 1; }
    fun get() { return n; }
    inc();
    inc();
    return get;
}
print pair()();
"#;
    expect(source, "2\n");
}

#[test]
fn test_break_unwinds_locals() {
    let source = r#"
var kept = "ok";
for (var i = 0; i < 10; i = i + 1) {
    var inner = i;
    if (inner == 2) break;
}
print kept;
"#;
    expect(source, "ok\n");
}

#[test]
fn test_loop_captures_survive_break() {
    let source = r#"
var f;
for (var i = 0; i < 5; i = i + 1) {
    var snapshot = i * 10;
    fun get() { return snapshot; }
    if (i == 2) { f = get; break; }
}
print f();
"#;
    expect(source, "20\n");
}

#[test]
fn test_methods_resolve_through_inheritance() {
    let source = r#"
class Base { who() { return "base"; } shared() { return "shared"; } }
class Derived < Base { who() { return "derived"; } }
var d = Derived();
print d.who();
print d.shared();
"#;
    expect(source, "derived\nshared\n");
}

#[test]
fn test_initializer_returns_instance() {
    let source = r#"
class A { init() { this.x = 1; return; } }
var a = A();
print a.x;
"#;
    expect(source, "1\n");
}

#[test]
fn test_nested_this_through_closure() {
    let source = r#"
class A {
    init(n) { this.n = n; }
    getter() {
        fun inner() { return this.n; }
        return inner;
    }
}
print A(9).getter()();
"#;
    expect(source, "9\n");
}

// Runtime error messages, bit-exact.

fn expect_runtime_error(source: &str) {
    assert_eq!(run(source), Err(InterpretError::Runtime), "source:\n{}", source);
}

#[test]
fn test_runtime_error_cases() {
    expect_runtime_error("print 1 - nil;");
    expect_runtime_error(r#"print 1 + "s";"#);
    expect_runtime_error("print -true;");
    expect_runtime_error("print 1 < nil;");
    expect_runtime_error("print undefined_thing;");
    expect_runtime_error("undefined_thing = 1;");
    expect_runtime_error("true.field;");
    expect_runtime_error("true.field = 1;");
    expect_runtime_error("true.method();");
    expect_runtime_error("var s = \"str\"; s.length;");
    expect_runtime_error("nil();");
    expect_runtime_error("fun f(a, b) {} f(1);");
    expect_runtime_error("class A {} A().nope;");
    expect_runtime_error("class A {} A(1, 2);");
    expect_runtime_error("var B = 1; class A < B {}"); // superclass must be a class
}

// GC behavior through the public API.

#[test]
fn test_stress_gc_preserves_semantics() {
    let config = RuntimeConfig {
        gc_stress: true,
        ..RuntimeConfig::default()
    };
    let source = r#"
class Link { init(v, next) { this.v = v; this.next = next; } }
var head = nil;
for (var i = 0; i < 30; i = i + 1) {
    head = Link(i, head);
}
var sum = 0;
while (head != nil) {
    sum = sum + head.v;
    head = head.next;
}
print sum;
"#;
    assert_eq!(run_with(source, config).as_deref(), Ok("435\n"));
}

#[test]
fn test_cyclic_graphs_are_collected() {
    // Classes reference methods which close over the class name; instances
    // reference classes. None of this trips the collector.
    let config = RuntimeConfig {
        gc_stress: true,
        ..RuntimeConfig::default()
    };
    let source = r#"
fun make() {
    class Node { init() { this.me = this; } }
    return Node();
}
for (var i = 0; i < 20; i = i + 1) { make(); }
print "done";
"#;
    assert_eq!(run_with(source, config).as_deref(), Ok("done\n"));
}

// Direct compiler API.

#[test]
fn test_compile_returns_function_handle() {
    let mut heap = Heap::new();
    let function = compiler::compile("print 1;", &mut heap).expect("compiles");
    let f = heap.function(function);
    assert_eq!(f.arity, 0);
    assert!(f.name.is_none());
    assert!(!f.chunk.is_empty());
}

#[test]
fn test_compile_error_counts() {
    let mut heap = Heap::new();
    let error = compiler::compile("var 1; var 2;", &mut heap).expect_err("does not compile");
    assert!(error.errors >= 2);
}

#[test]
fn test_interning_across_compiles() {
    // Two compiles against the same heap reuse the same interned constants.
    let mut heap = Heap::new();
    compiler::compile(r#"print "shared";"#, &mut heap).unwrap();
    let before = heap.object_count();
    compiler::compile(r#"print "shared";"#, &mut heap).unwrap();
    // Only the new script function was allocated; the string was reused.
    assert_eq!(heap.object_count(), before + 1);
}
