use lutra::{Error, Vm};
use pretty_assertions::assert_eq;

/// Run a program and return what it printed.
fn run(source: &str) -> Vec<String> {
    let mut vm = Vm::with_capture();
    if let Err(err) = vm.interpret(source) {
        panic!("program failed: {}\n{}", err, vm.take_diagnostics().join("\n"));
    }
    vm.take_print_output()
}

fn compile_error(source: &str) -> String {
    let mut vm = Vm::with_capture();
    match vm.interpret(source) {
        Err(Error::Compile(message)) => message,
        other => panic!("expected a compile error, got {:?}", other.err()),
    }
}

fn runtime_error(source: &str) -> String {
    let mut vm = Vm::with_capture();
    match vm.interpret(source) {
        Err(Error::Runtime(message)) => message,
        other => panic!("expected a runtime error, got {:?}", other.err()),
    }
}

// ---------------------------------------------------------------------------
// Expressions and statements
// ---------------------------------------------------------------------------

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), vec!["7"]);
    assert_eq!(run("print (1 + 2) * 3;"), vec!["9"]);
    assert_eq!(run("print 10 - 4 / 2;"), vec!["8"]);
    assert_eq!(run("print -2 * 3;"), vec!["-6"]);
    assert_eq!(run("print 1 + 2 == 3;"), vec!["true"]);
}

#[test]
fn number_rendering() {
    assert_eq!(run("print 100;"), vec!["100"]);
    assert_eq!(run("print 0.5;"), vec!["0.5"]);
    assert_eq!(run("print 2.5 * 2;"), vec!["5"]);
    assert_eq!(run("print 1 / 3 > 0.3;"), vec!["true"]);
}

#[test]
fn comparisons_and_equality() {
    assert_eq!(run("print 2 < 3;"), vec!["true"]);
    assert_eq!(run("print 3 <= 3;"), vec!["true"]);
    assert_eq!(run("print 2 > 3;"), vec!["false"]);
    assert_eq!(run("print 3 >= 4;"), vec!["false"]);
    assert_eq!(run("print 1 != 2;"), vec!["true"]);
    assert_eq!(run("print nil == nil;"), vec!["true"]);
    assert_eq!(run("print 0 == false;"), vec!["false"]);
    assert_eq!(run("print \"1\" == 1;"), vec!["false"]);
}

#[test]
fn truthiness() {
    // Only nil and false are falsy.
    assert_eq!(run("print !nil;"), vec!["true"]);
    assert_eq!(run("print !false;"), vec!["true"]);
    assert_eq!(run("print !0;"), vec!["false"]);
    assert_eq!(run("print !\"\";"), vec!["false"]);
    assert_eq!(run("if (0) print \"taken\"; else print \"not\";"), vec!["taken"]);
}

#[test]
fn short_circuit_operators() {
    assert_eq!(run("print true and \"yes\";"), vec!["yes"]);
    assert_eq!(run("print false and \"yes\";"), vec!["false"]);
    assert_eq!(run("print false or \"fallback\";"), vec!["fallback"]);
    assert_eq!(run("print \"first\" or \"second\";"), vec!["first"]);
    // The right operand must not run when short-circuited.
    assert_eq!(
        run("var ran = false; fun mark() { ran = true; } false and mark(); print ran;"),
        vec!["false"]
    );
}

#[test]
fn string_concatenation_and_interning() {
    assert_eq!(run("var a = \"foo\"; var b = \"foo\"; print a == b;"), vec!["true"]);
    assert_eq!(run("print \"foo\" + \"bar\";"), vec!["foobar"]);
    // A concatenated string is the same object as an equal literal.
    assert_eq!(run("print \"foo\" + \"bar\" == \"foobar\";"), vec!["true"]);
}

#[test]
fn if_else() {
    assert_eq!(
        run("if (1 < 2) print \"then\"; else print \"else\";"),
        vec!["then"]
    );
    assert_eq!(
        run("if (1 > 2) print \"then\"; else print \"else\";"),
        vec!["else"]
    );
    assert_eq!(run("if (false) print \"nope\"; print \"after\";"), vec!["after"]);
}

#[test]
fn while_loop() {
    assert_eq!(
        run("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        vec!["0", "1", "2"]
    );
}

#[test]
fn for_loop() {
    assert_eq!(
        run("for (var i = 0; i < 3; i = i + 1) print i;"),
        vec!["0", "1", "2"]
    );
    // The initializer and increment clauses are optional.
    assert_eq!(
        run("var i = 10; for (; i > 8;) { print i; i = i - 1; }"),
        vec!["10", "9"]
    );
    // An increment without an initializer runs after each iteration.
    assert_eq!(
        run("var n = 0; for (; n < 6; n = n + 2) print n;"),
        vec!["0", "2", "4"]
    );
}

#[test]
fn lexical_scoping_resolves_innermost() {
    assert_eq!(
        run("var a = \"global\"; { var a = \"local\"; print a; } print a;"),
        vec!["local", "global"]
    );
    assert_eq!(
        run("var a = \"outer\"; { var b = a; var a = \"inner\"; print b; print a; }"),
        vec!["outer", "inner"]
    );
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run("var a = 1; print a = 2;"), vec!["2"]);
    // Right-associative chaining through two targets.
    assert_eq!(run("var a = 1; var b = 2; a = b = 3; print a; print b;"), vec!["3", "3"]);
}

// ---------------------------------------------------------------------------
// Functions and closures
// ---------------------------------------------------------------------------

#[test]
fn function_calls_and_returns() {
    assert_eq!(
        run("fun add(a, b) { return a + b; } print add(1, 2);"),
        vec!["3"]
    );
    assert_eq!(run("fun f() { return; } print f();"), vec!["nil"]);
    assert_eq!(run("fun f() {} print f();"), vec!["nil"]);
    assert_eq!(run("fun f() { print \"called\"; } f();"), vec!["called"]);
}

#[test]
fn recursion() {
    assert_eq!(
        run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
        vec!["55"]
    );
}

#[test]
fn closure_mutates_captured_variable() {
    let source = "\
fun make(n) {
  fun inc() { n = n + 1; return n; }
  return inc;
}
var c = make(10);
print c();
print c();
";
    assert_eq!(run(source), vec!["11", "12"]);
}

#[test]
fn two_closures_share_one_upvalue() {
    let source = "\
fun pair() {
  var v = 0;
  fun get() { return v; }
  fun set(x) { v = x; }
  set(5);
  print get();
}
pair();
";
    assert_eq!(run(source), vec!["5"]);
}

#[test]
fn closed_upvalue_outlives_its_frame() {
    let source = "\
var hold;
{
  var local = \"survives\";
  fun capture() { print local; }
  hold = capture;
}
hold();
";
    assert_eq!(run(source), vec!["survives"]);
}

#[test]
fn loop_variable_is_shared_by_closures() {
    // One slot per loop, mutated each iteration: both closures see the
    // final value.
    let source = "\
var first; var second;
for (var a = 1; a <= 2; a = a + 1) {
  fun closure() { print a; }
  if (first == nil) { first = closure; } else { second = closure; }
}
first();
second();
";
    assert_eq!(run(source), vec!["3", "3"]);
}

#[test]
fn functions_render_by_name() {
    assert_eq!(run("fun f() {} print f;"), vec!["<fn f>"]);
    assert_eq!(run("print clock;"), vec!["<native fn>"]);
}

#[test]
fn native_clock_measures_time() {
    assert_eq!(
        run("var before = clock(); var after = clock(); print after >= before;"),
        vec!["true"]
    );
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

#[test]
fn initializer_binds_fields() {
    let source = "\
class Pair {
  init(a, b) { this.a = a; this.b = b; }
}
var p = Pair(1, 2);
print p.a + p.b;
";
    assert_eq!(run(source), vec!["3"]);
}

#[test]
fn super_dispatch() {
    let source = "\
class A {
  speak() { print \"A\"; }
}
class B < A {
  speak() {
    super.speak();
    print \"B\";
  }
}
B().speak();
";
    assert_eq!(run(source), vec!["A", "B"]);
}

#[test]
fn inherited_and_overridden_methods() {
    let source = "\
class A { m() { return \"A\"; } }
class B < A {}
class C < A { m() { return \"C\"; } }
print B().m();
print C().m();
";
    assert_eq!(run(source), vec!["A", "C"]);
}

#[test]
fn fields_are_created_on_assignment() {
    let source = "\
class Box {}
var box = Box();
box.value = 42;
print box.value;
print box.value = 7;
";
    assert_eq!(run(source), vec!["42", "7"]);
}

#[test]
fn bound_method_remembers_receiver() {
    let source = "\
class Greeter {
  init(name) { this.name = name; }
  greet() { print \"hi \" + this.name; }
}
var method = Greeter(\"ada\").greet;
method();
";
    assert_eq!(run(source), vec!["hi ada"]);
}

#[test]
fn field_shadows_method_on_invoke() {
    let source = "\
class Widget {
  act() { print \"method\"; }
}
var w = Widget();
fun replacement() { print \"field\"; }
w.act = replacement;
w.act();
";
    assert_eq!(run(source), vec!["field"]);
}

#[test]
fn calling_init_directly_returns_the_instance() {
    let source = "\
class Pair {
  init(a, b) { this.a = a; this.b = b; }
}
print Pair(1, 2).init(3, 4).a;
";
    assert_eq!(run(source), vec!["3"]);
}

#[test]
fn this_is_visible_to_nested_closures() {
    let source = "\
class Thing {
  callback() {
    fun inner() { print this.label; }
    return inner;
  }
}
var t = Thing();
t.label = \"captured\";
var f = t.callback();
f();
";
    assert_eq!(run(source), vec!["captured"]);
}

#[test]
fn class_renderings() {
    assert_eq!(run("class Foo {} print Foo;"), vec!["<class Foo>"]);
    assert_eq!(run("class Foo {} print Foo();"), vec!["<Foo instance>"]);
    assert_eq!(
        run("class Foo { m() {} } print Foo().m;"),
        vec!["<fn m>"]
    );
}

// ---------------------------------------------------------------------------
// Compile errors
// ---------------------------------------------------------------------------

#[test]
fn error_message_format_and_location() {
    let mut vm = Vm::with_capture();
    let err = vm.interpret("var x = ;").unwrap_err();
    assert!(matches!(err, Error::Compile(_)));
    let diagnostics = vm.take_diagnostics();
    assert_eq!(diagnostics, vec!["[line 1] Error at ';': Expect expression."]);
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    let mut vm = Vm::with_capture();
    vm.interpret("foo bar; baz qux;").unwrap_err();
    // One diagnostic per statement, not a cascade.
    assert_eq!(vm.take_diagnostics().len(), 2);
}

#[test]
fn invalid_assignment_target() {
    let message = compile_error("var a = 1; var b = 2; a + b = 3;");
    assert!(message.contains("Invalid assignment target."));
}

#[test]
fn reading_local_in_its_own_initializer() {
    let message = compile_error("var a = 1; { var a = a; }");
    assert!(message.contains("Can't read local variable in its own initializer."));
}

#[test]
fn duplicate_local_in_same_scope() {
    let message = compile_error("{ var a = 1; var a = 2; }");
    assert!(message.contains("Already a variable with this name in this scope."));
}

#[test]
fn this_and_super_placement() {
    assert!(compile_error("print this;").contains("Can't use 'this' outside of a class."));
    assert!(
        compile_error("fun f() { return super.x; }")
            .contains("Can't use 'super' outside of a class.")
    );
    assert!(
        compile_error("class A { m() { super.m(); } }")
            .contains("Can't use 'super' in a class with no superclass.")
    );
}

#[test]
fn return_placement() {
    assert!(compile_error("return 1;").contains("Can't return from top-level code."));
    assert!(
        compile_error("class A { init() { return 1; } }")
            .contains("Can't return a value from an initializer.")
    );
    // A bare return inside an initializer is allowed.
    assert_eq!(
        run("class A { init() { return; } } print A().init == nil;"),
        vec!["false"]
    );
}

#[test]
fn class_cannot_inherit_from_itself() {
    let message = compile_error("class Ouroboros < Ouroboros {}");
    assert!(message.contains("A class can't inherit from itself."));
}

#[test]
fn parameter_limits() {
    let mut ok = String::from("fun wide(");
    for i in 0..255 {
        if i > 0 {
            ok.push_str(", ");
        }
        ok.push_str(&format!("p{}", i));
    }
    ok.push_str(") { return p0; } print wide(");
    for i in 0..255 {
        if i > 0 {
            ok.push_str(", ");
        }
        ok.push_str(&i.to_string());
    }
    ok.push_str(");");
    // 255 parameters (and 255 arguments) compile and run.
    assert_eq!(run(&ok), vec!["0"]);

    let mut too_many = String::from("fun wide(");
    for i in 0..256 {
        if i > 0 {
            too_many.push_str(", ");
        }
        too_many.push_str(&format!("p{}", i));
    }
    too_many.push_str(") { return p0; }");
    assert!(compile_error(&too_many).contains("Can't have more than 255 parameters."));
}

#[test]
fn constant_pool_overflow() {
    // Hundreds of distinct literals in one chunk exhaust the one-byte
    // constant index.
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("print {}.5;\n", i));
    }
    assert!(compile_error(&source).contains("Too many constants in one chunk."));
}

#[test]
fn jump_distance_overflow() {
    // A then-branch bigger than 65535 bytes cannot be jumped over. Each
    // block compiles to five bytes and no constants.
    let mut source = String::from("if (true) {\n");
    for _ in 0..14000 {
        source.push_str("{ var a; a; }\n");
    }
    source.push('}');
    assert!(compile_error(&source).contains("Too much code to jump over."));
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

#[test]
fn undefined_variable() {
    assert_eq!(runtime_error("print missing;"), "Undefined variable 'missing'.");
    assert_eq!(runtime_error("missing = 1;"), "Undefined variable 'missing'.");
}

#[test]
fn undefined_property() {
    assert_eq!(
        runtime_error("class A {} print A().nothing;"),
        "Undefined property 'nothing'."
    );
    assert_eq!(
        runtime_error("class A {} A().nothing();"),
        "Undefined property 'nothing'."
    );
}

#[test]
fn operand_type_errors() {
    assert_eq!(runtime_error("print -\"a\";"), "Operand must be a number.");
    assert_eq!(runtime_error("print \"a\" < \"b\";"), "Operands must be numbers.");
    assert_eq!(
        runtime_error("print \"a\" + 1;"),
        "Operands must be two numbers or two strings."
    );
}

#[test]
fn only_instances_have_properties() {
    assert_eq!(
        runtime_error("print (1).x;"),
        "Only instances have properties."
    );
    assert_eq!(runtime_error("var s = \"str\"; s.x = 1;"), "Only instances have fields.");
    assert_eq!(runtime_error("true.m();"), "Only instances have methods.");
}

#[test]
fn calling_non_callables() {
    assert_eq!(
        runtime_error("var x = 1; x();"),
        "Can only call functions and classes."
    );
    assert_eq!(
        runtime_error("\"text\"();"),
        "Can only call functions and classes."
    );
}

#[test]
fn arity_is_checked() {
    assert_eq!(
        runtime_error("fun two(a, b) {} two(1);"),
        "Expected 2 arguments but got 1."
    );
    assert_eq!(
        runtime_error("class A {} A(1);"),
        "Expected 0 arguments but got 1."
    );
    assert_eq!(
        runtime_error("class A { init(x) {} } A();"),
        "Expected 1 arguments but got 0."
    );
}

#[test]
fn superclass_must_be_a_class() {
    assert_eq!(
        runtime_error("var NotAClass = 1; class Sub < NotAClass {}"),
        "Superclass must be a class."
    );
}

#[test]
fn deep_recursion_overflows_at_the_frame_limit() {
    // 63 nested calls fit under the 64-frame cap (the script takes one).
    let source = "\
var depth = 0;
fun sink(n) { depth = n; if (n > 1) sink(n - 1); }
sink(63);
print depth;
";
    assert_eq!(run(source), vec!["1"]);

    assert_eq!(
        runtime_error("fun forever() { forever(); } forever();"),
        "Stack overflow."
    );
}

// ---------------------------------------------------------------------------
// Garbage collection under pressure
// ---------------------------------------------------------------------------

#[test]
fn long_running_program_with_garbage() {
    // Builds and drops many short-lived strings and instances; everything
    // observable must survive collections.
    let source = "\
class Node {
  init(value) { this.value = value; }
}
var keep = \"\";
for (var i = 0; i < 200; i = i + 1) {
  var n = Node(\"x\");
  keep = n.value + keep;
}
var total = 0;
for (var i = 0; i < 200; i = i + 1) { total = total + 1; }
print total;
";
    assert_eq!(run(source), vec!["200"]);
}
