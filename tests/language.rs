/// End-to-end language tests: whole scripts run through a fresh VM with
/// captured output.
///
/// These cover:
///   • arithmetic, printing, and the number fast path
///   • control flow: if/else, while, for-in, break, continue, ?: and && ||
///   • classes: constructors, fields, inheritance, super, operators,
///     static methods and static fields
///   • closures and upvalues (open and closed)
///   • fibers: call/yield/try/abort/transfer with value passing
///   • collections: lists, maps, ranges, string iteration, interpolation
///   • modules: imports, selective imports with renaming, forward refs
///   • compile- and runtime-error reporting, including the documented
///     limit boundaries

use std::cell::RefCell;
use std::rc::Rc;

use wisp::{ErrorKind, Vm, VmConfig, WispError};

// ─── Helpers ──────────────────────────────────────────────────────────────────

type ErrorLog = Rc<RefCell<Vec<(ErrorKind, Option<String>, i32, String)>>>;

fn build_vm() -> (Vm, Rc<RefCell<String>>, ErrorLog) {
    let output = Rc::new(RefCell::new(String::new()));
    let errors: ErrorLog = Rc::new(RefCell::new(Vec::new()));

    let output_sink = Rc::clone(&output);
    let error_sink = Rc::clone(&errors);
    let mut config = VmConfig::default();
    config.write = Some(Box::new(move |text| {
        output_sink.borrow_mut().push_str(text);
    }));
    config.error = Some(Box::new(move |kind, module, line, message| {
        error_sink
            .borrow_mut()
            .push((kind, module.map(str::to_string), line, message.to_string()));
    }));
    (Vm::new(config), output, errors)
}

fn run(source: &str) -> String {
    let (mut vm, output, errors) = build_vm();
    let result = vm.interpret("main", source);
    assert!(
        result.is_ok(),
        "script failed: {:?}\nerrors: {:?}",
        result,
        errors.borrow()
    );
    let text = output.borrow().clone();
    text
}

fn run_expect_runtime_error(source: &str) -> (String, Vec<(ErrorKind, Option<String>, i32, String)>) {
    let (mut vm, _output, errors) = build_vm();
    let result = vm.interpret("main", source);
    match result {
        Err(WispError::Runtime { message }) => (message, errors.borrow().clone()),
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

fn compile_errors(source: &str) -> Vec<String> {
    let (mut vm, _output, errors) = build_vm();
    let result = vm.interpret("main", source);
    assert!(
        matches!(result, Err(WispError::Compile { .. })),
        "expected compile errors, got {:?}",
        result
    );
    let result = errors
        .borrow()
        .iter()
        .filter(|(kind, _, _, _)| *kind == ErrorKind::Compile)
        .map(|(_, _, _, message)| message.clone())
        .collect();
    result
}

// ─── The contract scenarios ───────────────────────────────────────────────────

#[test]
fn test_print_addition() {
    assert_eq!(run("System.print(1 + 2)"), "3\n");
}

#[test]
fn test_for_loop_sum() {
    let source = "var xs = [1,2,3]\nvar s = 0\nfor (x in xs) s = s + x\nSystem.print(s)";
    assert_eq!(run(source), "6\n");
}

#[test]
fn test_super_call() {
    let source = "class A { foo() { return 1 } }\n\
                  class B is A { foo() { return super.foo() + 1 } }\n\
                  System.print(B.new().foo())";
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_fiber_yield() {
    let source = "var f = Fiber.new { Fiber.yield(10) }\n\
                  System.print(f.call())\n\
                  System.print(f.call())";
    assert_eq!(run(source), "10\nnull\n");
}

#[test]
fn test_fiber_try_catches_abort() {
    let source = "var f = Fiber.new { Fiber.abort(\"oops\") }\n\
                  System.print(f.try())";
    assert_eq!(run(source), "oops\n");
}

#[test]
fn test_constructor_and_field() {
    let source = "class C { construct new() { _x = 42 } x { _x } }\n\
                  System.print(C.new().x)";
    assert_eq!(run(source), "42\n");
}

// ─── Expressions and control flow ─────────────────────────────────────────────

#[test]
fn test_arithmetic_and_precedence() {
    assert_eq!(run("System.print(2 + 3 * 4)"), "14\n");
    assert_eq!(run("System.print((2 + 3) * 4)"), "20\n");
    assert_eq!(run("System.print(7 % 3)"), "1\n");
    assert_eq!(run("System.print(10 / 4)"), "2.5\n");
    assert_eq!(run("System.print(-3.abs)"), "-3\n");
    assert_eq!(run("System.print((-3).abs)"), "3\n");
}

#[test]
fn test_division_by_zero_is_ieee() {
    assert_eq!(run("System.print(1 / 0)"), "infinity\n");
    assert_eq!(run("System.print(-1 / 0)"), "-infinity\n");
    assert_eq!(run("System.print(0 / 0)"), "nan\n");
}

#[test]
fn test_comparison_and_equality() {
    assert_eq!(run("System.print(1 < 2)"), "true\n");
    assert_eq!(run("System.print(2 <= 1)"), "false\n");
    assert_eq!(run("System.print(1 == 1.0)"), "true\n");
    assert_eq!(run("System.print(\"a\" == \"a\")"), "true\n");
    assert_eq!(run("System.print(\"a\" != \"b\")"), "true\n");
    assert_eq!(run("System.print(1 == \"1\")"), "false\n");
}

#[test]
fn test_bitwise_operators() {
    assert_eq!(run("System.print(6 & 3)"), "2\n");
    assert_eq!(run("System.print(6 | 3)"), "7\n");
    assert_eq!(run("System.print(6 ^ 3)"), "5\n");
    assert_eq!(run("System.print(1 << 4)"), "16\n");
    assert_eq!(run("System.print(16 >> 2)"), "4\n");
}

#[test]
fn test_logical_operators_short_circuit() {
    assert_eq!(run("System.print(false || \"x\")"), "x\n");
    assert_eq!(run("System.print(null && 1)"), "null\n");
    assert_eq!(run("System.print(true && 7)"), "7\n");
    // The right side must not evaluate when short-circuited.
    let source = "var f = Fiber.new { Fiber.abort(\"boom\") }\n\
                  System.print(false && f.call())";
    assert_eq!(run(source), "false\n");
}

#[test]
fn test_conditional_operator() {
    assert_eq!(run("System.print(true ? \"y\" : \"n\")"), "y\n");
    assert_eq!(run("System.print(1 > 2 ? \"y\" : \"n\")"), "n\n");
}

#[test]
fn test_if_else() {
    let source = "if (1 < 2) System.print(\"then\") else System.print(\"else\")";
    assert_eq!(run(source), "then\n");
}

#[test]
fn test_while_break_continue() {
    let source = "var i = 0\n\
                  var total = 0\n\
                  while (true) {\n\
                    i = i + 1\n\
                    if (i > 5) break\n\
                    if (i % 2 == 0) continue\n\
                    total = total + i\n\
                  }\n\
                  System.print(total)";
    assert_eq!(run(source), "9\n");
}

#[test]
fn test_string_interpolation() {
    assert_eq!(run("System.print(\"a %(1 + 1) b\")"), "a 2 b\n");
    assert_eq!(
        run("var name = \"world\"\nSystem.print(\"hi %(name)!\")"),
        "hi world!\n"
    );
    // Nested interpolation.
    assert_eq!(run("System.print(\"x %(\"y %(1) z\") w\")"), "x y 1 z w\n");
}

// ─── Collections ──────────────────────────────────────────────────────────────

#[test]
fn test_list_operations() {
    let source = "var xs = [1, 2]\n\
                  xs.add(3)\n\
                  xs[0] = 10\n\
                  System.print(xs.count)\n\
                  System.print(xs[0] + xs[2])\n\
                  System.print(xs)";
    assert_eq!(run(source), "3\n13\n[10, 2, 3]\n");
}

#[test]
fn test_list_negative_index() {
    assert_eq!(run("System.print([1, 2, 3][-1])"), "3\n");
}

#[test]
fn test_list_index_out_of_bounds() {
    let (message, _) = run_expect_runtime_error("[1, 2][5]");
    assert_eq!(message, "Subscript out of bounds.");
}

#[test]
fn test_map_operations() {
    let source = "var m = {\"a\": 1, \"b\": 2}\n\
                  m[\"c\"] = m[\"a\"] + m[\"b\"]\n\
                  System.print(m[\"c\"])\n\
                  System.print(m.count)\n\
                  System.print(m.containsKey(\"a\"))\n\
                  System.print(m[\"missing\"])\n\
                  System.print(m.remove(\"a\"))\n\
                  System.print(m.count)";
    assert_eq!(run(source), "3\n3\ntrue\nnull\n1\n2\n");
}

#[test]
fn test_map_key_must_be_hashable() {
    let (message, _) = run_expect_runtime_error("var m = {}\nm[[1]] = 2");
    assert_eq!(message, "Key must be a value type.");
}

#[test]
fn test_range_iteration() {
    assert_eq!(
        run("var t = 0\nfor (i in 1..4) t = t + i\nSystem.print(t)"),
        "10\n"
    );
    assert_eq!(
        run("var t = 0\nfor (i in 1...4) t = t + i\nSystem.print(t)"),
        "6\n"
    );
    assert_eq!(run("System.print((1..3).isInclusive)"), "true\n");
    assert_eq!(run("System.print((1..3).to)"), "3\n");
}

#[test]
fn test_string_iteration_and_subscript() {
    assert_eq!(run("for (c in \"ab\") System.print(c)"), "a\nb\n");
    assert_eq!(run("System.print(\"hello\".count)"), "5\n");
    assert_eq!(run("System.print(\"hello\"[1])"), "e\n");
    assert_eq!(run("System.print(\"hello\".contains(\"ell\"))"), "true\n");
}

// ─── Classes ──────────────────────────────────────────────────────────────────

#[test]
fn test_inherited_field_offsets() {
    let source = "class A { construct new() { _a = 1 } a { _a } }\n\
                  class B is A {\n\
                    construct new() {\n\
                      super()\n\
                      _b = 2\n\
                    }\n\
                    b { _b }\n\
                  }\n\
                  var b = B.new()\n\
                  System.print(b.a + b.b)";
    assert_eq!(run(source), "3\n");
}

#[test]
fn test_operator_overload() {
    let source = "class Vec {\n\
                    construct new(x) { _x = x }\n\
                    x { _x }\n\
                    +(other) { return Vec.new(_x + other.x) }\n\
                    -(other) { return Vec.new(_x - other.x) }\n\
                    - { return Vec.new(0 - _x) }\n\
                  }\n\
                  System.print((Vec.new(1) + Vec.new(2)).x)\n\
                  System.print((Vec.new(5) - Vec.new(2)).x)\n\
                  System.print((-Vec.new(4)).x)";
    assert_eq!(run(source), "3\n3\n-4\n");
}

#[test]
fn test_subscript_overload() {
    let source = "class Grid {\n\
                    construct new() { _items = [0, 0, 0, 0] }\n\
                    [i, j] { _items[i * 2 + j] }\n\
                    [i, j]=(value) { _items[i * 2 + j] = value }\n\
                  }\n\
                  var g = Grid.new()\n\
                  g[1, 1] = 9\n\
                  System.print(g[1, 1])";
    assert_eq!(run(source), "9\n");
}

#[test]
fn test_setter_method() {
    let source = "class Box {\n\
                    construct new() { _v = 0 }\n\
                    value { _v }\n\
                    value=(v) { _v = v }\n\
                  }\n\
                  var b = Box.new()\n\
                  b.value = 17\n\
                  System.print(b.value)";
    assert_eq!(run(source), "17\n");
}

#[test]
fn test_static_methods_and_fields() {
    let source = "class Counter {\n\
                    static add(v) { __total = (__total == null) ? v : __total + v }\n\
                    static total { __total }\n\
                  }\n\
                  Counter.add(3)\n\
                  Counter.add(4)\n\
                  System.print(Counter.total)";
    assert_eq!(run(source), "7\n");
}

#[test]
fn test_implicit_this_call() {
    let source = "class Greeter {\n\
                    construct new() {}\n\
                    name { return \"wisp\" }\n\
                    greet() { return \"hi \" + name }\n\
                  }\n\
                  System.print(Greeter.new().greet())";
    assert_eq!(run(source), "hi wisp\n");
}

#[test]
fn test_is_operator_and_type() {
    let source = "class A {}\n\
                  class B is A {}\n\
                  System.print(B.new() is A)\n\
                  System.print(A.new() is B)\n\
                  System.print(1 is Num)\n\
                  System.print(\"s\".type.name)";
    assert_eq!(run(source), "true\nfalse\ntrue\nString\n");
}

#[test]
fn test_class_reflection() {
    let source = "class A {}\n\
                  class B is A {}\n\
                  System.print(B.name)\n\
                  System.print(B.supertype.name)\n\
                  System.print(Object.supertype)";
    assert_eq!(run(source), "B\nA\nnull\n");
}

#[test]
fn test_runtime_attributes() {
    let source = "#!version = 2\n\
                  class Tagged {}\n\
                  System.print(Tagged.attributes[\"version\"])";
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_multiple_constructors() {
    let source = "class Point {\n\
                    construct new(x) { _x = x }\n\
                    construct zero() { _x = 0 }\n\
                    x { _x }\n\
                  }\n\
                  System.print(Point.new(5).x)\n\
                  System.print(Point.zero().x)";
    assert_eq!(run(source), "5\n0\n");
}

#[test]
fn test_cannot_inherit_from_builtin() {
    let (message, _) = run_expect_runtime_error("class Sub is Num {}");
    assert_eq!(
        message,
        "Class 'Sub' cannot inherit from built-in class 'Num'."
    );
}

#[test]
fn test_cannot_inherit_from_non_class() {
    let (message, _) = run_expect_runtime_error("var x = 1\nclass Sub is x {}");
    assert_eq!(message, "Class 'Sub' cannot inherit from a non-class object.");
}

// ─── Closures and upvalues ────────────────────────────────────────────────────

#[test]
fn test_closure_counter() {
    let source = "class Make {\n\
                    static counter {\n\
                      var count = 0\n\
                      return Fn.new {\n\
                        count = count + 1\n\
                        return count\n\
                      }\n\
                    }\n\
                  }\n\
                  var c = Make.counter\n\
                  System.print(c.call())\n\
                  System.print(c.call())";
    assert_eq!(run(source), "1\n2\n");
}

#[test]
fn test_closures_are_independent() {
    let source = "var make = Fn.new {\n\
                    var n = 0\n\
                    return Fn.new {\n\
                      n = n + 1\n\
                      return n\n\
                    }\n\
                  }\n\
                  var a = make.call()\n\
                  var b = make.call()\n\
                  a.call()\n\
                  System.print(a.call())\n\
                  System.print(b.call())";
    assert_eq!(run(source), "2\n1\n");
}

#[test]
fn test_sibling_closures_share_an_upvalue() {
    let source = "var get = null\n\
                  var set = null\n\
                  if (true) {\n\
                    var shared = 10\n\
                    get = Fn.new { return shared }\n\
                    set = Fn.new { shared = shared + 5 }\n\
                  }\n\
                  set.call()\n\
                  System.print(get.call())";
    assert_eq!(run(source), "15\n");
}

#[test]
fn test_fn_block_with_parameters() {
    let source = "var add = Fn.new {|a, b| a + b }\n\
                  System.print(add.call(3, 4))\n\
                  System.print(add.arity)";
    assert_eq!(run(source), "7\n2\n");
}

// ─── Fibers ───────────────────────────────────────────────────────────────────

#[test]
fn test_fiber_value_passing_both_ways() {
    let source = "var f = Fiber.new {|x|\n\
                    System.print(x)\n\
                    System.print(Fiber.yield(\"from fiber\"))\n\
                  }\n\
                  System.print(f.call(\"first\"))\n\
                  f.call(\"second\")";
    assert_eq!(run(source), "first\nfrom fiber\nsecond\n");
}

#[test]
fn test_fiber_is_done_and_error() {
    let source = "var f = Fiber.new { 1 }\n\
                  System.print(f.isDone)\n\
                  f.call()\n\
                  System.print(f.isDone)\n\
                  var g = Fiber.new { Fiber.abort(\"bad\") }\n\
                  g.try()\n\
                  System.print(g.error)";
    assert_eq!(run(source), "false\ntrue\nbad\n");
}

#[test]
fn test_fiber_call_finished_fiber_errors() {
    let source = "var f = Fiber.new { 1 }\n\
                  f.call()\n\
                  f.call()";
    let (message, _) = run_expect_runtime_error(source);
    assert_eq!(message, "Cannot call a finished fiber.");
}

#[test]
fn test_fiber_transfer_abandons_caller() {
    let source = "var f = Fiber.new { System.print(\"in\") }\n\
                  f.transfer()\n\
                  System.print(\"never\")";
    assert_eq!(run(source), "in\n");
}

#[test]
fn test_nested_fiber_try() {
    let source = "var inner = Fiber.new { Fiber.abort(\"deep\") }\n\
                  var outer = Fiber.new { inner.call() }\n\
                  System.print(outer.try())";
    assert_eq!(run(source), "deep\n");
}

#[test]
fn test_abort_with_null_is_no_op() {
    let source = "var f = Fiber.new {\n\
                    Fiber.abort(null)\n\
                    System.print(\"alive\")\n\
                  }\n\
                  f.call()";
    assert_eq!(run(source), "alive\n");
}

// ─── Modules ──────────────────────────────────────────────────────────────────

fn vm_with_modules() -> (Vm, Rc<RefCell<String>>) {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);
    let mut config = VmConfig::default();
    config.write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
    config.load_module = Some(Box::new(|name| match name {
        "math" => Some("var pi = 3\nvar tau = 6\nSystem.print(\"math loaded\")".to_string()),
        "shapes" => Some("import \"math\" for pi\nvar area = pi * 4".to_string()),
        _ => None,
    }));
    (Vm::new(config), output)
}

#[test]
fn test_import_selective_and_renamed() {
    let (mut vm, output) = vm_with_modules();
    vm.interpret("main", "import \"math\" for pi, tau as t\nSystem.print(pi + t)")
        .expect("import should run");
    assert_eq!(*output.borrow(), "math loaded\n9\n");
}

#[test]
fn test_module_body_runs_once() {
    let (mut vm, output) = vm_with_modules();
    vm.interpret(
        "main",
        "import \"math\"\nimport \"shapes\" for area\nSystem.print(area)",
    )
    .expect("imports should run");
    assert_eq!(*output.borrow(), "math loaded\n12\n");
}

#[test]
fn test_missing_module_is_runtime_error() {
    let (mut vm, _output) = vm_with_modules();
    let result = vm.interpret("main", "import \"nope\"");
    assert!(
        matches!(result, Err(WispError::Runtime { message }) if message == "Could not load module 'nope'."),
    );
}

#[test]
fn test_missing_import_variable() {
    let (mut vm, _output) = vm_with_modules();
    let result = vm.interpret("main", "import \"math\" for nope");
    assert!(matches!(
        result,
        Err(WispError::Runtime { message })
            if message == "Could not find a variable named 'nope' in module 'math'."
    ));
}

#[test]
fn test_forward_reference_between_classes() {
    let source = "class A { static go { return B.value } }\n\
                  class B { static value { return 9 } }\n\
                  System.print(A.go)";
    assert_eq!(run(source), "9\n");
}

#[test]
fn test_unresolved_forward_reference_is_compile_error() {
    let errors = compile_errors("System.print(Undefined)");
    assert!(errors
        .iter()
        .any(|e| e.contains("Variable is used but not defined.")));
}

// ─── Errors and diagnostics ───────────────────────────────────────────────────

#[test]
fn test_method_not_found_message() {
    let (message, reports) = run_expect_runtime_error("var x = 1\nx.nope");
    assert_eq!(message, "Num does not implement 'nope'.");
    // The runtime error is followed by a stack trace locating line 2.
    assert!(reports
        .iter()
        .any(|(kind, _, _, m)| *kind == ErrorKind::Runtime && m == &message));
    assert!(reports
        .iter()
        .any(|(kind, module, line, _)| *kind == ErrorKind::StackTrace
            && module.as_deref() == Some("main")
            && *line == 2));
}

#[test]
fn test_uncaught_abort_in_nested_call_has_trace() {
    let source = "class Deep {\n\
                    static one() { two() }\n\
                    static two() { Fiber.abort(\"down here\") }\n\
                  }\n\
                  Deep.one()";
    let (message, reports) = run_expect_runtime_error(source);
    assert_eq!(message, "down here");
    let trace: Vec<i32> = reports
        .iter()
        .filter(|(kind, _, _, _)| *kind == ErrorKind::StackTrace)
        .map(|(_, _, line, _)| *line)
        .collect();
    // Top of stack first: the abort site, then its caller, then the module
    // body.
    assert_eq!(trace, vec![3, 2, 5]);
}

#[test]
fn test_compile_errors_accumulate() {
    let errors = compile_errors("var 1 = 2\nvar x = )\n");
    assert!(errors.len() >= 2, "expected several errors, got {:?}", errors);
}

#[test]
fn test_arity_error_message() {
    let (message, _) = run_expect_runtime_error("var f = Fn.new {|a, b| a + b }\nf.call(1)");
    assert_eq!(message, "Function expects more arguments.");
}

#[test]
fn test_stack_overflow() {
    let source = "class R { static go() { go() } }\nR.go()";
    let (message, _) = run_expect_runtime_error(source);
    assert_eq!(message, "Stack overflow.");
}

#[test]
fn test_operand_type_errors() {
    let (message, _) = run_expect_runtime_error("1 + \"x\"");
    assert_eq!(message, "Right operand must be a number.");
    let (message, _) = run_expect_runtime_error("\"x\" + 1");
    assert_eq!(message, "Right operand must be a string.");
}

// ─── Documented limits ────────────────────────────────────────────────────────

#[test]
fn test_255_locals_compile_and_256_error() {
    let mut ok = String::from("var f = Fn.new {\n");
    for i in 0..255 {
        ok.push_str(&format!("var v{} = {}\n", i, i));
    }
    ok.push_str("}\nSystem.print(\"ok\")");
    assert_eq!(run(&ok), "ok\n");

    let mut bad = String::from("var f = Fn.new {\n");
    for i in 0..256 {
        bad.push_str(&format!("var v{} = {}\n", i, i));
    }
    bad.push_str("}\n");
    let errors = compile_errors(&bad);
    assert!(errors
        .iter()
        .any(|e| e.contains("Cannot declare more than 256 variables in one scope.")));
}

fn nested_interpolation(depth: usize) -> String {
    // Builds "%("…"%(1)"…")" nested `depth` levels deep.
    let mut source = String::from("var s = ");
    for _ in 0..depth {
        source.push_str("\"%(");
    }
    source.push('1');
    for _ in 0..depth {
        source.push_str(")\"");
    }
    source
}

#[test]
fn test_interpolation_nests_to_eight() {
    let source = format!("{}\nSystem.print(\"ok\")", nested_interpolation(8));
    assert_eq!(run(&source), "ok\n");
}

#[test]
fn test_interpolation_depth_nine_errors() {
    let errors = compile_errors(&nested_interpolation(9));
    assert!(errors
        .iter()
        .any(|e| e.contains("Interpolation may only nest 8 levels deep.")));
}

#[test]
fn test_too_much_code_to_jump_over() {
    // Each System.print(1) statement compiles to ten bytes, so 6554 of them
    // overflow the 16-bit jump of the surrounding if; 6553 stay just under.
    let mut ok = String::from("if (true) {\n");
    for _ in 0..6553 {
        ok.push_str("System.print(1)\n");
    }
    ok.push('}');
    let (mut vm, _output, errors) = build_vm();
    assert!(
        vm.interpret("main", &ok).is_ok(),
        "should compile: {:?}",
        errors.borrow().last()
    );

    let mut bad = String::from("if (true) {\n");
    for _ in 0..6554 {
        bad.push_str("System.print(1)\n");
    }
    bad.push('}');
    let errors = compile_errors(&bad);
    assert!(errors.iter().any(|e| e.contains("Too much code to jump over.")));
}

// ─── Garbage collection under pressure ────────────────────────────────────────

#[test]
fn test_collection_during_execution() {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);
    let mut config = VmConfig::default();
    config.write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
    // A tiny threshold forces many cycles while the loop churns strings.
    config.initial_heap = 8 * 1024;
    config.min_heap = 4 * 1024;
    let mut vm = Vm::new(config);

    let source = "var keep = \"\"\n\
                  for (i in 1..200) {\n\
                    var s = \"x\" + i.toString\n\
                    keep = s\n\
                  }\n\
                  System.print(keep)";
    vm.interpret("main", source).expect("should survive collection");
    assert_eq!(*output.borrow(), "x200\n");
}

// ─── Misc surface ─────────────────────────────────────────────────────────────

#[test]
fn test_raw_strings_in_programs() {
    let source = "System.print(\"\"\"\nline one\n\"\"\")";
    assert_eq!(run(source), "line one\n");
}

#[test]
fn test_shebang_is_ignored() {
    assert_eq!(run("#!/usr/bin/env wisp\nSystem.print(\"ran\")"), "ran\n");
}

#[test]
fn test_object_to_string_defaults() {
    let source = "class Thing {}\n\
                  System.print(Thing.new())\n\
                  System.print(Thing)\n\
                  System.print(null)\n\
                  System.print(true)";
    assert_eq!(run(source), "instance of Thing\nThing\nnull\ntrue\n");
}

#[test]
fn test_system_write_does_not_add_newline() {
    assert_eq!(run("System.write(1)\nSystem.write(2)"), "12");
}

#[test]
fn test_hex_and_scientific_literals() {
    assert_eq!(run("System.print(0xFF)"), "255\n");
    assert_eq!(run("System.print(2e3)"), "2000\n");
    assert_eq!(run("System.print(1.5e-2)"), "0.015\n");
}
