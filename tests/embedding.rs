/// Embedding tests: foreign classes and methods, the slot API, persistent
/// handles, and calling script methods from the host.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use wisp::{ForeignClassMethods, SlotType, Vm, VmConfig};

// ─── A foreign Counter class backed by a little-endian f64 ───────────────────

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn counter_value(data: &[u8]) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(data);
    f64::from_le_bytes(bytes)
}

fn counter_allocate(vm: &mut Vm) {
    // Slot zero holds the class; replace it with the new foreign object.
    vm.set_slot_new_foreign(0, 0, 8);
    if let Some(data) = vm.get_slot_foreign_mut(0) {
        data.copy_from_slice(&0f64.to_le_bytes());
    }
}

fn counter_finalize(_data: &mut [u8]) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

fn counter_increment(vm: &mut Vm) {
    let amount = vm.get_slot_num(1).unwrap_or(0.0);
    if let Some(data) = vm.get_slot_foreign_mut(0) {
        let next = counter_value(data) + amount;
        data.copy_from_slice(&next.to_le_bytes());
    }
    vm.set_slot_null(0);
}

fn counter_get(vm: &mut Vm) {
    let value = vm.get_slot_foreign(0).map(counter_value).unwrap_or(0.0);
    vm.set_slot_num(0, value);
}

fn counter_boom(vm: &mut Vm) {
    vm.set_slot_string(0, "kaboom");
    vm.abort_fiber(0);
}

const COUNTER_SCRIPT: &str = "foreign class Counter {\n\
                              construct new() {}\n\
                              foreign increment(amount)\n\
                              foreign value\n\
                              foreign static boom()\n\
                              }\n";

fn foreign_vm() -> (Vm, Rc<RefCell<String>>) {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);
    let mut config = VmConfig::default();
    config.write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
    config.bind_foreign_class = Some(Box::new(|_module, class| {
        if class == "Counter" {
            Some(ForeignClassMethods {
                allocate: counter_allocate,
                finalize: Some(counter_finalize),
            })
        } else {
            None
        }
    }));
    config.bind_foreign_method = Some(Box::new(|_module, class, is_static, signature| {
        match (class, is_static, signature) {
            ("Counter", false, "increment(_)") => {
                Some(counter_increment as wisp::ForeignMethodFn)
            }
            ("Counter", false, "value") => Some(counter_get as wisp::ForeignMethodFn),
            ("Counter", true, "boom()") => Some(counter_boom as wisp::ForeignMethodFn),
            _ => None,
        }
    }));
    (Vm::new(config), output)
}

#[test]
fn test_foreign_class_round_trip() {
    let (mut vm, output) = foreign_vm();
    let source = format!(
        "{}var c = Counter.new()\n\
         c.increment(3)\n\
         c.increment(4)\n\
         System.print(c.value)",
        COUNTER_SCRIPT
    );
    vm.interpret("main", &source).expect("counter script should run");
    assert_eq!(*output.borrow(), "7\n");
}

#[test]
fn test_foreign_finalizers_run_on_collection() {
    let (mut vm, _output) = foreign_vm();
    let source = format!(
        "{}for (i in 1..10) Counter.new()\n\
         System.print(\"done\")",
        COUNTER_SCRIPT
    );
    let before = FINALIZED.load(Ordering::SeqCst);
    vm.interpret("main", &source).expect("should run");
    vm.collect();
    let after = FINALIZED.load(Ordering::SeqCst);
    assert!(
        after - before >= 10,
        "expected at least 10 finalizations, got {}",
        after - before
    );
}

#[test]
fn test_foreign_method_can_abort_the_fiber() {
    let (mut vm, output) = foreign_vm();
    let source = format!(
        "{}System.print(Fiber.new {{ Counter.boom() }}.try())",
        COUNTER_SCRIPT
    );
    vm.interpret("main", &source).expect("the abort is caught by try");
    assert_eq!(*output.borrow(), "kaboom\n");
}

#[test]
fn test_unbound_foreign_method_is_runtime_error() {
    let (mut vm, _output) = foreign_vm();
    let source = format!("{}var c = 1", "foreign class Counter {\nforeign nope()\n}\n");
    let result = vm.interpret("main", &source);
    assert!(result.is_err(), "binding 'nope()' should fail: {:?}", result);
}

// ─── Slot API ─────────────────────────────────────────────────────────────────

#[test]
fn test_slots_read_module_variables() {
    let mut vm = Vm::new(VmConfig::default());
    vm.interpret("main", "var x = 42\nvar s = \"hi\"\nvar flag = true")
        .expect("should run");

    assert!(vm.get_variable("main", "x", 0));
    assert_eq!(vm.get_slot_type(0), SlotType::Num);
    assert_eq!(vm.get_slot_num(0), Some(42.0));

    assert!(vm.get_variable("main", "s", 1));
    assert_eq!(vm.get_slot_type(1), SlotType::String);
    assert_eq!(vm.get_slot_string(1), Some("hi".to_string()));

    assert!(vm.get_variable("main", "flag", 2));
    assert_eq!(vm.get_slot_bool(2), Some(true));

    assert!(!vm.get_variable("main", "missing", 0));
    assert!(!vm.get_variable("other", "x", 0));
    assert!(vm.has_variable("main", "x"));
    assert!(vm.has_module("main"));
}

#[test]
fn test_slot_lists_and_maps() {
    let mut vm = Vm::new(VmConfig::default());
    vm.ensure_slots(3);

    vm.set_slot_new_list(0);
    vm.set_slot_num(1, 7.0);
    vm.insert_in_list(0, 0, 1);
    vm.set_slot_num(1, 9.0);
    vm.insert_in_list(0, 1, 1);
    assert_eq!(vm.get_list_count(0), 2);
    vm.get_list_element(0, 1, 2);
    assert_eq!(vm.get_slot_num(2), Some(9.0));

    vm.set_slot_new_map(0);
    vm.set_slot_string(1, "key");
    vm.set_slot_num(2, 5.0);
    vm.set_map_value(0, 1, 2);
    assert_eq!(vm.get_map_count(0), 1);
    assert!(vm.map_contains_key(0, 1));
    vm.get_map_value(0, 1, 2);
    assert_eq!(vm.get_slot_num(2), Some(5.0));
}

#[test]
fn test_slot_type_mismatches_are_none() {
    let mut vm = Vm::new(VmConfig::default());
    vm.ensure_slots(1);
    vm.set_slot_num(0, 1.0);
    assert_eq!(vm.get_slot_bool(0), None);
    assert_eq!(vm.get_slot_string(0), None);
}

// ─── Handles and host-driven calls ────────────────────────────────────────────

#[test]
fn test_call_handle_invokes_script_method() {
    let mut vm = Vm::new(VmConfig::default());
    vm.interpret("main", "class Calc {\nstatic add(a, b) { return a + b }\n}")
        .expect("should compile");

    vm.ensure_slots(3);
    assert!(vm.get_variable("main", "Calc", 0));
    vm.set_slot_num(1, 2.0);
    vm.set_slot_num(2, 3.0);
    let add = vm.make_call_handle("add(_,_)");
    vm.call(&add).expect("call should succeed");
    assert_eq!(vm.get_slot_num(0), Some(5.0));
    vm.release_handle(add);
}

#[test]
fn test_value_handles_survive_collection() {
    let mut vm = Vm::new(VmConfig::default());
    vm.interpret("main", "var s = \"persistent\"").expect("should run");
    assert!(vm.get_variable("main", "s", 0));
    let handle = vm.get_slot_handle(0);

    vm.ensure_slots(1);
    vm.set_slot_null(0);
    vm.collect();

    vm.set_slot_handle(0, &handle);
    assert_eq!(vm.get_slot_string(0), Some("persistent".to_string()));
    vm.release_handle(handle);
}

#[test]
fn test_call_handle_on_instance_method() {
    let mut vm = Vm::new(VmConfig::default());
    vm.interpret(
        "main",
        "class Greeter {\nconstruct new() {}\ngreet(name) { return \"hi \" + name }\n}\n\
         var greeter = Greeter.new()",
    )
    .expect("should run");

    vm.ensure_slots(2);
    assert!(vm.get_variable("main", "greeter", 0));
    vm.set_slot_string(1, "host");
    let greet = vm.make_call_handle("greet(_)");
    vm.call(&greet).expect("call should succeed");
    assert_eq!(vm.get_slot_string(0), Some("hi host".to_string()));
}
