/// Core Classes & Primitive Methods
///
/// Builds the built-in class hierarchy at VM creation and registers the
/// native method handlers. Bootstrap order matters: Object and Class form a
/// metaclass cycle (Object's metaclass is a class, whose class is Class,
/// whose class is itself), so the first three classes are created bare and
/// patched together before anything else exists.
///
/// Method tables are copied down when a class is created, so a class must
/// have all of its primitives registered before anything inherits from it.

use crate::heap::{ClassObj, ModuleObj, ObjData};
use crate::value::{num_to_string, Handle, Value};
use crate::vm::{Method, PrimitiveResult, Vm};

macro_rules! primitive {
    ($vm:expr, $class:expr, $signature:literal, $function:expr) => {{
        let symbol = $vm.method_names.ensure($signature);
        $vm.heap
            .class_obj_mut($class)
            .set_method(symbol, Method::Primitive($function));
    }};
}

pub(crate) fn initialize_core(vm: &mut Vm) {
    let core_module = vm.heap.alloc(None, ObjData::Module(ModuleObj::new(None)));
    vm.core_module = core_module;

    // ── Bootstrap the Object/Class metaclass cycle ───────────────────────────

    let object = bare_class(vm, "Object", None);
    vm.core.object = object;
    primitive!(vm, object, "!", prim_object_not);
    primitive!(vm, object, "==(_)", prim_object_eqeq);
    primitive!(vm, object, "!=(_)", prim_object_bangeq);
    primitive!(vm, object, "is(_)", prim_object_is);
    primitive!(vm, object, "toString", prim_object_to_string);
    primitive!(vm, object, "type", prim_object_type);

    let class = bare_class(vm, "Class", Some(object));
    vm.core.class = class;
    primitive!(vm, class, "name", prim_class_name);
    primitive!(vm, class, "supertype", prim_class_supertype);
    primitive!(vm, class, "toString", prim_class_name);
    primitive!(vm, class, "attributes", prim_class_attributes);
    primitive!(vm, class, "new()", prim_class_default_new);

    let object_metaclass = bare_class(vm, "Object metaclass", Some(class));
    vm.heap.obj_mut(object).class = Some(object_metaclass);
    vm.heap.obj_mut(object_metaclass).class = Some(class);
    vm.heap.obj_mut(class).class = Some(class);
    primitive!(vm, object_metaclass, "same(_,_)", prim_object_same);

    define_core_variable(vm, "Object", Value::obj(object));
    define_core_variable(vm, "Class", Value::obj(class));

    // ── The remaining built-ins ──────────────────────────────────────────────

    let bool_class = define_class(vm, "Bool");
    vm.core.bool_class = bool_class;
    primitive!(vm, bool_class, "toString", prim_bool_to_string);
    primitive!(vm, bool_class, "!", prim_bool_not);

    let null_class = define_class(vm, "Null");
    vm.core.null_class = null_class;
    primitive!(vm, null_class, "toString", prim_null_to_string);
    primitive!(vm, null_class, "!", prim_null_not);

    let num = define_class(vm, "Num");
    vm.core.num = num;
    primitive!(vm, num, "+(_)", prim_num_plus);
    primitive!(vm, num, "-(_)", prim_num_minus);
    primitive!(vm, num, "*(_)", prim_num_star);
    primitive!(vm, num, "/(_)", prim_num_slash);
    primitive!(vm, num, "%(_)", prim_num_percent);
    primitive!(vm, num, "<(_)", prim_num_lt);
    primitive!(vm, num, ">(_)", prim_num_gt);
    primitive!(vm, num, "<=(_)", prim_num_lteq);
    primitive!(vm, num, ">=(_)", prim_num_gteq);
    primitive!(vm, num, "==(_)", prim_num_eqeq);
    primitive!(vm, num, "!=(_)", prim_num_bangeq);
    primitive!(vm, num, "&(_)", prim_num_bitand);
    primitive!(vm, num, "|(_)", prim_num_bitor);
    primitive!(vm, num, "^(_)", prim_num_bitxor);
    primitive!(vm, num, "<<(_)", prim_num_shl);
    primitive!(vm, num, ">>(_)", prim_num_shr);
    primitive!(vm, num, "-", prim_num_negate);
    primitive!(vm, num, "~", prim_num_bitnot);
    primitive!(vm, num, "..(_)", prim_num_dotdot);
    primitive!(vm, num, "...(_)", prim_num_dotdotdot);
    primitive!(vm, num, "toString", prim_num_to_string);
    primitive!(vm, num, "abs", prim_num_abs);
    primitive!(vm, num, "floor", prim_num_floor);
    primitive!(vm, num, "isInteger", prim_num_is_integer);

    let string = define_class(vm, "String");
    vm.core.string = string;
    primitive!(vm, string, "+(_)", prim_string_plus);
    primitive!(vm, string, "==(_)", prim_object_eqeq);
    primitive!(vm, string, "!=(_)", prim_object_bangeq);
    primitive!(vm, string, "toString", prim_string_to_string);
    primitive!(vm, string, "count", prim_string_count);
    primitive!(vm, string, "[_]", prim_string_subscript);
    primitive!(vm, string, "iterate(_)", prim_string_iterate);
    primitive!(vm, string, "iteratorValue(_)", prim_string_iterator_value);
    primitive!(vm, string, "contains(_)", prim_string_contains);

    let list = define_class(vm, "List");
    vm.core.list = list;
    let list_metaclass = vm.heap.obj_class(list);
    primitive!(vm, list_metaclass, "new()", prim_list_new);
    primitive!(vm, list, "add(_)", prim_list_add);
    primitive!(vm, list, "addCore_(_)", prim_list_add_core);
    primitive!(vm, list, "count", prim_list_count);
    primitive!(vm, list, "[_]", prim_list_subscript);
    primitive!(vm, list, "[_]=(_)", prim_list_subscript_setter);
    primitive!(vm, list, "clear()", prim_list_clear);
    primitive!(vm, list, "insert(_,_)", prim_list_insert);
    primitive!(vm, list, "removeAt(_)", prim_list_remove_at);
    primitive!(vm, list, "iterate(_)", prim_list_iterate);
    primitive!(vm, list, "iteratorValue(_)", prim_list_iterator_value);
    primitive!(vm, list, "toString", prim_object_to_string);

    let map = define_class(vm, "Map");
    vm.core.map = map;
    let map_metaclass = vm.heap.obj_class(map);
    primitive!(vm, map_metaclass, "new()", prim_map_new);
    primitive!(vm, map, "[_]", prim_map_subscript);
    primitive!(vm, map, "[_]=(_)", prim_map_subscript_setter);
    primitive!(vm, map, "addCore_(_,_)", prim_map_add_core);
    primitive!(vm, map, "count", prim_map_count);
    primitive!(vm, map, "containsKey(_)", prim_map_contains_key);
    primitive!(vm, map, "remove(_)", prim_map_remove);
    primitive!(vm, map, "clear()", prim_map_clear);
    primitive!(vm, map, "toString", prim_object_to_string);

    let range = define_class(vm, "Range");
    vm.core.range = range;
    primitive!(vm, range, "from", prim_range_from);
    primitive!(vm, range, "to", prim_range_to);
    primitive!(vm, range, "min", prim_range_min);
    primitive!(vm, range, "max", prim_range_max);
    primitive!(vm, range, "isInclusive", prim_range_is_inclusive);
    primitive!(vm, range, "iterate(_)", prim_range_iterate);
    primitive!(vm, range, "iteratorValue(_)", prim_range_iterator_value);
    primitive!(vm, range, "toString", prim_object_to_string);

    let fn_class = define_class(vm, "Fn");
    vm.core.fn_class = fn_class;
    let fn_metaclass = vm.heap.obj_class(fn_class);
    primitive!(vm, fn_metaclass, "new(_)", prim_fn_new);
    primitive!(vm, fn_class, "arity", prim_fn_arity);
    primitive!(vm, fn_class, "toString", prim_object_to_string);
    for arity in 0..=16 {
        let signature = if arity == 0 {
            "call()".to_string()
        } else {
            format!("call({})", vec!["_"; arity].join(","))
        };
        let symbol = vm.method_names.ensure(&signature);
        vm.heap.class_obj_mut(fn_class).set_method(symbol, Method::FnCall);
    }

    let fiber = define_class(vm, "Fiber");
    vm.core.fiber = fiber;
    let fiber_metaclass = vm.heap.obj_class(fiber);
    primitive!(vm, fiber_metaclass, "new(_)", prim_fiber_new);
    primitive!(vm, fiber_metaclass, "current", prim_fiber_current);
    primitive!(vm, fiber_metaclass, "yield()", prim_fiber_yield);
    primitive!(vm, fiber_metaclass, "yield(_)", prim_fiber_yield);
    primitive!(vm, fiber_metaclass, "abort(_)", prim_fiber_abort);
    primitive!(vm, fiber, "call()", prim_fiber_call);
    primitive!(vm, fiber, "call(_)", prim_fiber_call);
    primitive!(vm, fiber, "try()", prim_fiber_try);
    primitive!(vm, fiber, "try(_)", prim_fiber_try);
    primitive!(vm, fiber, "transfer()", prim_fiber_transfer);
    primitive!(vm, fiber, "transfer(_)", prim_fiber_transfer);
    primitive!(vm, fiber, "error", prim_fiber_error);
    primitive!(vm, fiber, "isDone", prim_fiber_is_done);

    let system = define_class(vm, "System");
    let system_metaclass = vm.heap.obj_class(system);
    primitive!(vm, system_metaclass, "print()", prim_system_print_blank);
    primitive!(vm, system_metaclass, "print(_)", prim_system_print);
    primitive!(vm, system_metaclass, "write(_)", prim_system_write);
}

/// A class with no metaclass, used only for the bootstrap cycle.
fn bare_class(vm: &mut Vm, name: &str, superclass: Option<Handle>) -> Handle {
    let methods = match superclass {
        Some(superclass) => vm.heap.class_obj(superclass).methods.clone(),
        None => Vec::new(),
    };
    vm.heap.alloc(
        None,
        ObjData::Class(Box::new(ClassObj {
            name: name.to_string(),
            superclass,
            num_fields: 0,
            methods,
            attributes: Value::NULL,
            foreign: None,
        })),
    )
}

/// Creates a class with a proper metaclass, inheriting from Object, and
/// binds it as a core module variable.
fn define_class(vm: &mut Vm, name: &str) -> Handle {
    let object = vm.core.object;
    let class = vm.new_class(name, Some(object), 0);
    define_core_variable(vm, name, Value::obj(class));
    class
}

fn define_core_variable(vm: &mut Vm, name: &str, value: Value) {
    let core_module = vm.core_module;
    let module = vm.heap.module_mut(core_module);
    module.variable_names.add(name);
    module.variables.push(value);
}

// ── Validation helpers ───────────────────────────────────────────────────────

fn validate_num(vm: &mut Vm, value: Value, label: &str) -> Option<f64> {
    if value.is_num() {
        return Some(value.as_num());
    }
    vm.fiber_error(format!("{} must be a number.", label));
    None
}

fn validate_int(vm: &mut Vm, value: Value, label: &str) -> Option<f64> {
    let num = validate_num(vm, value, label)?;
    if num.fract() == 0.0 {
        return Some(num);
    }
    vm.fiber_error(format!("{} must be an integer.", label));
    None
}

/// Validates a subscript index against `count`, resolving negative indexes
/// from the end.
fn validate_index(vm: &mut Vm, value: Value, count: usize, label: &str) -> Option<usize> {
    let mut index = validate_int(vm, value, label)?;
    if index < 0.0 {
        index += count as f64;
    }
    if index >= 0.0 && (index as usize) < count {
        return Some(index as usize);
    }
    vm.fiber_error(format!("{} out of bounds.", label));
    None
}

fn validate_string(vm: &mut Vm, value: Value, label: &str) -> Option<Handle> {
    if vm.heap.is_string(value) {
        return Some(value.as_handle());
    }
    vm.fiber_error(format!("{} must be a string.", label));
    None
}

fn validate_fn(vm: &mut Vm, value: Value, label: &str) -> Option<Handle> {
    if vm.heap.is_closure(value) {
        return Some(value.as_handle());
    }
    vm.fiber_error(format!("{} must be a function.", label));
    None
}

macro_rules! try_prim {
    ($option:expr) => {
        match $option {
            Some(value) => value,
            None => return PrimitiveResult::Error,
        }
    };
}

// ── Object ───────────────────────────────────────────────────────────────────

fn prim_object_not(_vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::FALSE)
}

fn prim_object_eqeq(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::boolean(vm.heap.values_equal(args[0], args[1])))
}

fn prim_object_bangeq(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::boolean(!vm.heap.values_equal(args[0], args[1])))
}

fn prim_object_same(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::boolean(vm.heap.values_equal(args[1], args[2])))
}

fn prim_object_is(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    if !vm.heap.is_class(args[1]) {
        vm.fiber_error("Right operand must be a class.".into());
        return PrimitiveResult::Error;
    }
    let target = args[1].as_handle();
    let mut class = Some(vm.class_of(args[0]));
    while let Some(current) = class {
        if current == target {
            return PrimitiveResult::Value(Value::TRUE);
        }
        class = vm.heap.class_obj(current).superclass;
    }
    PrimitiveResult::Value(Value::FALSE)
}

fn prim_object_to_string(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let text = vm.value_to_display(args[0]);
    PrimitiveResult::Value(vm.string_value(&text))
}

fn prim_object_type(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::obj(vm.class_of(args[0])))
}

// ── Class ────────────────────────────────────────────────────────────────────

fn validate_class(vm: &mut Vm, value: Value) -> Option<Handle> {
    if vm.heap.is_class(value) {
        return Some(value.as_handle());
    }
    vm.fiber_error("Receiver must be a class.".into());
    None
}

fn prim_class_name(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let class = try_prim!(validate_class(vm, args[0]));
    let name = vm.heap.class_obj(class).name.clone();
    PrimitiveResult::Value(vm.string_value(&name))
}

fn prim_class_supertype(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let class = try_prim!(validate_class(vm, args[0]));
    match vm.heap.class_obj(class).superclass {
        Some(superclass) => PrimitiveResult::Value(Value::obj(superclass)),
        None => PrimitiveResult::Value(Value::NULL),
    }
}

fn prim_class_attributes(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let class = try_prim!(validate_class(vm, args[0]));
    PrimitiveResult::Value(vm.heap.class_obj(class).attributes)
}

/// Classes without a declared constructor still answer `new()` with an
/// uninitialized instance. The built-in classes are excluded: their values
/// are not field-backed instances.
fn prim_class_default_new(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let class = try_prim!(validate_class(vm, args[0]));
    let sealed = [
        vm.core.class,
        vm.core.bool_class,
        vm.core.null_class,
        vm.core.num,
        vm.core.string,
        vm.core.list,
        vm.core.map,
        vm.core.range,
        vm.core.fn_class,
        vm.core.fiber,
    ];
    if sealed.contains(&class) || vm.heap.class_obj(class).foreign.is_some() {
        let name = vm.heap.class_obj(class).name.clone();
        vm.fiber_error(format!("{} metaclass does not implement 'new()'.", name));
        return PrimitiveResult::Error;
    }
    let instance = vm.new_instance(class);
    PrimitiveResult::Value(Value::obj(instance))
}

// ── Bool and Null ────────────────────────────────────────────────────────────

fn prim_bool_to_string(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let text = if args[0].as_bool() { "true" } else { "false" };
    PrimitiveResult::Value(vm.string_value(text))
}

fn prim_bool_not(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::boolean(!args[0].as_bool()))
}

fn prim_null_to_string(vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(vm.string_value("null"))
}

fn prim_null_not(_vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::TRUE)
}

// ── Num ──────────────────────────────────────────────────────────────────────

macro_rules! num_binary {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
            let rhs = try_prim!(validate_num(vm, args[1], "Right operand"));
            PrimitiveResult::Value(Value::num(args[0].as_num() $op rhs))
        }
    };
}

macro_rules! num_compare {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
            let rhs = try_prim!(validate_num(vm, args[1], "Right operand"));
            PrimitiveResult::Value(Value::boolean(args[0].as_num() $op rhs))
        }
    };
}

macro_rules! num_bitwise {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
            let rhs = try_prim!(validate_num(vm, args[1], "Right operand"));
            let result = (args[0].as_num() as u32) $op (rhs as u32);
            PrimitiveResult::Value(Value::num(result as f64))
        }
    };
}

num_binary!(prim_num_plus, +);
num_binary!(prim_num_minus, -);
num_binary!(prim_num_star, *);
num_binary!(prim_num_slash, /);
num_binary!(prim_num_percent, %);
num_compare!(prim_num_lt, <);
num_compare!(prim_num_gt, >);
num_compare!(prim_num_lteq, <=);
num_compare!(prim_num_gteq, >=);
num_bitwise!(prim_num_bitand, &);
num_bitwise!(prim_num_bitor, |);
num_bitwise!(prim_num_bitxor, ^);

fn prim_num_shl(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let rhs = try_prim!(validate_num(vm, args[1], "Right operand"));
    let result = (args[0].as_num() as u32).wrapping_shl(rhs as u32);
    PrimitiveResult::Value(Value::num(result as f64))
}

fn prim_num_shr(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let rhs = try_prim!(validate_num(vm, args[1], "Right operand"));
    let result = (args[0].as_num() as u32).wrapping_shr(rhs as u32);
    PrimitiveResult::Value(Value::num(result as f64))
}

fn prim_num_eqeq(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let equal = args[1].is_num() && args[0].as_num() == args[1].as_num();
    PrimitiveResult::Value(Value::boolean(equal))
}

fn prim_num_bangeq(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let equal = args[1].is_num() && args[0].as_num() == args[1].as_num();
    PrimitiveResult::Value(Value::boolean(!equal))
}

fn prim_num_negate(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(-args[0].as_num()))
}

fn prim_num_bitnot(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(!(args[0].as_num() as u32) as f64))
}

fn prim_num_dotdot(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let to = try_prim!(validate_num(vm, args[1], "Right hand side of range"));
    let range = vm.new_range(args[0].as_num(), to, true);
    PrimitiveResult::Value(Value::obj(range))
}

fn prim_num_dotdotdot(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let to = try_prim!(validate_num(vm, args[1], "Right hand side of range"));
    let range = vm.new_range(args[0].as_num(), to, false);
    PrimitiveResult::Value(Value::obj(range))
}

fn prim_num_to_string(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let text = num_to_string(args[0].as_num());
    PrimitiveResult::Value(vm.string_value(&text))
}

fn prim_num_abs(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(args[0].as_num().abs()))
}

fn prim_num_floor(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(args[0].as_num().floor()))
}

fn prim_num_is_integer(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let n = args[0].as_num();
    PrimitiveResult::Value(Value::boolean(n.is_finite() && n.fract() == 0.0))
}

// ── String ───────────────────────────────────────────────────────────────────

fn prim_string_plus(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let rhs = try_prim!(validate_string(vm, args[1], "Right operand"));
    let mut bytes = vm.heap.string(args[0].as_handle()).bytes.to_vec();
    bytes.extend_from_slice(&vm.heap.string(rhs).bytes);
    let result = vm.new_string(bytes);
    PrimitiveResult::Value(Value::obj(result))
}

fn prim_string_to_string(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(args[0])
}

fn prim_string_count(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.string(args[0].as_handle()).as_str().chars().count();
    PrimitiveResult::Value(Value::num(count as f64))
}

fn prim_string_subscript(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.string(args[0].as_handle()).as_str().chars().count();
    let index = try_prim!(validate_index(vm, args[1], count, "Subscript"));
    let text = vm.heap.string(args[0].as_handle()).as_str().into_owned();
    match text.chars().nth(index) {
        Some(c) => PrimitiveResult::Value(vm.string_value(&c.to_string())),
        None => PrimitiveResult::Value(Value::NULL),
    }
}

fn prim_string_iterate(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.string(args[0].as_handle()).as_str().chars().count();
    if args[1].is_null() {
        if count == 0 {
            return PrimitiveResult::Value(Value::FALSE);
        }
        return PrimitiveResult::Value(Value::num(0.0));
    }
    let iterator = try_prim!(validate_int(vm, args[1], "Iterator"));
    if iterator < 0.0 {
        return PrimitiveResult::Value(Value::FALSE);
    }
    let next = iterator + 1.0;
    if (next as usize) >= count {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(next))
}

fn prim_string_iterator_value(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.string(args[0].as_handle()).as_str().chars().count();
    let index = try_prim!(validate_index(vm, args[1], count, "Iterator"));
    let text = vm.heap.string(args[0].as_handle()).as_str().into_owned();
    match text.chars().nth(index) {
        Some(c) => PrimitiveResult::Value(vm.string_value(&c.to_string())),
        None => PrimitiveResult::Value(Value::NULL),
    }
}

fn prim_string_contains(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let needle = try_prim!(validate_string(vm, args[1], "Argument"));
    let haystack = vm.heap.string(args[0].as_handle());
    let needle = &vm.heap.string(needle).bytes;
    let found = needle.is_empty()
        || haystack
            .bytes
            .windows(needle.len())
            .any(|window| window == &needle[..]);
    PrimitiveResult::Value(Value::boolean(found))
}

// ── List ─────────────────────────────────────────────────────────────────────

fn prim_list_new(vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    let list = vm.new_list(Vec::new());
    PrimitiveResult::Value(Value::obj(list))
}

fn prim_list_add(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    vm.heap.list_mut(args[0].as_handle()).push(args[1]);
    PrimitiveResult::Value(args[1])
}

/// Like add, but returns the list itself; emitted by list literals.
fn prim_list_add_core(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    vm.heap.list_mut(args[0].as_handle()).push(args[1]);
    PrimitiveResult::Value(args[0])
}

fn prim_list_count(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    PrimitiveResult::Value(Value::num(count as f64))
}

fn prim_list_subscript(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    let index = try_prim!(validate_index(vm, args[1], count, "Subscript"));
    PrimitiveResult::Value(vm.heap.list(args[0].as_handle())[index])
}

fn prim_list_subscript_setter(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    let index = try_prim!(validate_index(vm, args[1], count, "Subscript"));
    vm.heap.list_mut(args[0].as_handle())[index] = args[2];
    PrimitiveResult::Value(args[2])
}

fn prim_list_clear(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    vm.heap.list_mut(args[0].as_handle()).clear();
    PrimitiveResult::Value(Value::NULL)
}

fn prim_list_insert(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    // count + 1 because inserting after the last element is allowed.
    let index = try_prim!(validate_index(vm, args[1], count + 1, "Index"));
    vm.heap.list_mut(args[0].as_handle()).insert(index, args[2]);
    PrimitiveResult::Value(args[2])
}

fn prim_list_remove_at(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    let index = try_prim!(validate_index(vm, args[1], count, "Index"));
    let removed = vm.heap.list_mut(args[0].as_handle()).remove(index);
    PrimitiveResult::Value(removed)
}

fn prim_list_iterate(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    if args[1].is_null() {
        if count == 0 {
            return PrimitiveResult::Value(Value::FALSE);
        }
        return PrimitiveResult::Value(Value::num(0.0));
    }
    let iterator = try_prim!(validate_int(vm, args[1], "Iterator"));
    if iterator < 0.0 {
        return PrimitiveResult::Value(Value::FALSE);
    }
    let next = iterator + 1.0;
    if next as usize >= count {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(next))
}

fn prim_list_iterator_value(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.list(args[0].as_handle()).len();
    let index = try_prim!(validate_index(vm, args[1], count, "Iterator"));
    PrimitiveResult::Value(vm.heap.list(args[0].as_handle())[index])
}

// ── Map ──────────────────────────────────────────────────────────────────────

fn validate_key(vm: &mut Vm, value: Value) -> Option<()> {
    if vm.heap.hash_value(value).is_some() {
        return Some(());
    }
    vm.fiber_error("Key must be a value type.".into());
    None
}

fn prim_map_new(vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    let map = vm.new_map();
    PrimitiveResult::Value(Value::obj(map))
}

fn prim_map_subscript(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    try_prim!(validate_key(vm, args[1]));
    let value = vm.heap.map_get(args[0].as_handle(), args[1]);
    if value.is_undefined() {
        return PrimitiveResult::Value(Value::NULL);
    }
    PrimitiveResult::Value(value)
}

fn prim_map_subscript_setter(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    try_prim!(validate_key(vm, args[1]));
    vm.heap.map_set(args[0].as_handle(), args[1], args[2]);
    PrimitiveResult::Value(args[2])
}

/// Like the subscript setter, but returns the map; emitted by map literals.
fn prim_map_add_core(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    try_prim!(validate_key(vm, args[1]));
    vm.heap.map_set(args[0].as_handle(), args[1], args[2]);
    PrimitiveResult::Value(args[0])
}

fn prim_map_count(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let count = vm.heap.map(args[0].as_handle()).count();
    PrimitiveResult::Value(Value::num(count as f64))
}

fn prim_map_contains_key(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    try_prim!(validate_key(vm, args[1]));
    let value = vm.heap.map_get(args[0].as_handle(), args[1]);
    PrimitiveResult::Value(Value::boolean(!value.is_undefined()))
}

fn prim_map_remove(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    try_prim!(validate_key(vm, args[1]));
    let removed = vm.heap.map_remove(args[0].as_handle(), args[1]);
    PrimitiveResult::Value(removed)
}

fn prim_map_clear(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let handle = args[0].as_handle();
    match &mut vm.heap.obj_mut(handle).data {
        ObjData::Map(map) => *map = crate::heap::ValueMap::new(),
        _ => unreachable!("expected map"),
    }
    PrimitiveResult::Value(Value::NULL)
}

// ── Range ────────────────────────────────────────────────────────────────────

fn prim_range_from(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(vm.heap.range(args[0].as_handle()).from))
}

fn prim_range_to(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::num(vm.heap.range(args[0].as_handle()).to))
}

fn prim_range_min(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let range = vm.heap.range(args[0].as_handle());
    PrimitiveResult::Value(Value::num(range.from.min(range.to)))
}

fn prim_range_max(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let range = vm.heap.range(args[0].as_handle());
    PrimitiveResult::Value(Value::num(range.from.max(range.to)))
}

fn prim_range_is_inclusive(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::boolean(vm.heap.range(args[0].as_handle()).is_inclusive))
}

fn prim_range_iterate(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let range = vm.heap.range(args[0].as_handle());
    if range.from == range.to && !range.is_inclusive {
        return PrimitiveResult::Value(Value::FALSE);
    }
    if args[1].is_null() {
        return PrimitiveResult::Value(Value::num(range.from));
    }
    let mut iterator = try_prim!(validate_num(vm, args[1], "Iterator"));
    if range.from < range.to {
        iterator += 1.0;
        if iterator > range.to {
            return PrimitiveResult::Value(Value::FALSE);
        }
    } else {
        iterator -= 1.0;
        if iterator < range.to {
            return PrimitiveResult::Value(Value::FALSE);
        }
    }
    if !range.is_inclusive && iterator == range.to {
        return PrimitiveResult::Value(Value::FALSE);
    }
    PrimitiveResult::Value(Value::num(iterator))
}

fn prim_range_iterator_value(_vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(args[1])
}

// ── Fn ───────────────────────────────────────────────────────────────────────

fn prim_fn_new(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    try_prim!(validate_fn(vm, args[1], "Argument"));
    PrimitiveResult::Value(args[1])
}

fn prim_fn_arity(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let function = vm.heap.closure(args[0].as_handle()).function;
    let arity = vm.heap.fn_obj(function).arity;
    PrimitiveResult::Value(Value::num(arity as f64))
}

// ── Fiber ────────────────────────────────────────────────────────────────────

fn prim_fiber_new(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let closure = try_prim!(validate_fn(vm, args[1], "Argument"));
    let function = vm.heap.closure(closure).function;
    if vm.heap.fn_obj(function).arity > 1 {
        vm.fiber_error("Function cannot take more than one parameter.".into());
        return PrimitiveResult::Error;
    }
    let fiber = vm.new_fiber(closure);
    PrimitiveResult::Value(Value::obj(fiber))
}

fn prim_fiber_current(vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::obj(vm.current_fiber()))
}

fn prim_fiber_yield(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    vm.yield_fiber(args);
    PrimitiveResult::FiberAction
}

fn prim_fiber_abort(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let fiber = vm.current_fiber();
    vm.heap.fiber_mut(fiber).error = args[1];
    if args[1].is_null() {
        // Aborting with null is a no-op.
        return PrimitiveResult::Value(Value::NULL);
    }
    PrimitiveResult::Error
}

fn prim_fiber_call(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    if vm.run_fiber(args[0].as_handle(), args, true, false, "call") {
        PrimitiveResult::FiberAction
    } else {
        PrimitiveResult::Error
    }
}

fn prim_fiber_try(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    if vm.run_fiber(args[0].as_handle(), args, true, true, "try") {
        PrimitiveResult::FiberAction
    } else {
        PrimitiveResult::Error
    }
}

fn prim_fiber_transfer(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    if vm.run_fiber(args[0].as_handle(), args, false, false, "transfer") {
        PrimitiveResult::FiberAction
    } else {
        PrimitiveResult::Error
    }
}

fn prim_fiber_error(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Value(vm.heap.fiber(args[0].as_handle()).error)
}

fn prim_fiber_is_done(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let fiber = vm.heap.fiber(args[0].as_handle());
    let done = fiber.frames.is_empty() || fiber.has_error();
    PrimitiveResult::Value(Value::boolean(done))
}

// ── System ───────────────────────────────────────────────────────────────────

fn prim_system_print_blank(vm: &mut Vm, _args: &[Value]) -> PrimitiveResult {
    vm.write_out("\n");
    PrimitiveResult::Value(Value::NULL)
}

fn prim_system_print(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let text = vm.value_to_display(args[1]);
    vm.write_out(&text);
    vm.write_out("\n");
    PrimitiveResult::Value(args[1])
}

fn prim_system_write(vm: &mut Vm, args: &[Value]) -> PrimitiveResult {
    let text = vm.value_to_display(args[1]);
    vm.write_out(&text);
    PrimitiveResult::Value(args[1])
}
