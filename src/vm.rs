/// The Virtual Machine
///
/// Owns the heap, the method symbol table, the module registry, and the
/// currently running fiber. The interpreter is a straight fetch/dispatch
/// loop over the bytecode in the active call frame; the frame's instruction
/// pointer and code are cached in locals and written back whenever control
/// moves (calls, returns, fiber switches, errors).
///
/// Scheduling is single-threaded and cooperative: only the fiber operations
/// (`call`, `try`, `transfer`, `yield`, `abort`), a return from the last
/// frame, or a runtime error change which fiber runs. The garbage collector
/// may run between any two instructions but never during one.

use std::rc::Rc;

use tracing::debug;

use crate::bytecode::Op;
use crate::errors::{ErrorKind, InterpretResult, WispError};
use crate::heap::{
    CallFrame, ClassObj, ClosureObj, FiberObj, FiberState, Heap, ModuleObj, ObjData, RangeObj,
    StrObj, UpvalueObj, ValueMap,
};
use crate::symbols::SymbolTable;
use crate::value::{num_to_string, Handle, Value};

/// Deepest call frame chain a fiber may grow.
pub(crate) const MAX_FRAMES: usize = 1024;

// ── Host interface ───────────────────────────────────────────────────────────

/// A native method bound to a foreign class; exchanges values through the
/// slot API.
pub type ForeignMethodFn = fn(&mut Vm);

/// Finalizer for a foreign object's byte payload, run during the GC sweep.
pub type FinalizerFn = fn(&mut [u8]);

#[derive(Clone, Copy)]
pub struct ForeignClassMethods {
    pub allocate: ForeignMethodFn,
    pub finalize: Option<FinalizerFn>,
}

impl std::fmt::Debug for ForeignClassMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignClassMethods")
    }
}

pub type WriteFn = Box<dyn FnMut(&str)>;
pub type ErrorReportFn = Box<dyn FnMut(ErrorKind, Option<&str>, i32, &str)>;
pub type ResolveModuleFn = Box<dyn FnMut(&str, &str) -> Option<String>>;
pub type LoadModuleFn = Box<dyn FnMut(&str) -> Option<String>>;
pub type BindForeignMethodFn = Box<dyn FnMut(&str, &str, bool, &str) -> Option<ForeignMethodFn>>;
pub type BindForeignClassFn = Box<dyn FnMut(&str, &str) -> Option<ForeignClassMethods>>;

/// Host callbacks and heap tuning supplied at VM creation.
pub struct VmConfig {
    pub write: Option<WriteFn>,
    pub error: Option<ErrorReportFn>,
    pub resolve_module: Option<ResolveModuleFn>,
    pub load_module: Option<LoadModuleFn>,
    pub bind_foreign_method: Option<BindForeignMethodFn>,
    pub bind_foreign_class: Option<BindForeignClassFn>,
    /// Bytes allocated before the first collection.
    pub initial_heap: usize,
    /// Floor for the post-collection threshold.
    pub min_heap: usize,
    /// How much the threshold grows past the live size after a collection.
    pub heap_growth_percent: usize,
}

impl Default for VmConfig {
    fn default() -> VmConfig {
        VmConfig {
            write: None,
            error: None,
            resolve_module: None,
            load_module: None,
            bind_foreign_method: None,
            bind_foreign_class: None,
            initial_heap: 10 * 1024 * 1024,
            min_heap: 1024 * 1024,
            heap_growth_percent: 50,
        }
    }
}

// ── Methods ──────────────────────────────────────────────────────────────────

/// Outcome of a primitive method.
pub enum PrimitiveResult {
    /// Normal completion: the arguments are popped and the value replaces
    /// the receiver slot.
    Value(Value),
    /// An error was recorded on the current fiber; unwind.
    Error,
    /// Control moved to a different fiber (or back to the host); the
    /// primitive already adjusted the stacks involved.
    FiberAction,
}

pub type PrimitiveFn = fn(&mut Vm, &[Value]) -> PrimitiveResult;

/// One entry in a class's dense method table.
#[derive(Clone)]
pub enum Method {
    /// A native handler invoked inline.
    Primitive(PrimitiveFn),
    /// The `call` family on Fn: invokes the receiver closure itself.
    FnCall,
    /// A host function bound through `bind_foreign_method`.
    Foreign(ForeignMethodFn),
    /// A scripted method body.
    Block(Handle),
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Primitive(_) => write!(f, "primitive"),
            Method::FnCall => write!(f, "fn-call"),
            Method::Foreign(_) => write!(f, "foreign"),
            Method::Block(closure) => write!(f, "block#{}", closure.0),
        }
    }
}

/// Handles to the built-in classes, needed to classify values and to seal
/// the hierarchy against inheriting from them.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub object: Handle,
    pub class: Handle,
    pub bool_class: Handle,
    pub null_class: Handle,
    pub num: Handle,
    pub string: Handle,
    pub list: Handle,
    pub map: Handle,
    pub range: Handle,
    pub fn_class: Handle,
    pub fiber: Handle,
}

// ── The VM ───────────────────────────────────────────────────────────────────

enum CallOutcome {
    /// Stayed in the current frame; keep dispatching.
    Continue,
    /// The frame stack or active fiber changed; re-cache the frame.
    Reload,
    /// A runtime error must unwind.
    Error,
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) config: VmConfig,
    pub(crate) method_names: SymbolTable,
    pub(crate) modules: hashbrown::HashMap<String, Handle>,
    pub(crate) core: CoreClasses,
    pub(crate) core_module: Handle,
    pub(crate) fiber: Option<Handle>,
    /// Slot array for host ↔ script exchange; a GC root.
    pub(crate) api_stack: Vec<Value>,
    /// Persistent value handles held by the host; GC roots until released.
    pub(crate) handles: Vec<Option<Value>>,
    pub(crate) free_handles: Vec<u32>,
    /// The most recently imported module, consumed by ImportVariable.
    pub(crate) last_module: Option<Handle>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        let heap = Heap::new(config.initial_heap, config.min_heap, config.heap_growth_percent);
        let mut vm = Vm {
            heap,
            config,
            method_names: SymbolTable::new(),
            modules: hashbrown::HashMap::new(),
            core: CoreClasses {
                object: Handle(0),
                class: Handle(0),
                bool_class: Handle(0),
                null_class: Handle(0),
                num: Handle(0),
                string: Handle(0),
                list: Handle(0),
                map: Handle(0),
                range: Handle(0),
                fn_class: Handle(0),
                fiber: Handle(0),
            },
            core_module: Handle(0),
            fiber: None,
            api_stack: Vec::new(),
            handles: Vec::new(),
            free_handles: Vec::new(),
            last_module: None,
        };
        // The core class handles are not wired up until bootstrap finishes,
        // so no collection may run inside it.
        vm.heap.pause_gc();
        crate::intrinsics::initialize_core(&mut vm);
        vm.heap.resume_gc();
        vm
    }

    // ── Host callback plumbing ───────────────────────────────────────────────

    pub(crate) fn write_out(&mut self, text: &str) {
        if let Some(mut write) = self.config.write.take() {
            write(text);
            self.config.write = Some(write);
        }
    }

    pub(crate) fn report_error(
        &mut self,
        kind: ErrorKind,
        module: Option<&str>,
        line: i32,
        message: &str,
    ) {
        if let Some(mut error) = self.config.error.take() {
            error(kind, module, line, message);
            self.config.error = Some(error);
        }
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect();
        }
    }

    /// A full mark-sweep cycle over everything reachable from the VM roots.
    pub fn collect(&mut self) {
        if let Some(fiber) = self.fiber {
            self.heap.mark_object(fiber);
        }
        self.heap.mark_object(self.core_module);
        let module_handles: Vec<Handle> = self.modules.values().copied().collect();
        for module in module_handles {
            self.heap.mark_object(module);
        }
        for class in [
            self.core.object,
            self.core.class,
            self.core.bool_class,
            self.core.null_class,
            self.core.num,
            self.core.string,
            self.core.list,
            self.core.map,
            self.core.range,
            self.core.fn_class,
            self.core.fiber,
        ] {
            self.heap.mark_object(class);
        }
        for i in 0..self.api_stack.len() {
            let value = self.api_stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.handles.len() {
            if let Some(value) = self.handles[i] {
                self.heap.mark_value(value);
            }
        }
        if let Some(module) = self.last_module {
            self.heap.mark_object(module);
        }
        self.heap.mark_temp_roots();
        self.heap.trace();
        self.heap.sweep();
    }

    pub(crate) fn alloc(&mut self, class: Option<Handle>, data: ObjData) -> Handle {
        self.maybe_collect();
        self.heap.alloc(class, data)
    }

    pub(crate) fn new_string(&mut self, bytes: Vec<u8>) -> Handle {
        let class = self.core.string;
        self.alloc(Some(class), ObjData::Str(StrObj::new(bytes)))
    }

    pub(crate) fn string_value(&mut self, text: &str) -> Value {
        Value::obj(self.new_string(text.as_bytes().to_vec()))
    }

    pub(crate) fn new_list(&mut self, elements: Vec<Value>) -> Handle {
        let class = self.core.list;
        self.alloc(Some(class), ObjData::List(elements))
    }

    pub(crate) fn new_map(&mut self) -> Handle {
        let class = self.core.map;
        self.alloc(Some(class), ObjData::Map(ValueMap::new()))
    }

    pub(crate) fn new_range(&mut self, from: f64, to: f64, is_inclusive: bool) -> Handle {
        let class = self.core.range;
        self.alloc(Some(class), ObjData::Range(RangeObj { from, to, is_inclusive }))
    }

    pub(crate) fn new_instance(&mut self, class: Handle) -> Handle {
        let num_fields = self.heap.class_obj(class).num_fields;
        self.alloc(Some(class), ObjData::Instance(vec![Value::NULL; num_fields]))
    }

    pub(crate) fn new_closure(&mut self, function: Handle, upvalues: Vec<Handle>) -> Handle {
        let class = self.core.fn_class;
        self.alloc(Some(class), ObjData::Closure(ClosureObj { function, upvalues }))
    }

    /// Creates a paused fiber whose first frame will run `closure`. Slot
    /// zero of the new stack holds the closure itself.
    pub(crate) fn new_fiber(&mut self, closure: Handle) -> Handle {
        let class = self.core.fiber;
        let fiber = FiberObj {
            stack: vec![Value::obj(closure)],
            frames: vec![CallFrame { closure, ip: 0, stack_start: 0 }],
            open_upvalues: Vec::new(),
            caller: None,
            state: FiberState::Other,
            error: Value::NULL,
        };
        self.alloc(Some(class), ObjData::Fiber(Box::new(fiber)))
    }

    // ── Value classification ─────────────────────────────────────────────────

    pub(crate) fn class_of(&self, value: Value) -> Handle {
        if value.is_num() {
            return self.core.num;
        }
        if value.is_obj() {
            return self.heap.obj_class(value.as_handle());
        }
        if value.is_bool() {
            return self.core.bool_class;
        }
        self.core.null_class
    }

    /// Builds the display string for a value without dispatching script
    /// methods; used by the core `toString` primitives and `System`.
    pub(crate) fn value_to_display(&self, value: Value) -> String {
        if value.is_num() {
            return num_to_string(value.as_num());
        }
        if value.is_null() {
            return "null".into();
        }
        if value.is_bool() {
            return if value.as_bool() { "true".into() } else { "false".into() };
        }
        if !value.is_obj() {
            return "undefined".into();
        }
        let handle = value.as_handle();
        match &self.heap.obj(handle).data {
            ObjData::Str(s) => s.as_str().into_owned(),
            ObjData::Range(r) => format!(
                "{}{}{}",
                num_to_string(r.from),
                if r.is_inclusive { ".." } else { "..." },
                num_to_string(r.to)
            ),
            ObjData::List(elements) => {
                let parts: Vec<String> =
                    elements.iter().map(|&e| self.value_to_quoted(e)).collect();
                format!("[{}]", parts.join(", "))
            }
            ObjData::Map(map) => {
                let parts: Vec<String> = map
                    .entries()
                    .map(|(k, v)| {
                        format!("{}: {}", self.value_to_quoted(k), self.value_to_quoted(v))
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            ObjData::Class(class) => class.name.clone(),
            ObjData::Instance(_) => {
                let class = self.heap.obj_class(handle);
                format!("instance of {}", self.heap.class_obj(class).name)
            }
            ObjData::Closure(_) | ObjData::Fn(_) => "<fn>".into(),
            ObjData::Fiber(_) => "<fiber>".into(),
            ObjData::Module(_) => "<module>".into(),
            ObjData::Upvalue(_) => "<upvalue>".into(),
            ObjData::Foreign(_) => {
                let class = self.heap.obj_class(handle);
                format!("instance of {}", self.heap.class_obj(class).name)
            }
        }
    }

    fn value_to_quoted(&self, value: Value) -> String {
        if self.heap.is_string(value) {
            format!("{:?}", self.value_to_display(value))
        } else {
            self.value_to_display(value)
        }
    }

    // ── Fiber stack helpers ──────────────────────────────────────────────────

    pub(crate) fn current_fiber(&self) -> Handle {
        match self.fiber {
            Some(fiber) => fiber,
            None => unreachable!("no running fiber"),
        }
    }

    fn push(&mut self, fiber: Handle, value: Value) {
        self.heap.fiber_mut(fiber).stack.push(value);
    }

    fn pop(&mut self, fiber: Handle) -> Value {
        match self.heap.fiber_mut(fiber).stack.pop() {
            Some(value) => value,
            None => unreachable!("stack underflow"),
        }
    }

    fn peek(&self, fiber: Handle, distance: usize) -> Value {
        let stack = &self.heap.fiber(fiber).stack;
        stack[stack.len() - 1 - distance]
    }

    fn stack_len(&self, fiber: Handle) -> usize {
        self.heap.fiber(fiber).stack.len()
    }

    fn store_ip(&mut self, fiber: Handle, ip: usize) {
        if let Some(frame) = self.heap.fiber_mut(fiber).frames.last_mut() {
            frame.ip = ip;
        }
    }

    /// Records an abort message on the current fiber.
    pub(crate) fn fiber_error(&mut self, message: String) {
        let error = self.string_value(&message);
        let fiber = self.current_fiber();
        self.heap.fiber_mut(fiber).error = error;
    }

    // ── Upvalues ─────────────────────────────────────────────────────────────

    /// Finds or creates the open upvalue for `slot` on `fiber`, keeping the
    /// open list sorted by stack position.
    fn capture_upvalue(&mut self, fiber: Handle, slot: usize) -> Handle {
        let mut insert_at = self.heap.fiber(fiber).open_upvalues.len();
        for (i, &upvalue) in self.heap.fiber(fiber).open_upvalues.iter().enumerate() {
            match *self.heap.upvalue(upvalue) {
                UpvalueObj::Open { slot: existing, .. } => {
                    if existing == slot {
                        return upvalue;
                    }
                    if existing > slot {
                        insert_at = i;
                        break;
                    }
                }
                UpvalueObj::Closed(_) => unreachable!("closed upvalue on open list"),
            }
        }
        let upvalue = self.alloc(None, ObjData::Upvalue(UpvalueObj::Open { fiber, slot }));
        self.heap.fiber_mut(fiber).open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from_slot`: the captured value
    /// moves out of the stack and into the upvalue itself.
    fn close_upvalues(&mut self, fiber: Handle, from_slot: usize) {
        loop {
            let last = match self.heap.fiber(fiber).open_upvalues.last() {
                Some(&upvalue) => upvalue,
                None => return,
            };
            let slot = match *self.heap.upvalue(last) {
                UpvalueObj::Open { slot, .. } => slot,
                UpvalueObj::Closed(_) => unreachable!("closed upvalue on open list"),
            };
            if slot < from_slot {
                return;
            }
            let value = self.heap.fiber(fiber).stack[slot];
            *self.heap.upvalue_mut(last) = UpvalueObj::Closed(value);
            self.heap.fiber_mut(fiber).open_upvalues.pop();
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Pushes a frame invoking `closure` whose `argc` arguments (receiver
    /// included) are already on the stack.
    fn call_function(&mut self, fiber: Handle, closure: Handle, argc: usize) -> bool {
        if self.heap.fiber(fiber).frames.len() >= MAX_FRAMES {
            self.fiber_error("Stack overflow.".into());
            return false;
        }
        let function = self.heap.closure(closure).function;
        let max_slots = self.heap.fn_obj(function).max_slots;
        let fiber_obj = self.heap.fiber_mut(fiber);
        let stack_start = fiber_obj.stack.len() - argc;
        fiber_obj.stack.reserve(max_slots);
        fiber_obj.frames.push(CallFrame { closure, ip: 0, stack_start });
        true
    }

    fn call_foreign(&mut self, fiber: Handle, foreign: ForeignMethodFn, argc: usize) {
        let args_start = self.stack_len(fiber) - argc;
        self.api_stack.clear();
        {
            let stack = &self.heap.fiber(fiber).stack;
            self.api_stack.extend_from_slice(&stack[args_start..]);
        }
        foreign(self);
        let result = self.api_stack.first().copied().unwrap_or(Value::NULL);
        self.api_stack.clear();
        let stack = &mut self.heap.fiber_mut(fiber).stack;
        stack.truncate(args_start);
        stack.push(result);
    }

    /// Dispatches symbol `symbol` on the class `class`, with `argc` values
    /// (receiver first) on top of the stack.
    fn call_method(
        &mut self,
        fiber: Handle,
        class: Handle,
        symbol: usize,
        argc: usize,
    ) -> CallOutcome {
        let args_start = self.stack_len(fiber) - argc;
        let method = self.heap.class_obj(class).method(symbol);
        match method {
            None => {
                let class_name = self.heap.class_obj(class).name.clone();
                let signature = self.method_names.name(symbol).to_string();
                self.fiber_error(format!("{} does not implement '{}'.", class_name, signature));
                CallOutcome::Error
            }
            Some(Method::Primitive(primitive)) => {
                let args: Vec<Value> =
                    self.heap.fiber(fiber).stack[args_start..].to_vec();
                match primitive(self, &args) {
                    PrimitiveResult::Value(value) => {
                        let stack = &mut self.heap.fiber_mut(fiber).stack;
                        stack.truncate(args_start);
                        stack.push(value);
                        CallOutcome::Continue
                    }
                    PrimitiveResult::Error => CallOutcome::Error,
                    PrimitiveResult::FiberAction => CallOutcome::Reload,
                }
            }
            Some(Method::FnCall) => {
                let receiver = self.heap.fiber(fiber).stack[args_start];
                if !self.heap.is_closure(receiver) {
                    self.fiber_error("Receiver must be a function.".into());
                    return CallOutcome::Error;
                }
                let closure = receiver.as_handle();
                let function = self.heap.closure(closure).function;
                if argc - 1 < self.heap.fn_obj(function).arity {
                    self.fiber_error("Function expects more arguments.".into());
                    return CallOutcome::Error;
                }
                if self.call_function(fiber, closure, argc) {
                    CallOutcome::Reload
                } else {
                    CallOutcome::Error
                }
            }
            Some(Method::Foreign(foreign)) => {
                self.call_foreign(fiber, foreign, argc);
                if self.heap.fiber(fiber).has_error() {
                    CallOutcome::Error
                } else {
                    CallOutcome::Continue
                }
            }
            Some(Method::Block(closure)) => {
                if self.call_function(fiber, closure, argc) {
                    CallOutcome::Reload
                } else {
                    CallOutcome::Error
                }
            }
        }
    }

    // ── Classes ──────────────────────────────────────────────────────────────

    /// Creates a class plus its metaclass. `declared_fields` is None for
    /// foreign classes. Expects the stack to hold the name string below the
    /// superclass; replaces both with the class.
    fn create_class(
        &mut self,
        fiber: Handle,
        declared_fields: Option<usize>,
        module: Handle,
    ) -> bool {
        let superclass_value = self.pop(fiber);
        let name_value = self.peek(fiber, 0);
        let name = self.value_to_display(name_value);

        if !self.heap.is_class(superclass_value) {
            self.fiber_error(format!(
                "Class '{}' cannot inherit from a non-class object.",
                name
            ));
            return false;
        }
        let superclass = superclass_value.as_handle();
        let sealed = [
            self.core.class,
            self.core.bool_class,
            self.core.null_class,
            self.core.num,
            self.core.string,
            self.core.list,
            self.core.map,
            self.core.range,
            self.core.fn_class,
            self.core.fiber,
        ];
        if sealed.contains(&superclass) {
            let superclass_name = self.heap.class_obj(superclass).name.clone();
            self.fiber_error(format!(
                "Class '{}' cannot inherit from built-in class '{}'.",
                name, superclass_name
            ));
            return false;
        }
        if self.heap.class_obj(superclass).foreign.is_some() {
            let superclass_name = self.heap.class_obj(superclass).name.clone();
            self.fiber_error(format!(
                "Class '{}' cannot inherit from foreign class '{}'.",
                name, superclass_name
            ));
            return false;
        }

        let inherited = self.heap.class_obj(superclass).num_fields;
        let num_fields = inherited + declared_fields.unwrap_or(0);
        if num_fields > crate::compiler::MAX_FIELDS {
            self.fiber_error(format!(
                "Class '{}' may not have more than 255 fields, including inherited ones.",
                name
            ));
            return false;
        }

        // The superclass was popped off the stack, so keep it pinned while
        // the class and metaclass allocations can collect.
        self.heap.push_temp_root(superclass_value);
        let class = self.new_class(&name, Some(superclass), num_fields);
        self.heap.pop_temp_root();

        if declared_fields.is_none() {
            // Foreign class: resolve the allocator and finalizer now.
            let module_name = self
                .heap
                .module(module)
                .name
                .clone()
                .unwrap_or_default();
            let methods = match self.config.bind_foreign_class.take() {
                Some(mut bind) => {
                    let methods = bind(&module_name, &name);
                    self.config.bind_foreign_class = Some(bind);
                    methods
                }
                None => None,
            };
            match methods {
                Some(methods) => self.heap.class_obj_mut(class).foreign = Some(methods),
                None => {
                    self.fiber_error(format!(
                        "Could not bind foreign class '{}' in module '{}'.",
                        name, module_name
                    ));
                    return false;
                }
            }
        }

        let stack = &mut self.heap.fiber_mut(fiber).stack;
        let top = stack.len() - 1;
        stack[top] = Value::obj(class);
        true
    }

    /// Allocates a class and its metaclass, inheriting method tables.
    pub(crate) fn new_class(
        &mut self,
        name: &str,
        superclass: Option<Handle>,
        num_fields: usize,
    ) -> Handle {
        let metaclass_methods = self.heap.class_obj(self.core.class).methods.clone();
        let metaclass = self.alloc(
            Some(self.core.class),
            ObjData::Class(Box::new(ClassObj {
                name: format!("{} metaclass", name),
                superclass: Some(self.core.class),
                num_fields: 0,
                methods: metaclass_methods,
                attributes: Value::NULL,
                foreign: None,
            })),
        );
        self.heap.push_temp_root(Value::obj(metaclass));
        let methods = match superclass {
            Some(superclass) => self.heap.class_obj(superclass).methods.clone(),
            None => Vec::new(),
        };
        let class = self.alloc(
            Some(metaclass),
            ObjData::Class(Box::new(ClassObj {
                name: name.to_string(),
                superclass,
                num_fields,
                methods,
                attributes: Value::NULL,
                foreign: None,
            })),
        );
        self.heap.pop_temp_root();
        class
    }

    /// Binds a method definition popped by MethodInstance/MethodStatic.
    fn bind_method(
        &mut self,
        is_static: bool,
        symbol: usize,
        module: Handle,
        class: Handle,
        method_value: Value,
    ) -> bool {
        let target = if is_static { self.heap.obj_class(class) } else { class };
        let method = if self.heap.is_string(method_value) {
            // A foreign method: the value is its signature string.
            let signature = self
                .heap
                .string(method_value.as_handle())
                .as_str()
                .into_owned();
            let module_name = self.heap.module(module).name.clone().unwrap_or_default();
            let class_name = self.heap.class_obj(class).name.clone();
            let bound = match self.config.bind_foreign_method.take() {
                Some(mut bind) => {
                    let bound = bind(&module_name, &class_name, is_static, &signature);
                    self.config.bind_foreign_method = Some(bind);
                    bound
                }
                None => None,
            };
            match bound {
                Some(foreign) => Method::Foreign(foreign),
                None => {
                    self.fiber_error(format!(
                        "Could not find foreign method '{}' for class {} in module '{}'.",
                        signature, class_name, module_name
                    ));
                    return false;
                }
            }
        } else {
            let closure = method_value.as_handle();
            let function = self.heap.closure(closure).function;
            self.bind_method_code(target, function);
            Method::Block(closure)
        };
        self.heap.class_obj_mut(target).set_method(symbol, method);
        true
    }

    /// Patches a method body for its defining class: field accesses shift
    /// past inherited fields, and Super instructions get the superclass
    /// stored into their constant slot. Recurses into nested closures.
    fn bind_method_code(&mut self, class: Handle, function: Handle) {
        let superclass = self.heap.class_obj(class).superclass;
        let field_offset = match superclass {
            Some(superclass) => self.heap.class_obj(superclass).num_fields,
            None => 0,
        };
        let superclass_value = match superclass {
            Some(superclass) => Value::obj(superclass),
            None => Value::NULL,
        };

        // Upvalue counts for function constants, needed to skip the
        // variable-length Closure operands during the walk.
        let upvalue_counts: Vec<usize> = {
            let constants = &self.heap.fn_obj(function).constants;
            constants
                .iter()
                .map(|&constant| {
                    if constant.is_obj() {
                        if let ObjData::Fn(nested_fn) =
                            &self.heap.obj(constant.as_handle()).data
                        {
                            return nested_fn.num_upvalues;
                        }
                    }
                    0
                })
                .collect()
        };

        let mut nested: Vec<Handle> = Vec::new();
        {
            let fn_obj = self.heap.fn_obj_mut(function);
            let constants = &mut fn_obj.constants;
            let code = Rc::make_mut(&mut fn_obj.code);
            let mut ip = 0;
            loop {
                let op = Op::from_byte(code[ip]);
                match op {
                    Op::LoadFieldThis
                    | Op::StoreFieldThis
                    | Op::LoadField
                    | Op::StoreField => {
                        code[ip + 1] += field_offset as u8;
                    }
                    Op::Super0
                    | Op::Super1
                    | Op::Super2
                    | Op::Super3
                    | Op::Super4
                    | Op::Super5
                    | Op::Super6
                    | Op::Super7
                    | Op::Super8
                    | Op::Super9
                    | Op::Super10
                    | Op::Super11
                    | Op::Super12
                    | Op::Super13
                    | Op::Super14
                    | Op::Super15
                    | Op::Super16 => {
                        let constant =
                            ((code[ip + 3] as usize) << 8) | code[ip + 4] as usize;
                        constants[constant] = superclass_value;
                    }
                    Op::Closure => {
                        // Methods nested in this one capture the same class.
                        let constant =
                            ((code[ip + 1] as usize) << 8) | code[ip + 2] as usize;
                        nested.push(constants[constant].as_handle());
                        ip += 1 + 2 + upvalue_counts[constant] * 2;
                        continue;
                    }
                    Op::End => break,
                    _ => {}
                }
                ip += 1 + match op.args() {
                    crate::bytecode::Args::None => 0,
                    crate::bytecode::Args::Byte => 1,
                    crate::bytecode::Args::Short => 2,
                    crate::bytecode::Args::TwoShorts => 4,
                    crate::bytecode::Args::Variable => unreachable!("handled above"),
                };
            }
        }
        for function in nested {
            self.bind_method_code(class, function);
        }
    }

    // ── Fibers ───────────────────────────────────────────────────────────────

    /// Implements `call`, `try`, and `transfer`. `args` holds the receiver
    /// fiber and optionally the passed value. Returns false when the target
    /// fiber is not runnable (an error was recorded).
    pub(crate) fn run_fiber(
        &mut self,
        target: Handle,
        args: &[Value],
        is_call: bool,
        is_try: bool,
        verb: &str,
    ) -> bool {
        let has_value = args.len() == 2;
        if self.heap.fiber(target).has_error() {
            self.fiber_error(format!("Cannot {} an aborted fiber.", verb));
            return false;
        }
        if is_call {
            if self.heap.fiber(target).caller.is_some() {
                self.fiber_error("Fiber has already been called.".into());
                return false;
            }
            if self.heap.fiber(target).state == FiberState::Root {
                self.fiber_error("Cannot call root fiber.".into());
                return false;
            }
            let current = self.current_fiber();
            self.heap.fiber_mut(target).caller = Some(current);
        }
        if self.heap.fiber(target).frames.is_empty() {
            self.fiber_error(format!("Cannot {} a finished fiber.", verb));
            return false;
        }

        self.heap.fiber_mut(target).state =
            if is_try { FiberState::Try } else { FiberState::Other };

        // The caller's receiver slot will receive the result when it
        // resumes; a passed value needs no slot of its own.
        let current = self.current_fiber();
        if has_value {
            self.heap.fiber_mut(current).stack.pop();
        }

        let value = if has_value { args[1] } else { Value::NULL };
        let target_fiber = self.heap.fiber(target);
        let not_started =
            target_fiber.frames.len() == 1 && target_fiber.frames[0].ip == 0
                && target_fiber.stack.len() == 1;
        if not_started {
            // First run: bind the value to the fiber function's parameter,
            // if it takes one.
            let closure = target_fiber.frames[0].closure;
            let function = self.heap.closure(closure).function;
            if self.heap.fn_obj(function).arity == 1 {
                self.heap.fiber_mut(target).stack.push(value);
            }
        } else {
            // Resuming: the pending yield()/transfer() call gets the value
            // as its result.
            let stack = &mut self.heap.fiber_mut(target).stack;
            let top = stack.len() - 1;
            stack[top] = value;
        }

        self.fiber = Some(target);
        true
    }

    /// Implements `Fiber.yield`: control returns to the caller, leaving this
    /// fiber resumable.
    pub(crate) fn yield_fiber(&mut self, args: &[Value]) {
        let has_value = args.len() == 2;
        let current = self.current_fiber();
        let caller = self.heap.fiber(current).caller;
        self.heap.fiber_mut(current).caller = None;
        self.heap.fiber_mut(current).state = FiberState::Other;
        self.fiber = caller;
        if let Some(caller) = caller {
            // The caller's call()/try() expression produces the yielded
            // value.
            let value = if has_value { args[1] } else { Value::NULL };
            let stack = &mut self.heap.fiber_mut(caller).stack;
            let top = stack.len() - 1;
            stack[top] = value;
            // The yield() call itself will produce whatever the next call
            // passes; one stack slot is enough.
            if has_value {
                self.heap.fiber_mut(current).stack.pop();
            }
        }
    }

    // ── Error unwinding ──────────────────────────────────────────────────────

    /// Propagates the current fiber's error up the caller chain. Returns
    /// true when a try boundary converted the error into a return value and
    /// execution can continue.
    fn unwind_error(&mut self) -> bool {
        let origin = self.current_fiber();
        let error = self.heap.fiber(origin).error;
        let mut current = Some(origin);
        while let Some(fiber) = current {
            // Every fiber along the chain is aborted with the same error.
            self.heap.fiber_mut(fiber).error = error;
            if self.heap.fiber(fiber).state == FiberState::Try {
                let caller = self.heap.fiber(fiber).caller;
                if let Some(caller) = caller {
                    let stack = &mut self.heap.fiber_mut(caller).stack;
                    let top = stack.len() - 1;
                    stack[top] = error;
                    self.heap.fiber_mut(fiber).caller = None;
                    self.heap.fiber_mut(fiber).state = FiberState::Stopped;
                    self.fiber = Some(caller);
                    return true;
                }
            }
            let caller = self.heap.fiber(fiber).caller;
            self.heap.fiber_mut(fiber).caller = None;
            self.heap.fiber_mut(fiber).state = FiberState::Stopped;
            current = caller;
        }
        // Nothing caught it: report the error and the stack trace of the
        // fiber it arose on.
        self.print_stack_trace(origin);
        self.fiber = None;
        false
    }

    fn print_stack_trace(&mut self, fiber: Handle) {
        let error = self.heap.fiber(fiber).error;
        let message = if self.heap.is_string(error) {
            self.value_to_display(error)
        } else {
            "[error object]".to_string()
        };
        self.report_error(ErrorKind::Runtime, None, -1, &message);

        let frames = self.heap.fiber(fiber).frames.clone();
        for frame in frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let fn_obj = self.heap.fn_obj(function);
            // The core module has no name; its implementation details stay
            // out of user traces.
            let module_name = match &self.heap.module(fn_obj.module).name {
                Some(name) => name.clone(),
                None => continue,
            };
            let line = fn_obj.debug.lines[frame.ip.saturating_sub(1)] as i32;
            let fn_name = fn_obj.debug.name.clone();
            self.report_error(ErrorKind::StackTrace, Some(&module_name), line, &fn_name);
        }
    }

    // ── Modules ──────────────────────────────────────────────────────────────

    pub(crate) fn get_or_create_module(&mut self, name: &str) -> Handle {
        if let Some(&module) = self.modules.get(name) {
            return module;
        }
        let mut module_obj = ModuleObj::new(Some(name.to_string()));
        // Every module starts with the core module's variables in scope.
        {
            let core = self.heap.module(self.core_module);
            for i in 0..core.variable_names.len() {
                module_obj.variable_names.add(core.variable_names.name(i));
                let value = core.variables[i];
                module_obj.variables.push(value);
            }
        }
        let module = self.alloc(None, ObjData::Module(module_obj));
        self.modules.insert(name.to_string(), module);
        module
    }

    /// Compiles `source` in the named module, returning the closure for its
    /// body, or None after reporting compile errors.
    pub(crate) fn compile_in_module(&mut self, name: &str, source: &str) -> Option<Handle> {
        let module = self.get_or_create_module(name);
        let function = crate::compiler::compile(self, module, source)?;
        self.heap.push_temp_root(Value::obj(function));
        let closure = self.new_closure(function, Vec::new());
        self.heap.pop_temp_root();
        Some(closure)
    }

    fn import_module(&mut self, fiber: Handle, name_value: Value) -> Result<Option<Handle>, ()> {
        let name = self.value_to_display(name_value);
        let importer = {
            let frame_closure = match self.heap.fiber(fiber).frames.last() {
                Some(frame) => frame.closure,
                None => unreachable!("import outside a frame"),
            };
            let function = self.heap.closure(frame_closure).function;
            let module = self.heap.fn_obj(function).module;
            self.heap.module(module).name.clone().unwrap_or_default()
        };
        let resolved = match self.config.resolve_module.take() {
            Some(mut resolve) => {
                let resolved = resolve(&importer, &name);
                self.config.resolve_module = Some(resolve);
                match resolved {
                    Some(resolved) => resolved,
                    None => {
                        self.fiber_error(format!("Could not resolve module '{}'.", name));
                        return Err(());
                    }
                }
            }
            None => name.clone(),
        };

        if let Some(&module) = self.modules.get(&resolved) {
            self.last_module = Some(module);
            return Ok(None);
        }

        let source = match self.config.load_module.take() {
            Some(mut load) => {
                let source = load(&resolved);
                self.config.load_module = Some(load);
                source
            }
            None => None,
        };
        let source = match source {
            Some(source) => source,
            None => {
                self.fiber_error(format!("Could not load module '{}'.", resolved));
                return Err(());
            }
        };

        debug!(module = resolved.as_str(), "loading imported module");
        match self.compile_in_module(&resolved, &source) {
            Some(closure) => Ok(Some(closure)),
            None => {
                self.fiber_error(format!("Could not compile module '{}'.", resolved));
                Err(())
            }
        }
    }

    // ── Interpreter ──────────────────────────────────────────────────────────

    /// Compiles and runs `source` as the body of the named module.
    pub fn interpret(&mut self, module_name: &str, source: &str) -> InterpretResult {
        let closure = match self.compile_in_module(module_name, source) {
            Some(closure) => closure,
            None => return Err(WispError::Compile { module: module_name.to_string() }),
        };
        self.heap.push_temp_root(Value::obj(closure));
        let fiber = self.new_fiber(closure);
        self.heap.pop_temp_root();
        self.heap.fiber_mut(fiber).state = FiberState::Root;
        self.fiber = Some(fiber);
        self.run_interpreter()
    }

    pub(crate) fn run_interpreter(&mut self) -> InterpretResult {
        'reload: loop {
            let fiber = match self.fiber {
                Some(fiber) => fiber,
                None => return Ok(()),
            };
            let frame = match self.heap.fiber(fiber).frames.last() {
                Some(frame) => *frame,
                None => unreachable!("fiber with no frames"),
            };
            let closure = frame.closure;
            let function = self.heap.closure(closure).function;
            let code = Rc::clone(&self.heap.fn_obj(function).code);
            let module = self.heap.fn_obj(function).module;
            let stack_start = frame.stack_start;
            let mut ip = frame.ip;

            macro_rules! read_byte {
                () => {{
                    let byte = code[ip];
                    ip += 1;
                    byte as usize
                }};
            }
            macro_rules! read_short {
                () => {{
                    let short = ((code[ip] as usize) << 8) | code[ip + 1] as usize;
                    ip += 2;
                    short
                }};
            }
            macro_rules! runtime_error {
                () => {{
                    self.store_ip(fiber, ip);
                    if self.unwind_error() {
                        continue 'reload;
                    }
                    let error = self.heap.fiber(fiber).error;
                    let message = if self.heap.is_string(error) {
                        self.value_to_display(error)
                    } else {
                        "[error object]".to_string()
                    };
                    return Err(WispError::Runtime { message });
                }};
            }

            loop {
                let op = Op::from_byte(code[ip]);
                ip += 1;
                match op {
                    Op::Constant => {
                        let index = read_short!();
                        let value = self.heap.fn_obj(function).constants[index];
                        self.push(fiber, value);
                    }
                    Op::IConstant => {
                        let immediate = read_short!();
                        self.push(fiber, Value::num(immediate as f64));
                    }
                    Op::Null => self.push(fiber, Value::NULL),
                    Op::False => self.push(fiber, Value::FALSE),
                    Op::True => self.push(fiber, Value::TRUE),

                    Op::LoadLocal0
                    | Op::LoadLocal1
                    | Op::LoadLocal2
                    | Op::LoadLocal3
                    | Op::LoadLocal4
                    | Op::LoadLocal5
                    | Op::LoadLocal6
                    | Op::LoadLocal7
                    | Op::LoadLocal8 => {
                        let slot = op as usize - Op::LoadLocal0 as usize;
                        let value = self.heap.fiber(fiber).stack[stack_start + slot];
                        self.push(fiber, value);
                    }
                    Op::LoadLocal => {
                        let slot = read_byte!();
                        let value = self.heap.fiber(fiber).stack[stack_start + slot];
                        self.push(fiber, value);
                    }
                    Op::StoreLocal => {
                        let slot = read_byte!();
                        let value = self.peek(fiber, 0);
                        self.heap.fiber_mut(fiber).stack[stack_start + slot] = value;
                    }

                    Op::LoadUpvalue => {
                        let index = read_byte!();
                        let upvalue = self.heap.closure(closure).upvalues[index];
                        let value = match *self.heap.upvalue(upvalue) {
                            UpvalueObj::Open { fiber: owner, slot } => {
                                self.heap.fiber(owner).stack[slot]
                            }
                            UpvalueObj::Closed(value) => value,
                        };
                        self.push(fiber, value);
                    }
                    Op::StoreUpvalue => {
                        let index = read_byte!();
                        let value = self.peek(fiber, 0);
                        let upvalue = self.heap.closure(closure).upvalues[index];
                        match *self.heap.upvalue(upvalue) {
                            UpvalueObj::Open { fiber: owner, slot } => {
                                self.heap.fiber_mut(owner).stack[slot] = value;
                            }
                            UpvalueObj::Closed(_) => {
                                *self.heap.upvalue_mut(upvalue) = UpvalueObj::Closed(value);
                            }
                        }
                    }

                    Op::LoadModuleVar => {
                        let slot = read_short!();
                        let value = self.heap.module(module).variables[slot];
                        self.push(fiber, value);
                    }
                    Op::StoreModuleVar => {
                        let slot = read_short!();
                        let value = self.peek(fiber, 0);
                        self.heap.module_mut(module).variables[slot] = value;
                    }

                    Op::LoadFieldThis => {
                        let field = read_byte!();
                        let receiver = self.heap.fiber(fiber).stack[stack_start];
                        if !receiver.is_obj()
                            || !matches!(
                                self.heap.obj(receiver.as_handle()).data,
                                ObjData::Instance(_)
                            )
                        {
                            self.fiber_error("Only instances have fields.".into());
                            runtime_error!();
                        }
                        let value = self.heap.instance(receiver.as_handle())[field];
                        self.push(fiber, value);
                    }
                    Op::StoreFieldThis => {
                        let field = read_byte!();
                        let receiver = self.heap.fiber(fiber).stack[stack_start];
                        if !receiver.is_obj()
                            || !matches!(
                                self.heap.obj(receiver.as_handle()).data,
                                ObjData::Instance(_)
                            )
                        {
                            self.fiber_error("Only instances have fields.".into());
                            runtime_error!();
                        }
                        let value = self.peek(fiber, 0);
                        self.heap.instance_mut(receiver.as_handle())[field] = value;
                    }
                    Op::LoadField => {
                        let field = read_byte!();
                        let receiver = self.pop(fiber);
                        if !receiver.is_obj()
                            || !matches!(
                                self.heap.obj(receiver.as_handle()).data,
                                ObjData::Instance(_)
                            )
                        {
                            self.fiber_error("Only instances have fields.".into());
                            runtime_error!();
                        }
                        let value = self.heap.instance(receiver.as_handle())[field];
                        self.push(fiber, value);
                    }
                    Op::StoreField => {
                        let field = read_byte!();
                        let receiver = self.pop(fiber);
                        if !receiver.is_obj()
                            || !matches!(
                                self.heap.obj(receiver.as_handle()).data,
                                ObjData::Instance(_)
                            )
                        {
                            self.fiber_error("Only instances have fields.".into());
                            runtime_error!();
                        }
                        let value = self.peek(fiber, 0);
                        self.heap.instance_mut(receiver.as_handle())[field] = value;
                    }

                    Op::Pop => {
                        self.pop(fiber);
                    }

                    Op::Call0
                    | Op::Call1
                    | Op::Call2
                    | Op::Call3
                    | Op::Call4
                    | Op::Call5
                    | Op::Call6
                    | Op::Call7
                    | Op::Call8
                    | Op::Call9
                    | Op::Call10
                    | Op::Call11
                    | Op::Call12
                    | Op::Call13
                    | Op::Call14
                    | Op::Call15
                    | Op::Call16 => {
                        let argc = op as usize - Op::Call0 as usize + 1;
                        let symbol = read_short!();
                        self.store_ip(fiber, ip);
                        let receiver = self.peek(fiber, argc - 1);
                        let class = self.class_of(receiver);
                        match self.call_method(fiber, class, symbol, argc) {
                            CallOutcome::Continue => {}
                            CallOutcome::Reload => continue 'reload,
                            CallOutcome::Error => runtime_error!(),
                        }
                    }

                    Op::Super0
                    | Op::Super1
                    | Op::Super2
                    | Op::Super3
                    | Op::Super4
                    | Op::Super5
                    | Op::Super6
                    | Op::Super7
                    | Op::Super8
                    | Op::Super9
                    | Op::Super10
                    | Op::Super11
                    | Op::Super12
                    | Op::Super13
                    | Op::Super14
                    | Op::Super15
                    | Op::Super16 => {
                        let argc = op as usize - Op::Super0 as usize + 1;
                        let symbol = read_short!();
                        let constant = read_short!();
                        self.store_ip(fiber, ip);
                        // The superclass is statically known: method binding
                        // patched it into the constant table.
                        let superclass =
                            self.heap.fn_obj(function).constants[constant].as_handle();
                        match self.call_method(fiber, superclass, symbol, argc) {
                            CallOutcome::Continue => {}
                            CallOutcome::Reload => continue 'reload,
                            CallOutcome::Error => runtime_error!(),
                        }
                    }

                    Op::Jump => {
                        let offset = read_short!();
                        ip += offset;
                    }
                    Op::Loop => {
                        let offset = read_short!();
                        ip -= offset;
                    }
                    Op::JumpIf => {
                        let offset = read_short!();
                        let condition = self.pop(fiber);
                        if condition.is_falsey() {
                            ip += offset;
                        }
                    }
                    Op::And => {
                        let offset = read_short!();
                        if self.peek(fiber, 0).is_falsey() {
                            ip += offset;
                        } else {
                            self.pop(fiber);
                        }
                    }
                    Op::Or => {
                        let offset = read_short!();
                        if self.peek(fiber, 0).is_falsey() {
                            self.pop(fiber);
                        } else {
                            ip += offset;
                        }
                    }

                    Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                        let symbol = read_short!();
                        let rhs = self.peek(fiber, 0);
                        let lhs = self.peek(fiber, 1);
                        if lhs.is_num() && rhs.is_num() {
                            // Inline fast path. Division by zero follows
                            // IEEE: inf or nan, not an error.
                            let b = rhs.as_num();
                            let a = lhs.as_num();
                            let result = match op {
                                Op::Add => a + b,
                                Op::Sub => a - b,
                                Op::Mul => a * b,
                                Op::Div => a / b,
                                _ => a % b,
                            };
                            self.pop(fiber);
                            self.pop(fiber);
                            self.push(fiber, Value::num(result));
                        } else {
                            self.store_ip(fiber, ip);
                            let class = self.class_of(lhs);
                            match self.call_method(fiber, class, symbol, 2) {
                                CallOutcome::Continue => {}
                                CallOutcome::Reload => continue 'reload,
                                CallOutcome::Error => runtime_error!(),
                            }
                        }
                    }

                    Op::CloseUpvalue => {
                        let top = self.stack_len(fiber) - 1;
                        self.close_upvalues(fiber, top);
                        self.pop(fiber);
                    }

                    Op::Return => {
                        let result = self.pop(fiber);
                        self.close_upvalues(fiber, stack_start);
                        self.heap.fiber_mut(fiber).frames.pop();
                        if self.heap.fiber(fiber).frames.is_empty() {
                            self.heap.fiber_mut(fiber).state = FiberState::Stopped;
                            let caller = self.heap.fiber(fiber).caller;
                            match caller {
                                Some(caller) => {
                                    self.heap.fiber_mut(fiber).caller = None;
                                    self.fiber = Some(caller);
                                    // The caller's call() expression
                                    // produces the completed fiber's result.
                                    let stack = &mut self.heap.fiber_mut(caller).stack;
                                    let top = stack.len() - 1;
                                    stack[top] = result;
                                    continue 'reload;
                                }
                                None => {
                                    let stack = &mut self.heap.fiber_mut(fiber).stack;
                                    stack.clear();
                                    stack.push(result);
                                    self.fiber = None;
                                    return Ok(());
                                }
                            }
                        }
                        let stack = &mut self.heap.fiber_mut(fiber).stack;
                        stack.truncate(stack_start);
                        stack.push(result);
                        continue 'reload;
                    }

                    Op::Closure => {
                        let constant = read_short!();
                        let fn_value = self.heap.fn_obj(function).constants[constant];
                        let fn_handle = fn_value.as_handle();
                        let num_upvalues = self.heap.fn_obj(fn_handle).num_upvalues;
                        let new_closure = self.new_closure(fn_handle, Vec::new());
                        // Root the closure on the stack before capturing:
                        // each capture may allocate.
                        self.push(fiber, Value::obj(new_closure));
                        for _ in 0..num_upvalues {
                            let is_local = read_byte!();
                            let index = read_byte!();
                            let upvalue = if is_local != 0 {
                                self.capture_upvalue(fiber, stack_start + index)
                            } else {
                                self.heap.closure(closure).upvalues[index]
                            };
                            self.heap.closure_mut(new_closure).upvalues.push(upvalue);
                        }
                    }

                    Op::Construct => {
                        let class_value = self.heap.fiber(fiber).stack[stack_start];
                        let instance = self.new_instance(class_value.as_handle());
                        self.heap.fiber_mut(fiber).stack[stack_start] = Value::obj(instance);
                    }
                    Op::ForeignConstruct => {
                        let class_value = self.heap.fiber(fiber).stack[stack_start];
                        let allocate = self
                            .heap
                            .class_obj(class_value.as_handle())
                            .foreign
                            .as_ref()
                            .map(|methods| methods.allocate);
                        let allocate = match allocate {
                            Some(allocate) => allocate,
                            None => {
                                self.fiber_error(
                                    "Class has no foreign allocator.".into(),
                                );
                                runtime_error!();
                            }
                        };
                        self.api_stack.clear();
                        self.api_stack.push(class_value);
                        allocate(self);
                        let result =
                            self.api_stack.first().copied().unwrap_or(Value::NULL);
                        self.api_stack.clear();
                        self.heap.fiber_mut(fiber).stack[stack_start] = result;
                        if self.heap.fiber(fiber).has_error() {
                            runtime_error!();
                        }
                    }

                    Op::Class => {
                        let num_fields = read_byte!();
                        self.store_ip(fiber, ip);
                        if !self.create_class(fiber, Some(num_fields), module) {
                            runtime_error!();
                        }
                    }
                    Op::ForeignClass => {
                        self.store_ip(fiber, ip);
                        if !self.create_class(fiber, None, module) {
                            runtime_error!();
                        }
                    }
                    Op::EndClass => {
                        let attributes = self.pop(fiber);
                        let class_value = self.pop(fiber);
                        self.heap
                            .class_obj_mut(class_value.as_handle())
                            .attributes = attributes;
                    }

                    Op::MethodInstance | Op::MethodStatic => {
                        let symbol = read_short!();
                        self.store_ip(fiber, ip);
                        let class_value = self.peek(fiber, 0);
                        let method_value = self.peek(fiber, 1);
                        let bound = self.bind_method(
                            op == Op::MethodStatic,
                            symbol,
                            module,
                            class_value.as_handle(),
                            method_value,
                        );
                        if !bound {
                            runtime_error!();
                        }
                        self.pop(fiber);
                        self.pop(fiber);
                    }

                    Op::EndModule => {
                        self.last_module = Some(module);
                        self.push(fiber, Value::NULL);
                    }

                    Op::ImportModule => {
                        let constant = read_short!();
                        let name_value = self.heap.fn_obj(function).constants[constant];
                        self.store_ip(fiber, ip);
                        match self.import_module(fiber, name_value) {
                            Ok(Some(module_closure)) => {
                                // Run the module body; its return value fills
                                // the placeholder slot.
                                self.push(fiber, Value::obj(module_closure));
                                if !self.call_function(fiber, module_closure, 1) {
                                    runtime_error!();
                                }
                                continue 'reload;
                            }
                            Ok(None) => {
                                // Already loaded; the import expression
                                // still produces a value.
                                self.push(fiber, Value::NULL);
                            }
                            Err(()) => runtime_error!(),
                        }
                    }
                    Op::ImportVariable => {
                        let constant = read_short!();
                        let name_value = self.heap.fn_obj(function).constants[constant];
                        let name = self.value_to_display(name_value);
                        let source_module = match self.last_module {
                            Some(module) => module,
                            None => unreachable!("import variable before any import"),
                        };
                        let found = self
                            .heap
                            .module(source_module)
                            .variable_names
                            .find(&name)
                            .map(|slot| self.heap.module(source_module).variables[slot]);
                        match found {
                            Some(value) => self.push(fiber, value),
                            None => {
                                let module_name = self
                                    .heap
                                    .module(source_module)
                                    .name
                                    .clone()
                                    .unwrap_or_default();
                                self.fiber_error(format!(
                                    "Could not find a variable named '{}' in module '{}'.",
                                    name, module_name
                                ));
                                runtime_error!();
                            }
                        }
                    }

                    Op::End => unreachable!("executed End opcode"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_capture(source: &str) -> (InterpretResult, String) {
        let output = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&output);
        let mut config = VmConfig::default();
        config.write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
        let mut vm = Vm::new(config);
        let result = vm.interpret("main", source);
        let text = output.borrow().clone();
        (result, text)
    }

    #[test]
    fn test_inline_arithmetic_fast_path() {
        let (result, output) = run_capture("System.print(2 - 0.5)");
        assert!(result.is_ok());
        assert_eq!(output, "1.5\n");
    }

    #[test]
    fn test_uncaught_abort_is_a_runtime_error() {
        let (result, _) = run_capture("Fiber.abort(\"x\")");
        assert!(matches!(result, Err(WispError::Runtime { message }) if message == "x"));
    }

    #[test]
    fn test_value_classification() {
        let vm = Vm::new(VmConfig::default());
        assert_eq!(vm.class_of(Value::num(1.0)), vm.core.num);
        assert_eq!(vm.class_of(Value::TRUE), vm.core.bool_class);
        assert_eq!(vm.class_of(Value::NULL), vm.core.null_class);
    }

    #[test]
    fn test_value_display() {
        let mut vm = Vm::new(VmConfig::default());
        assert_eq!(vm.value_to_display(Value::num(3.5)), "3.5");
        assert_eq!(vm.value_to_display(Value::num(4.0)), "4");
        assert_eq!(vm.value_to_display(Value::NULL), "null");
        let s = vm.string_value("text");
        assert_eq!(vm.value_to_display(s), "text");
        let list = vm.new_list(vec![Value::num(1.0), s]);
        assert_eq!(vm.value_to_display(Value::obj(list)), "[1, \"text\"]");
    }

    #[test]
    fn test_interpreting_twice_reuses_the_module() {
        let output = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&output);
        let mut config = VmConfig::default();
        config.write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
        let mut vm = Vm::new(config);
        vm.interpret("main", "var counter = 1").expect("first run");
        vm.interpret("main", "counter = counter + 1\nSystem.print(counter)")
            .expect("second run");
        assert_eq!(*output.borrow(), "2\n");
    }
}

