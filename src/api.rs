/// Host Interface — slots and handles
///
/// The slot array is a numbered scratch area for moving values between the
/// host and the VM. Slots are GC roots while they hold values; during a
/// foreign method call slot zero starts as the receiver and ends as the
/// return value. Handles are persistent roots that outlive any single call
/// until explicitly released.

use std::rc::Rc;

use crate::errors::{InterpretResult, WispError};
use crate::heap::{FiberState, FnDebug, FnObj, ForeignObj, ObjData};
use crate::value::Value;
use crate::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Bool,
    Num,
    Foreign,
    List,
    Map,
    Null,
    String,
    Unknown,
}

/// A persistent reference to a script value. Keeps its target alive until
/// released with `Vm::release_handle`.
#[derive(Debug, Clone)]
pub struct ApiHandle {
    index: u32,
}

impl Vm {
    // ── Slot management ──────────────────────────────────────────────────────

    /// Grows the slot array to hold at least `count` slots.
    pub fn ensure_slots(&mut self, count: usize) {
        if self.api_stack.len() < count {
            self.api_stack.resize(count, Value::NULL);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.api_stack.len()
    }

    fn slot(&self, slot: usize) -> Value {
        self.api_stack.get(slot).copied().unwrap_or(Value::NULL)
    }

    fn set_slot(&mut self, slot: usize, value: Value) {
        self.ensure_slots(slot + 1);
        self.api_stack[slot] = value;
    }

    pub fn get_slot_type(&self, slot: usize) -> SlotType {
        let value = self.slot(slot);
        if value.is_bool() {
            return SlotType::Bool;
        }
        if value.is_num() {
            return SlotType::Num;
        }
        if value.is_null() {
            return SlotType::Null;
        }
        if value.is_obj() {
            return match &self.heap.obj(value.as_handle()).data {
                ObjData::Str(_) => SlotType::String,
                ObjData::List(_) => SlotType::List,
                ObjData::Map(_) => SlotType::Map,
                ObjData::Foreign(_) => SlotType::Foreign,
                _ => SlotType::Unknown,
            };
        }
        SlotType::Unknown
    }

    // ── Typed getters ────────────────────────────────────────────────────────

    pub fn get_slot_bool(&self, slot: usize) -> Option<bool> {
        let value = self.slot(slot);
        if value.is_bool() { Some(value.as_bool()) } else { None }
    }

    pub fn get_slot_num(&self, slot: usize) -> Option<f64> {
        let value = self.slot(slot);
        if value.is_num() { Some(value.as_num()) } else { None }
    }

    pub fn get_slot_string(&self, slot: usize) -> Option<String> {
        let value = self.slot(slot);
        if self.heap.is_string(value) {
            Some(self.heap.string(value.as_handle()).as_str().into_owned())
        } else {
            None
        }
    }

    pub fn get_slot_bytes(&self, slot: usize) -> Option<&[u8]> {
        let value = self.slot(slot);
        if self.heap.is_string(value) {
            Some(&self.heap.string(value.as_handle()).bytes)
        } else {
            None
        }
    }

    // ── Typed setters ────────────────────────────────────────────────────────

    pub fn set_slot_null(&mut self, slot: usize) {
        self.set_slot(slot, Value::NULL);
    }

    pub fn set_slot_bool(&mut self, slot: usize, value: bool) {
        self.set_slot(slot, Value::boolean(value));
    }

    pub fn set_slot_num(&mut self, slot: usize, value: f64) {
        self.set_slot(slot, Value::num(value));
    }

    pub fn set_slot_string(&mut self, slot: usize, text: &str) {
        let value = self.string_value(text);
        self.set_slot(slot, value);
    }

    pub fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) {
        let string = self.new_string(bytes.to_vec());
        self.set_slot(slot, Value::obj(string));
    }

    // ── Lists ────────────────────────────────────────────────────────────────

    pub fn set_slot_new_list(&mut self, slot: usize) {
        let list = self.new_list(Vec::new());
        self.set_slot(slot, Value::obj(list));
    }

    pub fn get_list_count(&self, slot: usize) -> usize {
        let value = self.slot(slot);
        if value.is_obj() {
            if let ObjData::List(elements) = &self.heap.obj(value.as_handle()).data {
                return elements.len();
            }
        }
        0
    }

    pub fn get_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let value = self.slot(list_slot);
        let element = self.heap.list(value.as_handle())[index];
        self.set_slot(element_slot, element);
    }

    pub fn set_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let list = self.slot(list_slot);
        let element = self.slot(element_slot);
        self.heap.list_mut(list.as_handle())[index] = element;
    }

    pub fn insert_in_list(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let list = self.slot(list_slot);
        let element = self.slot(element_slot);
        let elements = self.heap.list_mut(list.as_handle());
        let index = index.min(elements.len());
        elements.insert(index, element);
    }

    // ── Maps ─────────────────────────────────────────────────────────────────

    pub fn set_slot_new_map(&mut self, slot: usize) {
        let map = self.new_map();
        self.set_slot(slot, Value::obj(map));
    }

    pub fn get_map_count(&self, slot: usize) -> usize {
        let value = self.slot(slot);
        if value.is_obj() {
            if let ObjData::Map(map) = &self.heap.obj(value.as_handle()).data {
                return map.count();
            }
        }
        0
    }

    pub fn map_contains_key(&self, map_slot: usize, key_slot: usize) -> bool {
        let map = self.slot(map_slot);
        let key = self.slot(key_slot);
        !self.heap.map_get(map.as_handle(), key).is_undefined()
    }

    pub fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let map = self.slot(map_slot);
        let key = self.slot(key_slot);
        let value = self.heap.map_get(map.as_handle(), key);
        let value = if value.is_undefined() { Value::NULL } else { value };
        self.set_slot(value_slot, value);
    }

    pub fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let map = self.slot(map_slot);
        let key = self.slot(key_slot);
        let value = self.slot(value_slot);
        self.heap.map_set(map.as_handle(), key, value);
    }

    pub fn remove_map_value(&mut self, map_slot: usize, key_slot: usize, removed_slot: usize) {
        let map = self.slot(map_slot);
        let key = self.slot(key_slot);
        let removed = self.heap.map_remove(map.as_handle(), key);
        self.set_slot(removed_slot, removed);
    }

    // ── Foreign objects ──────────────────────────────────────────────────────

    /// Creates a foreign object of the class in `class_slot` with a
    /// zero-filled payload of `size` bytes, storing it in `slot`.
    pub fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, size: usize) {
        let class_value = self.slot(class_slot);
        let class = class_value.as_handle();
        let finalize = self
            .heap
            .class_obj(class)
            .foreign
            .as_ref()
            .and_then(|methods| methods.finalize);
        let foreign = self.alloc(
            Some(class),
            ObjData::Foreign(ForeignObj { data: vec![0; size], finalize }),
        );
        self.set_slot(slot, Value::obj(foreign));
    }

    pub fn get_slot_foreign(&self, slot: usize) -> Option<&[u8]> {
        let value = self.slot(slot);
        if value.is_obj() {
            if let ObjData::Foreign(foreign) = &self.heap.obj(value.as_handle()).data {
                return Some(&foreign.data);
            }
        }
        None
    }

    pub fn get_slot_foreign_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        let value = self.slot(slot);
        if value.is_obj() {
            if let ObjData::Foreign(foreign) = &mut self.heap.obj_mut(value.as_handle()).data {
                return Some(&mut foreign.data);
            }
        }
        None
    }

    // ── Module variables ─────────────────────────────────────────────────────

    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn has_variable(&self, module: &str, name: &str) -> bool {
        match self.modules.get(module) {
            Some(&handle) => self.heap.module(handle).variable_names.find(name).is_some(),
            None => false,
        }
    }

    /// Copies a module's top-level variable into `slot`. Returns false when
    /// the module or variable does not exist.
    pub fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> bool {
        let handle = match self.modules.get(module) {
            Some(&handle) => handle,
            None => return false,
        };
        let value = match self.heap.module(handle).variable_names.find(name) {
            Some(symbol) => self.heap.module(handle).variables[symbol],
            None => return false,
        };
        self.set_slot(slot, value);
        true
    }

    // ── Fiber control from foreign methods ───────────────────────────────────

    /// Aborts the current fiber with the value in `slot`; the foreign call
    /// returns into error unwinding.
    pub fn abort_fiber(&mut self, slot: usize) {
        let error = self.slot(slot);
        if let Some(fiber) = self.fiber {
            self.heap.fiber_mut(fiber).error = error;
        }
    }

    // ── Handles ──────────────────────────────────────────────────────────────

    /// Pins the value in `slot` behind a persistent handle.
    pub fn get_slot_handle(&mut self, slot: usize) -> ApiHandle {
        let value = self.slot(slot);
        self.register_handle(value)
    }

    pub fn set_slot_handle(&mut self, slot: usize, handle: &ApiHandle) {
        let value = self.handle_value(handle);
        self.set_slot(slot, value);
    }

    pub fn release_handle(&mut self, handle: ApiHandle) {
        self.handles[handle.index as usize] = None;
        self.free_handles.push(handle.index);
    }

    fn register_handle(&mut self, value: Value) -> ApiHandle {
        match self.free_handles.pop() {
            Some(index) => {
                self.handles[index as usize] = Some(value);
                ApiHandle { index }
            }
            None => {
                self.handles.push(Some(value));
                ApiHandle { index: (self.handles.len() - 1) as u32 }
            }
        }
    }

    fn handle_value(&self, handle: &ApiHandle) -> Value {
        match self.handles.get(handle.index as usize) {
            Some(Some(value)) => *value,
            _ => Value::NULL,
        }
    }

    // ── Calling into script ──────────────────────────────────────────────────

    /// Compiles a signature into a reusable call stub: a one-instruction
    /// function that dispatches the method on slot zero's receiver.
    pub fn make_call_handle(&mut self, signature: &str) -> ApiHandle {
        use crate::bytecode::Op;

        let symbol = self.method_names.ensure(signature);
        // Each `_` in the signature is one parameter.
        let arity = signature.bytes().filter(|&b| b == b'_').count();

        let mut code = Vec::with_capacity(5);
        code.push(Op::call(arity) as u8);
        code.push((symbol >> 8) as u8);
        code.push(symbol as u8);
        code.push(Op::Return as u8);
        code.push(Op::End as u8);
        let lines = vec![0; code.len()];

        let function = FnObj {
            code: Rc::new(code),
            constants: Vec::new(),
            module: self.core_module,
            arity,
            max_slots: arity + 1,
            num_upvalues: 0,
            debug: FnDebug { name: signature.to_string(), lines },
        };
        let fn_class = self.core.fn_class;
        let fn_handle = self.alloc(Some(fn_class), ObjData::Fn(function));
        self.heap.push_temp_root(Value::obj(fn_handle));
        let closure = self.new_closure(fn_handle, Vec::new());
        self.heap.pop_temp_root();
        self.register_handle(Value::obj(closure))
    }

    /// Invokes a call handle. Slot zero holds the receiver and slots 1..n
    /// the arguments; on return slot zero holds the result.
    pub fn call(&mut self, method: &ApiHandle) -> InterpretResult {
        let closure_value = self.handle_value(method);
        if !self.heap.is_closure(closure_value) {
            return Err(WispError::Runtime {
                message: "Handle is not a callable method.".to_string(),
            });
        }
        let closure = closure_value.as_handle();
        let function = self.heap.closure(closure).function;
        let arity = self.heap.fn_obj(function).arity;
        self.ensure_slots(arity + 1);

        let fiber = self.new_fiber(closure);
        let args: Vec<Value> = self.api_stack[..=arity].to_vec();
        {
            let fiber_obj = self.heap.fiber_mut(fiber);
            fiber_obj.stack.clear();
            fiber_obj.stack.extend_from_slice(&args);
            fiber_obj.state = FiberState::Root;
        }
        self.api_stack.clear();
        self.fiber = Some(fiber);
        let result = self.run_interpreter();

        // A completed fiber leaves its result in stack slot zero.
        let produced = self
            .heap
            .fiber(fiber)
            .stack
            .first()
            .copied()
            .unwrap_or(Value::NULL);
        self.set_slot(0, produced);
        result
    }
}
