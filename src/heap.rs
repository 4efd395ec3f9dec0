/// Object Model & Garbage-Collected Heap
///
/// All heap objects live in one arena: a slot vector indexed by the 32-bit
/// handles carried in NaN-boxed values. Freed slots go on a free list and are
/// reused. Nothing ever moves, so handles stay valid for an object's whole
/// life.
///
/// Collection is mark-sweep with a tricolor invariant:
///   • roots are marked gray (pushed on the worklist)
///   • gray objects are popped, blackened, and their references grayed
///   • the sweep frees every white object (running Foreign finalizers) and
///     resets survivors to white
///
/// The collector is non-moving and runs only from allocation checkpoints in
/// the VM, never in the middle of an instruction.

use std::rc::Rc;

use tracing::debug;

use crate::symbols::SymbolTable;
use crate::value::{Handle, Value};
use crate::vm::{ForeignClassMethods, Method};

// ── Object payloads ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StrObj {
    pub bytes: Box<[u8]>,
    /// FNV-1a of the bytes, computed once at allocation.
    pub hash: u64,
}

impl StrObj {
    pub fn new(bytes: Vec<u8>) -> StrObj {
        let hash = fnv1a(&bytes);
        StrObj { bytes: bytes.into_boxed_slice(), hash }
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RangeObj {
    pub from: f64,
    pub to: f64,
    pub is_inclusive: bool,
}

#[derive(Debug)]
pub struct ModuleObj {
    /// None for the core module, which is also omitted from stack traces.
    pub name: Option<String>,
    /// Values of the module's top-level variables. Slot i pairs with slot i
    /// of `variable_names`.
    pub variables: Vec<Value>,
    pub variable_names: SymbolTable,
}

impl ModuleObj {
    pub fn new(name: Option<String>) -> ModuleObj {
        ModuleObj { name, variables: Vec::new(), variable_names: SymbolTable::new() }
    }
}

/// Debug metadata for a function: its name and the source line that emitted
/// each bytecode byte.
#[derive(Debug)]
pub struct FnDebug {
    pub name: String,
    pub lines: Vec<u32>,
}

#[derive(Debug)]
pub struct FnObj {
    /// Shared so the interpreter can hold the code without borrowing the
    /// heap across a dispatch. Cloned copy-on-write when method binding
    /// patches field offsets and superclass constants.
    pub code: Rc<Vec<u8>>,
    pub constants: Vec<Value>,
    pub module: Handle,
    pub arity: usize,
    pub max_slots: usize,
    pub num_upvalues: usize,
    pub debug: FnDebug,
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// A captured variable. Open while the local it references still lives on a
/// fiber stack; closed (owning its value) once that scope exits. The
/// transition happens exactly once.
#[derive(Debug)]
pub enum UpvalueObj {
    Open { fiber: Handle, slot: usize },
    Closed(Value),
}

#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: Handle,
    /// Byte offset of the next instruction in the closure's function.
    pub ip: usize,
    /// Index of the first stack slot owned by the frame; slot zero holds the
    /// receiver.
    pub stack_start: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Started by the host; cannot be called from script.
    Root,
    /// An ordinary fiber entered with call or transfer.
    Other,
    /// Entered with try: an abort unwinding through it becomes the caller's
    /// result value.
    Try,
    /// Ran to completion or aborted.
    Stopped,
}

#[derive(Debug)]
pub struct FiberObj {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues pointing into `stack`, sorted by slot (deepest last).
    pub open_upvalues: Vec<Handle>,
    pub caller: Option<Handle>,
    pub state: FiberState,
    /// The abort value; null while the fiber is healthy.
    pub error: Value,
}

impl FiberObj {
    pub fn has_error(&self) -> bool {
        !self.error.is_null()
    }
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: String,
    pub superclass: Option<Handle>,
    /// Declared plus inherited fields; every instance's field array has
    /// exactly this length.
    pub num_fields: usize,
    /// Dense method table indexed by VM-wide method symbol.
    pub methods: Vec<Option<Method>>,
    /// A Map of runtime attributes, or null.
    pub attributes: Value,
    pub foreign: Option<ForeignClassMethods>,
}

impl ClassObj {
    pub fn method(&self, symbol: usize) -> Option<Method> {
        self.methods.get(symbol).cloned().flatten()
    }

    pub fn set_method(&mut self, symbol: usize, method: Method) {
        if self.methods.len() <= symbol {
            self.methods.resize(symbol + 1, None);
        }
        self.methods[symbol] = Some(method);
    }
}

pub struct ForeignObj {
    pub data: Vec<u8>,
    pub finalize: Option<fn(&mut [u8])>,
}

impl std::fmt::Debug for ForeignObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignObj({} bytes)", self.data.len())
    }
}

#[derive(Debug)]
pub enum ObjData {
    Str(StrObj),
    List(Vec<Value>),
    Map(ValueMap),
    Range(RangeObj),
    Module(ModuleObj),
    Fn(FnObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Fiber(Box<FiberObj>),
    Class(Box<ClassObj>),
    Instance(Vec<Value>),
    Foreign(ForeignObj),
}

/// An allocated object: type payload plus the header every object carries.
#[derive(Debug)]
pub struct Obj {
    /// The object's class. None only transiently during core bootstrap,
    /// before the Object/Class metaclass cycle is patched together.
    pub class: Option<Handle>,
    pub marked: bool,
    pub data: ObjData,
}

// ── Value map ────────────────────────────────────────────────────────────────

/// An open-addressed hash table keyed by script values. Empty entries hold
/// an undefined key with a false value; tombstones hold an undefined key
/// with a true value so probe chains stay intact across deletion.
#[derive(Debug, Default)]
pub struct ValueMap {
    entries: Vec<MapEntry>,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    key: Value,
    value: Value,
}

const MAP_MIN_CAPACITY: usize = 16;
const MAP_LOAD_PERCENT: usize = 75;

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap { entries: Vec::new(), count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Iterates live entries in probe order.
    pub fn entries(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_undefined())
            .map(|e| (e.key, e.value))
    }
}

// ── Heap ─────────────────────────────────────────────────────────────────────

pub struct SweepStats {
    pub freed: usize,
    pub live_bytes: usize,
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    min_heap: usize,
    growth_percent: usize,
    gray: Vec<Handle>,
    /// Values pinned alive while being wired into the object graph.
    temp_roots: Vec<Value>,
    /// While positive, allocation does not trigger collection (the compiler's
    /// working set is not reachable from the VM roots).
    pause_depth: u32,
}

impl Heap {
    pub fn new(initial_heap: usize, min_heap: usize, growth_percent: usize) -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: initial_heap,
            min_heap,
            growth_percent,
            gray: Vec::new(),
            temp_roots: Vec::new(),
            pause_depth: 0,
        }
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    pub fn alloc(&mut self, class: Option<Handle>, data: ObjData) -> Handle {
        self.bytes_allocated += approx_size(&data);
        let obj = Obj { class, marked: false, data };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                Handle(index)
            }
            None => {
                self.slots.push(Some(obj));
                Handle((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn should_collect(&self) -> bool {
        self.pause_depth == 0 && self.bytes_allocated > self.next_gc
    }

    pub fn pause_gc(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume_gc(&mut self) {
        debug_assert!(self.pause_depth > 0);
        self.pause_depth -= 1;
    }

    pub fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop();
    }

    // ── Access ───────────────────────────────────────────────────────────────

    pub fn obj(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.index()] {
            Some(obj) => obj,
            None => unreachable!("use of freed object"),
        }
    }

    pub fn obj_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.index()] {
            Some(obj) => obj,
            None => unreachable!("use of freed object"),
        }
    }

    pub fn obj_class(&self, handle: Handle) -> Handle {
        match self.obj(handle).class {
            Some(class) => class,
            None => unreachable!("object class not yet bootstrapped"),
        }
    }

    pub fn string(&self, handle: Handle) -> &StrObj {
        match &self.obj(handle).data {
            ObjData::Str(s) => s,
            _ => unreachable!("expected string"),
        }
    }

    pub fn is_string(&self, value: Value) -> bool {
        value.is_obj() && matches!(self.obj(value.as_handle()).data, ObjData::Str(_))
    }

    pub fn list(&self, handle: Handle) -> &Vec<Value> {
        match &self.obj(handle).data {
            ObjData::List(elements) => elements,
            _ => unreachable!("expected list"),
        }
    }

    pub fn list_mut(&mut self, handle: Handle) -> &mut Vec<Value> {
        match &mut self.obj_mut(handle).data {
            ObjData::List(elements) => elements,
            _ => unreachable!("expected list"),
        }
    }

    pub fn map(&self, handle: Handle) -> &ValueMap {
        match &self.obj(handle).data {
            ObjData::Map(map) => map,
            _ => unreachable!("expected map"),
        }
    }

    pub fn range(&self, handle: Handle) -> RangeObj {
        match &self.obj(handle).data {
            ObjData::Range(range) => *range,
            _ => unreachable!("expected range"),
        }
    }

    pub fn module(&self, handle: Handle) -> &ModuleObj {
        match &self.obj(handle).data {
            ObjData::Module(module) => module,
            _ => unreachable!("expected module"),
        }
    }

    pub fn module_mut(&mut self, handle: Handle) -> &mut ModuleObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Module(module) => module,
            _ => unreachable!("expected module"),
        }
    }

    pub fn fn_obj(&self, handle: Handle) -> &FnObj {
        match &self.obj(handle).data {
            ObjData::Fn(function) => function,
            _ => unreachable!("expected function"),
        }
    }

    pub fn fn_obj_mut(&mut self, handle: Handle) -> &mut FnObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Fn(function) => function,
            _ => unreachable!("expected function"),
        }
    }

    pub fn closure(&self, handle: Handle) -> &ClosureObj {
        match &self.obj(handle).data {
            ObjData::Closure(closure) => closure,
            _ => unreachable!("expected closure"),
        }
    }

    pub fn closure_mut(&mut self, handle: Handle) -> &mut ClosureObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Closure(closure) => closure,
            _ => unreachable!("expected closure"),
        }
    }

    pub fn is_closure(&self, value: Value) -> bool {
        value.is_obj() && matches!(self.obj(value.as_handle()).data, ObjData::Closure(_))
    }

    pub fn upvalue(&self, handle: Handle) -> &UpvalueObj {
        match &self.obj(handle).data {
            ObjData::Upvalue(upvalue) => upvalue,
            _ => unreachable!("expected upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> &mut UpvalueObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Upvalue(upvalue) => upvalue,
            _ => unreachable!("expected upvalue"),
        }
    }

    pub fn fiber(&self, handle: Handle) -> &FiberObj {
        match &self.obj(handle).data {
            ObjData::Fiber(fiber) => fiber,
            _ => unreachable!("expected fiber"),
        }
    }

    pub fn fiber_mut(&mut self, handle: Handle) -> &mut FiberObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Fiber(fiber) => fiber,
            _ => unreachable!("expected fiber"),
        }
    }

    pub fn is_fiber(&self, value: Value) -> bool {
        value.is_obj() && matches!(self.obj(value.as_handle()).data, ObjData::Fiber(_))
    }

    pub fn class_obj(&self, handle: Handle) -> &ClassObj {
        match &self.obj(handle).data {
            ObjData::Class(class) => class,
            _ => unreachable!("expected class"),
        }
    }

    pub fn class_obj_mut(&mut self, handle: Handle) -> &mut ClassObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Class(class) => class,
            _ => unreachable!("expected class"),
        }
    }

    pub fn is_class(&self, value: Value) -> bool {
        value.is_obj() && matches!(self.obj(value.as_handle()).data, ObjData::Class(_))
    }

    pub fn instance(&self, handle: Handle) -> &Vec<Value> {
        match &self.obj(handle).data {
            ObjData::Instance(fields) => fields,
            _ => unreachable!("expected instance"),
        }
    }

    pub fn instance_mut(&mut self, handle: Handle) -> &mut Vec<Value> {
        match &mut self.obj_mut(handle).data {
            ObjData::Instance(fields) => fields,
            _ => unreachable!("expected instance"),
        }
    }

    pub fn foreign(&self, handle: Handle) -> &ForeignObj {
        match &self.obj(handle).data {
            ObjData::Foreign(foreign) => foreign,
            _ => unreachable!("expected foreign"),
        }
    }

    pub fn foreign_mut(&mut self, handle: Handle) -> &mut ForeignObj {
        match &mut self.obj_mut(handle).data {
            ObjData::Foreign(foreign) => foreign,
            _ => unreachable!("expected foreign"),
        }
    }

    // ── Value semantics ──────────────────────────────────────────────────────

    /// Deep equality for `==`: bitwise identity, or content equality for
    /// strings and ranges.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        if a.is_num() && b.is_num() {
            return a.as_num() == b.as_num();
        }
        if !a.is_obj() || !b.is_obj() {
            return false;
        }
        match (&self.obj(a.as_handle()).data, &self.obj(b.as_handle()).data) {
            (ObjData::Str(x), ObjData::Str(y)) => x.hash == y.hash && x.bytes == y.bytes,
            (ObjData::Range(x), ObjData::Range(y)) => {
                x.from == y.from && x.to == y.to && x.is_inclusive == y.is_inclusive
            }
            _ => false,
        }
    }

    /// Hash for map keys; None when the value is not a hashable type.
    pub fn hash_value(&self, value: Value) -> Option<u64> {
        if value.is_num() {
            return Some(fnv1a(&value.as_num().to_bits().to_le_bytes()));
        }
        if !value.is_obj() {
            // null, true, false hash on their tag bits.
            return Some(fnv1a(&value.to_bits().to_le_bytes()));
        }
        match &self.obj(value.as_handle()).data {
            ObjData::Str(s) => Some(s.hash),
            ObjData::Range(r) => {
                let mut bytes = Vec::with_capacity(17);
                bytes.extend_from_slice(&r.from.to_bits().to_le_bytes());
                bytes.extend_from_slice(&r.to.to_bits().to_le_bytes());
                bytes.push(r.is_inclusive as u8);
                Some(fnv1a(&bytes))
            }
            ObjData::Class(c) => Some(fnv1a(c.name.as_bytes())),
            _ => None,
        }
    }

    // ── Map operations ───────────────────────────────────────────────────────
    //
    // These live on the heap rather than ValueMap because probing needs to
    // hash and compare keys that may themselves be heap objects.

    /// Returns the value for `key`, or undefined when absent.
    pub fn map_get(&self, map: Handle, key: Value) -> Value {
        let m = self.map(map);
        if m.entries.is_empty() {
            return Value::UNDEFINED;
        }
        match self.find_entry(&m.entries, key) {
            Some(index) if !m.entries[index].key.is_undefined() => m.entries[index].value,
            _ => Value::UNDEFINED,
        }
    }

    /// Inserts or overwrites `key`. Unhashable keys are rejected by the
    /// callers; an unhashable key here is a silent no-op.
    pub fn map_set(&mut self, map: Handle, key: Value, value: Value) {
        let (mut entries, mut count) = self.take_map(map);
        if (count + 1) * 100 > entries.len() * MAP_LOAD_PERCENT {
            let capacity = (entries.len() * 2).max(MAP_MIN_CAPACITY);
            entries = self.resize_map(entries, capacity);
        }
        let index = match self.find_entry(&entries, key) {
            Some(index) => index,
            None => {
                self.put_map(map, entries, count);
                return;
            }
        };
        if entries[index].key.is_undefined() {
            count += 1;
        }
        entries[index] = MapEntry { key, value };
        self.put_map(map, entries, count);
        self.bytes_allocated += 16;
    }

    /// Removes `key`, returning the removed value or null.
    pub fn map_remove(&mut self, map: Handle, key: Value) -> Value {
        let (mut entries, mut count) = self.take_map(map);
        let removed = match self.find_entry(&entries, key) {
            Some(index) if !entries[index].key.is_undefined() => {
                let value = entries[index].value;
                // Leave a tombstone so probe chains stay connected.
                entries[index] = MapEntry { key: Value::UNDEFINED, value: Value::TRUE };
                count -= 1;
                value
            }
            _ => Value::NULL,
        };
        self.put_map(map, entries, count);
        removed
    }

    fn take_map(&mut self, map: Handle) -> (Vec<MapEntry>, usize) {
        match &mut self.obj_mut(map).data {
            ObjData::Map(m) => (std::mem::take(&mut m.entries), m.count),
            _ => unreachable!("expected map"),
        }
    }

    fn put_map(&mut self, map: Handle, entries: Vec<MapEntry>, count: usize) {
        match &mut self.obj_mut(map).data {
            ObjData::Map(m) => {
                m.entries = entries;
                m.count = count;
            }
            _ => unreachable!("expected map"),
        }
    }

    /// Finds the entry holding `key`, or the empty/tombstone slot where it
    /// would be inserted. None only when the table has no capacity.
    fn find_entry(&self, entries: &[MapEntry], key: Value) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        let hash = match self.hash_value(key) {
            Some(hash) => hash,
            None => return None,
        };
        let capacity = entries.len();
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        for _ in 0..capacity {
            let entry = &entries[index];
            if entry.key.is_undefined() {
                if entry.value.is_falsey() {
                    // Truly empty: the key is absent. Prefer reusing a
                    // tombstone passed on the way.
                    return Some(tombstone.unwrap_or(index));
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if self.values_equal(entry.key, key) {
                return Some(index);
            }
            index = (index + 1) % capacity;
        }
        // Every slot is live or a tombstone; fall back to a tombstone.
        tombstone
    }

    fn resize_map(&self, old: Vec<MapEntry>, capacity: usize) -> Vec<MapEntry> {
        let mut entries =
            vec![MapEntry { key: Value::UNDEFINED, value: Value::FALSE }; capacity];
        for entry in &old {
            if entry.key.is_undefined() {
                continue;
            }
            if let Some(index) = self.find_entry(&entries, entry.key) {
                entries[index] = *entry;
            }
        }
        entries
    }

    // ── Collection ───────────────────────────────────────────────────────────

    pub fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_handle());
        }
    }

    pub fn mark_object(&mut self, handle: Handle) {
        let obj = self.obj_mut(handle);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(handle);
    }

    pub fn mark_temp_roots(&mut self) {
        for i in 0..self.temp_roots.len() {
            let value = self.temp_roots[i];
            self.mark_value(value);
        }
    }

    /// Drains the gray worklist, blackening each object by graying its
    /// direct references.
    pub fn trace(&mut self) {
        let mut children: Vec<Value> = Vec::new();
        while let Some(handle) = self.gray.pop() {
            children.clear();
            let obj = self.obj(handle);
            if let Some(class) = obj.class {
                children.push(Value::obj(class));
            }
            match &obj.data {
                ObjData::Str(_) | ObjData::Range(_) | ObjData::Foreign(_) => {}
                ObjData::List(elements) => children.extend_from_slice(elements),
                ObjData::Map(map) => {
                    for (key, value) in map.entries() {
                        children.push(key);
                        children.push(value);
                    }
                }
                ObjData::Module(module) => children.extend_from_slice(&module.variables),
                ObjData::Fn(function) => {
                    children.extend_from_slice(&function.constants);
                    children.push(Value::obj(function.module));
                }
                ObjData::Closure(closure) => {
                    children.push(Value::obj(closure.function));
                    children.extend(closure.upvalues.iter().map(|&u| Value::obj(u)));
                }
                ObjData::Upvalue(upvalue) => match upvalue {
                    UpvalueObj::Open { fiber, .. } => children.push(Value::obj(*fiber)),
                    UpvalueObj::Closed(value) => children.push(*value),
                },
                ObjData::Fiber(fiber) => {
                    children.extend_from_slice(&fiber.stack);
                    children.extend(fiber.frames.iter().map(|f| Value::obj(f.closure)));
                    children.extend(fiber.open_upvalues.iter().map(|&u| Value::obj(u)));
                    if let Some(caller) = fiber.caller {
                        children.push(Value::obj(caller));
                    }
                    children.push(fiber.error);
                }
                ObjData::Class(class) => {
                    if let Some(superclass) = class.superclass {
                        children.push(Value::obj(superclass));
                    }
                    children.push(class.attributes);
                    for method in class.methods.iter().flatten() {
                        if let Method::Block(closure) = method {
                            children.push(Value::obj(*closure));
                        }
                    }
                }
                ObjData::Instance(fields) => children.extend_from_slice(fields),
            }
            for &child in &children {
                self.mark_value(child);
            }
        }
    }

    /// Frees every unmarked object and resets survivors to white. Foreign
    /// finalizers run just before their object is dropped.
    pub fn sweep(&mut self) -> SweepStats {
        let mut freed = 0;
        let mut live_bytes = 0;
        for index in 0..self.slots.len() {
            let keep = match &mut self.slots[index] {
                Some(obj) if obj.marked => {
                    obj.marked = false;
                    live_bytes += approx_size(&obj.data);
                    true
                }
                Some(obj) => {
                    if let ObjData::Foreign(foreign) = &mut obj.data {
                        if let Some(finalize) = foreign.finalize {
                            finalize(&mut foreign.data);
                        }
                    }
                    false
                }
                None => continue,
            };
            if !keep {
                self.slots[index] = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.bytes_allocated = live_bytes;
        self.next_gc = (live_bytes * (100 + self.growth_percent) / 100).max(self.min_heap);
        debug!(freed, live_bytes, next_gc = self.next_gc, "gc cycle complete");
        SweepStats { freed, live_bytes }
    }

    #[cfg(test)]
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

fn approx_size(data: &ObjData) -> usize {
    let payload = match data {
        ObjData::Str(s) => s.bytes.len(),
        ObjData::List(elements) => elements.len() * 8,
        ObjData::Map(map) => map.entries.len() * 16,
        ObjData::Range(_) => 0,
        ObjData::Module(module) => module.variables.len() * 16,
        ObjData::Fn(function) => function.code.len() + function.constants.len() * 8,
        ObjData::Closure(closure) => closure.upvalues.len() * 8,
        ObjData::Upvalue(_) => 0,
        ObjData::Fiber(fiber) => fiber.stack.len() * 8 + fiber.frames.len() * 24,
        ObjData::Class(class) => class.methods.len() * 16,
        ObjData::Instance(fields) => fields.len() * 8,
        ObjData::Foreign(foreign) => foreign.data.len(),
    };
    payload + 48
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x1_0000_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        Heap::new(10 * 1024 * 1024, 1024 * 1024, 50)
    }

    fn new_string(heap: &mut Heap, text: &str) -> Handle {
        heap.alloc(None, ObjData::Str(StrObj::new(text.as_bytes().to_vec())))
    }

    #[test]
    fn test_string_equality_is_by_content() {
        let mut heap = test_heap();
        let a = new_string(&mut heap, "hello");
        let b = new_string(&mut heap, "hello");
        let c = new_string(&mut heap, "world");
        assert_ne!(a, b);
        assert!(heap.values_equal(Value::obj(a), Value::obj(b)));
        assert!(!heap.values_equal(Value::obj(a), Value::obj(c)));
    }

    #[test]
    fn test_map_insert_lookup_remove() {
        let mut heap = test_heap();
        let map = heap.alloc(None, ObjData::Map(ValueMap::new()));
        let key = new_string(&mut heap, "answer");
        let key_copy = new_string(&mut heap, "answer");

        heap.map_set(map, Value::obj(key), Value::num(42.0));
        heap.map_set(map, Value::num(1.0), Value::TRUE);

        assert_eq!(heap.map(map).count(), 2);
        // Lookup goes by content, not identity.
        assert_eq!(heap.map_get(map, Value::obj(key_copy)), Value::num(42.0));
        assert_eq!(heap.map_get(map, Value::num(1.0)), Value::TRUE);
        assert!(heap.map_get(map, Value::num(2.0)).is_undefined());

        let removed = heap.map_remove(map, Value::obj(key));
        assert_eq!(removed, Value::num(42.0));
        assert_eq!(heap.map(map).count(), 1);
        assert!(heap.map_get(map, Value::obj(key)).is_undefined());
        // The surviving entry is still reachable through the tombstone.
        assert_eq!(heap.map_get(map, Value::num(1.0)), Value::TRUE);
    }

    #[test]
    fn test_map_grows_past_load_factor() {
        let mut heap = test_heap();
        let map = heap.alloc(None, ObjData::Map(ValueMap::new()));
        for i in 0..100 {
            heap.map_set(map, Value::num(i as f64), Value::num((i * 2) as f64));
        }
        assert_eq!(heap.map(map).count(), 100);
        for i in 0..100 {
            assert_eq!(
                heap.map_get(map, Value::num(i as f64)),
                Value::num((i * 2) as f64)
            );
        }
    }

    #[test]
    fn test_overwriting_a_key_keeps_count() {
        let mut heap = test_heap();
        let map = heap.alloc(None, ObjData::Map(ValueMap::new()));
        heap.map_set(map, Value::TRUE, Value::num(1.0));
        heap.map_set(map, Value::TRUE, Value::num(2.0));
        assert_eq!(heap.map(map).count(), 1);
        assert_eq!(heap.map_get(map, Value::TRUE), Value::num(2.0));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = test_heap();
        let keep = new_string(&mut heap, "keep");
        let drop1 = new_string(&mut heap, "drop");
        let list = heap.alloc(None, ObjData::List(vec![Value::obj(keep)]));
        let _drop2 = heap.alloc(None, ObjData::List(vec![Value::obj(drop1)]));

        heap.mark_object(list);
        heap.trace();
        let stats = heap.sweep();

        assert_eq!(stats.freed, 2);
        assert_eq!(heap.live_objects(), 2);
        // Survivors are reset to white and usable.
        assert!(!heap.obj(keep).marked);
        assert_eq!(heap.string(keep).as_str(), "keep");
    }

    #[test]
    fn test_temp_roots_survive() {
        let mut heap = test_heap();
        let pinned = new_string(&mut heap, "pinned");
        heap.push_temp_root(Value::obj(pinned));

        heap.mark_temp_roots();
        heap.trace();
        let stats = heap.sweep();
        assert_eq!(stats.freed, 0);

        heap.pop_temp_root();
        heap.trace();
        let stats = heap.sweep();
        assert_eq!(stats.freed, 1);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = test_heap();
        let dead = new_string(&mut heap, "x");
        heap.trace();
        heap.sweep();
        let reused = new_string(&mut heap, "y");
        assert_eq!(dead, reused);
    }

    #[test]
    fn test_closed_upvalue_keeps_value_alive() {
        let mut heap = test_heap();
        let s = new_string(&mut heap, "captured");
        let upvalue = heap.alloc(None, ObjData::Upvalue(UpvalueObj::Closed(Value::obj(s))));
        heap.mark_object(upvalue);
        heap.trace();
        let stats = heap.sweep();
        assert_eq!(stats.freed, 0);
    }
}
