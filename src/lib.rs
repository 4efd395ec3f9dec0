/// Wisp — an embeddable class-based scripting language
///
/// Module layout:
///   - lexer      — token stream, interpolation state machine, raw strings
///   - value      — NaN-boxed 64-bit values and heap handles
///   - heap       — arena heap, object model, mark-sweep garbage collector
///   - symbols    — method-signature symbol table
///   - bytecode   — instruction set catalog
///   - compiler   — single-pass parser-to-bytecode compiler
///   - vm         — the VM: configuration, interpreter loop, fibers, classes
///   - intrinsics — built-in classes and primitive methods
///   - api        — slot API and persistent handles for embedding
///   - debug      — bytecode disassembler
///   - errors     — diagnostic kinds and the public interpret result
///
/// A host embeds the runtime by building a `VmConfig` with its callbacks
/// (output, error reporting, module loading, foreign bindings), creating a
/// `Vm`, and feeding it source:
///
/// ```
/// use wisp::{Vm, VmConfig};
///
/// let mut vm = Vm::new(VmConfig::default());
/// vm.interpret("main", "System.print(1 + 2)").unwrap();
/// ```

pub mod bytecode;
pub mod debug;
pub mod errors;
pub mod lexer;
pub mod value;

mod api;
mod compiler;
mod heap;
mod intrinsics;
mod symbols;
mod vm;

pub use api::{ApiHandle, SlotType};
pub use errors::{ErrorKind, InterpretResult, WispError};
pub use value::{Handle, Value};
pub use vm::{
    FinalizerFn, ForeignClassMethods, ForeignMethodFn, Vm, VmConfig,
};
