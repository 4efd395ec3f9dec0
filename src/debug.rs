/// Bytecode Disassembler
///
/// Renders compiled functions for inspection and testing. Each instruction
/// prints on one line; the source line appears in the left column only when
/// it differs from the previous instruction's, which makes the per-byte
/// debug line table easy to eyeball.

use std::fmt::Write;

use crate::bytecode::{Args, Op};
use crate::value::Handle;
use crate::vm::Vm;

/// Disassembles a whole function, header included.
pub fn dump_code(vm: &Vm, function: Handle) -> String {
    let fn_obj = vm.heap.fn_obj(function);
    let module_name = match &vm.heap.module(fn_obj.module).name {
        Some(name) => name.clone(),
        None => "<core>".to_string(),
    };
    let mut out = format!("{}: {}\n", module_name, fn_obj.debug.name);

    let mut offset = 0;
    let mut last_line = None;
    while let Some(next) = dump_instruction_at(vm, function, offset, &mut last_line, &mut out) {
        offset = next;
    }
    out
}

/// Disassembles the single instruction at `offset`, returning its text.
pub fn dump_instruction(vm: &Vm, function: Handle, offset: usize) -> String {
    let mut out = String::new();
    let mut last_line = None;
    dump_instruction_at(vm, function, offset, &mut last_line, &mut out);
    out
}

fn dump_instruction_at(
    vm: &Vm,
    function: Handle,
    start: usize,
    last_line: &mut Option<u32>,
    out: &mut String,
) -> Option<usize> {
    let fn_obj = vm.heap.fn_obj(function);
    let code = &fn_obj.code;
    let op = Op::from_byte(code[start]);

    let line = fn_obj.debug.lines[start];
    if *last_line != Some(line) {
        let _ = write!(out, "{:4}:", line);
        *last_line = Some(line);
    } else {
        out.push_str("     ");
    }
    let _ = write!(out, " {:04}  ", start);

    let mut i = start + 1;
    let name = op.name();
    match op {
        Op::Constant => {
            let constant = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let _ = writeln!(
                out,
                "{:<16} {:5} '{}'",
                name,
                constant,
                vm.value_to_display(fn_obj.constants[constant])
            );
        }
        Op::IConstant => {
            let value = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let _ = writeln!(out, "{:<16} {:5}", name, value);
        }
        Op::LoadModuleVar | Op::StoreModuleVar => {
            let slot = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let module = vm.heap.module(fn_obj.module);
            let _ = writeln!(
                out,
                "{:<16} {:5} '{}'",
                name,
                slot,
                module.variable_names.name(slot)
            );
        }
        Op::Jump | Op::JumpIf | Op::And | Op::Or => {
            let offset = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let _ = writeln!(out, "{:<16} {:5} to {}", name, offset, i + offset);
        }
        Op::Loop => {
            let offset = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let _ = writeln!(out, "{:<16} {:5} to {}", name, offset, i - offset);
        }
        Op::Closure => {
            let constant = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let fn_value = fn_obj.constants[constant];
            let nested = vm.heap.fn_obj(fn_value.as_handle());
            let _ = write!(out, "{:<16} {:5} '{}' ", name, constant, nested.debug.name);
            for upvalue in 0..nested.num_upvalues {
                let is_local = code[i] != 0;
                let index = code[i + 1];
                i += 2;
                if upvalue > 0 {
                    out.push_str(", ");
                }
                let _ = write!(
                    out,
                    "{} {}",
                    if is_local { "local" } else { "upvalue" },
                    index
                );
            }
            out.push('\n');
        }
        Op::Class => {
            let fields = code[i] as usize;
            i += 1;
            let _ = writeln!(out, "{:<16} {:5} fields", name, fields);
        }
        Op::ImportModule | Op::ImportVariable => {
            let constant = ((code[i] as usize) << 8) | code[i + 1] as usize;
            i += 2;
            let _ = writeln!(
                out,
                "{:<16} {:5} '{}'",
                name,
                constant,
                vm.value_to_display(fn_obj.constants[constant])
            );
        }
        Op::End => {
            let _ = writeln!(out, "{}", name);
            return None;
        }
        _ => match op.args() {
            Args::None => {
                let _ = writeln!(out, "{}", name);
            }
            Args::Byte => {
                let arg = code[i] as usize;
                i += 1;
                let _ = writeln!(out, "{:<16} {:5}", name, arg);
            }
            Args::Short => {
                let symbol = ((code[i] as usize) << 8) | code[i + 1] as usize;
                i += 2;
                // Every remaining short-arg opcode carries a method symbol.
                let _ = writeln!(
                    out,
                    "{:<16} {:5} '{}'",
                    name,
                    symbol,
                    vm.method_names.name(symbol)
                );
            }
            Args::TwoShorts => {
                let symbol = ((code[i] as usize) << 8) | code[i + 1] as usize;
                let superclass = ((code[i + 2] as usize) << 8) | code[i + 3] as usize;
                i += 4;
                let _ = writeln!(
                    out,
                    "{:<16} {:5} '{}' {:5}",
                    name,
                    symbol,
                    vm.method_names.name(symbol),
                    superclass
                );
            }
            Args::Variable => {
                let _ = writeln!(out, "{}", name);
            }
        },
    }
    Some(i)
}

#[cfg(test)]
mod tests {
    use crate::vm::{Vm, VmConfig};

    #[test]
    fn test_recorded_lines_match_source() {
        let mut vm = Vm::new(VmConfig::default());
        let closure = vm
            .compile_in_module("main", "var a = 1\nvar b = 2")
            .expect("compiles");
        let function = vm.heap.closure(closure).function;

        // `var a = 1` emits IConstant + StoreModuleVar + Pop: seven bytes,
        // all recorded on line 1.
        let fn_obj = vm.heap.fn_obj(function);
        assert!(fn_obj.debug.lines[..7].iter().all(|&line| line == 1));
        assert!(fn_obj.debug.lines.contains(&2));

        let text = super::dump_code(&vm, function);
        assert!(text.starts_with("main: (script)"), "{}", text);
        assert!(text.contains("IConstant"), "{}", text);
        assert!(text.contains("StoreModuleVar"), "{}", text);
        // The line column prints once per line group.
        assert!(text.contains("   1:"), "{}", text);
        assert!(text.contains("   2:"), "{}", text);
    }

    #[test]
    fn test_dump_resolves_names() {
        let mut vm = Vm::new(VmConfig::default());
        let closure = vm
            .compile_in_module("main", "System.print(1)")
            .expect("compiles");
        let function = vm.heap.closure(closure).function;
        let text = super::dump_code(&vm, function);
        assert!(text.contains("'System'"), "{}", text);
        assert!(text.contains("'print(_)'"), "{}", text);
        assert!(text.trim_end().ends_with("End"), "{}", text);
    }

    #[test]
    fn test_dump_decodes_closures() {
        let source = "var f = Fn.new {\nvar inner = 1\nvar g = Fn.new { inner }\n}";
        let mut vm = Vm::new(VmConfig::default());
        let closure = vm.compile_in_module("main", source).expect("compiles");
        let function = vm.heap.closure(closure).function;
        let text = super::dump_code(&vm, function);
        assert!(text.contains("Closure"), "{}", text);
    }
}
