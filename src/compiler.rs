/// Bytecode Compiler
///
/// A single-pass recursive-descent parser with Pratt precedence for
/// expressions, emitting bytecode straight into the function under
/// construction; there is no AST. One `FnState` per function being
/// compiled, kept on a stack (innermost last) so upvalue resolution can
/// walk the enclosing functions.
///
/// Errors are accumulated and reported through the host callback as they
/// are found; a module that produced any error yields no function.

use std::rc::Rc;

use crate::bytecode::Op;
use crate::errors::ErrorKind;
use crate::heap::{FnDebug, FnObj};
use crate::lexer::{Lexer, Literal, Token, TokenKind};
use crate::value::{Handle, Value};
use crate::vm::Vm;

pub(crate) const MAX_LOCALS: usize = 256;
pub(crate) const MAX_UPVALUES: usize = 256;
pub(crate) const MAX_CONSTANTS: usize = 1 << 16;
pub(crate) const MAX_JUMP: usize = 0xffff;
pub(crate) const MAX_FIELDS: usize = 255;
pub(crate) const MAX_MODULE_VARS: usize = 1 << 16;
pub(crate) const MAX_PARAMETERS: usize = 16;
pub(crate) const MAX_VARIABLE_NAME: usize = 64;
pub(crate) const MAX_METHOD_NAME: usize = 64;

// ── Precedence ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Lowest,
    Assignment,   // =
    Conditional,  // ?:
    LogicalOr,    // ||
    LogicalAnd,   // &&
    Equality,     // == !=
    Is,           // is
    Comparison,   // < > <= >=
    BitwiseOr,    // |
    BitwiseXor,   // ^
    BitwiseAnd,   // &
    BitwiseShift, // << >>
    Range,        // .. ...
    Term,         // + -
    Factor,       // * / %
    Unary,        // - ! ~
    Call,         // . () []
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        const LADDER: [Precedence; 19] = [
            Precedence::None,
            Precedence::Lowest,
            Precedence::Assignment,
            Precedence::Conditional,
            Precedence::LogicalOr,
            Precedence::LogicalAnd,
            Precedence::Equality,
            Precedence::Is,
            Precedence::Comparison,
            Precedence::BitwiseOr,
            Precedence::BitwiseXor,
            Precedence::BitwiseAnd,
            Precedence::BitwiseShift,
            Precedence::Range,
            Precedence::Term,
            Precedence::Factor,
            Precedence::Unary,
            Precedence::Call,
            Precedence::Primary,
        ];
        LADDER[(self as usize + 1).min(LADDER.len() - 1)]
    }
}

// ── Signatures ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigKind {
    Method,
    Getter,
    Setter,
    Subscript,
    SubscriptSetter,
    Initializer,
}

/// A method's shape: its bare name plus how it is invoked. The printed form
/// is what gets interned in the VM-wide method symbol table.
#[derive(Debug, Clone)]
struct Signature {
    name: String,
    kind: SigKind,
    arity: usize,
}

impl Signature {
    fn full_name(&self) -> String {
        fn params(count: usize) -> String {
            vec!["_"; count].join(",")
        }
        match self.kind {
            SigKind::Getter => self.name.clone(),
            SigKind::Method => format!("{}({})", self.name, params(self.arity)),
            SigKind::Setter => format!("{}=(_)", self.name),
            SigKind::Subscript => format!("[{}]", params(self.arity)),
            SigKind::SubscriptSetter => format!("[{}]=(_)", params(self.arity - 1)),
            SigKind::Initializer => format!("init {}({})", self.name, params(self.arity)),
        }
    }
}

// ── Compiler state ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth at declaration; -1 for the implicit receiver slot.
    depth: i32,
    /// Set when a nested function closes over this local, so scope exit
    /// emits CloseUpvalue instead of Pop.
    is_upvalue: bool,
}

#[derive(Debug, Clone, Copy)]
struct CompilerUpvalue {
    is_local: bool,
    index: usize,
}

#[derive(Debug)]
struct LoopInfo {
    /// Bytecode offset the loop jumps back to.
    start: usize,
    /// Offset of the exit jump's placeholder operand.
    exit_jump: usize,
    scope_depth: i32,
    /// Placeholders for break jumps, patched at loop end.
    breaks: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Local,
    Upvalue,
    Module,
}

#[derive(Debug, Clone, Copy)]
struct Variable {
    index: usize,
    scope: Scope,
}

/// Per-function compilation state.
struct FnState {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<u32>,
    locals: Vec<Local>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
    /// Current and high-water stack usage, locals included.
    slots: i32,
    max_slots: i32,
    loops: Vec<LoopInfo>,
    /// Index into the class stack of the class lexically containing this
    /// function, if any.
    enclosing_class: Option<usize>,
    /// Set when this function is a method body compiled directly in that
    /// class (enables the FieldThis fast opcodes).
    direct_method_class: Option<usize>,
    is_initializer: bool,
    arity: usize,
}

/// Book-keeping for a class body being compiled.
struct ClassInfo {
    name: String,
    class_variable: Variable,
    is_foreign: bool,
    in_static: bool,
    /// Field names declared by this class, in slot order (before the
    /// inherited offset applied at method-bind time).
    fields: Vec<String>,
    methods: Vec<usize>,
    static_methods: Vec<usize>,
    /// FnState index whose code the class definition executes in.
    owner_state: usize,
    /// Signature of the method currently being compiled, for bare `super`.
    signature: Option<Signature>,
    runtime_attributes: Vec<(String, Value)>,
}

pub struct Compiler<'a> {
    vm: &'a mut Vm,
    module: Handle,
    module_name: String,
    lexer: Lexer<'a>,
    previous: Token,
    current: Token,
    next: Token,
    has_error: bool,
    states: Vec<FnState>,
    classes: Vec<ClassInfo>,
    /// Module variables implicitly declared by a forward reference; each
    /// must be defined by module end.
    implicit_module_vars: Vec<(usize, u32, String)>,
    /// `#!` attributes waiting for the class they precede.
    pending_runtime_attributes: Vec<(String, Value)>,
}

/// Compiles `source` as the body of `module`, returning the module function
/// or None after reporting compile errors through the host callback.
pub(crate) fn compile(vm: &mut Vm, module: Handle, source: &str) -> Option<Handle> {
    vm.heap.pause_gc();
    let result = {
        let module_name = vm.heap.module(module).name.clone().unwrap_or_default();
        let mut lexer = Lexer::new(source);
        let first = lexer.next_token();
        let second = lexer.next_token();
        let mut compiler = Compiler {
            vm,
            module,
            module_name,
            lexer,
            previous: Token { kind: TokenKind::Eof, start: 0, length: 0, line: 1, value: None },
            current: first,
            next: second,
            has_error: false,
            states: Vec::new(),
            classes: Vec::new(),
            implicit_module_vars: Vec::new(),
            pending_runtime_attributes: Vec::new(),
        };
        compiler.drain_lex_errors();
        compiler.compile_module()
    };
    vm.heap.resume_gc();
    result
}

impl<'a> Compiler<'a> {
    // ── Token stream ─────────────────────────────────────────────────────────

    fn drain_lex_errors(&mut self) {
        let errors: Vec<_> = self.lexer.errors.drain(..).collect();
        for e in errors {
            self.report(e.line, &format!("Error: {}", e.message));
        }
    }

    fn next_token(&mut self) {
        self.previous = std::mem::replace(
            &mut self.current,
            std::mem::replace(&mut self.next, self.lexer.next_token()),
        );
        self.drain_lex_errors();
    }

    fn peek(&self) -> TokenKind {
        self.current.kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.peek() != kind {
            return false;
        }
        self.next_token();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        self.next_token();
        if self.previous.kind != kind {
            self.error(message);
        }
    }

    /// Consumes at least one newline token.
    fn match_line(&mut self) -> bool {
        if !self.match_token(TokenKind::Line) {
            return false;
        }
        while self.match_token(TokenKind::Line) {}
        true
    }

    fn ignore_newlines(&mut self) {
        self.match_line();
    }

    fn consume_line(&mut self, message: &str) {
        self.consume(TokenKind::Line, message);
        self.ignore_newlines();
    }

    // ── Error reporting ──────────────────────────────────────────────────────

    fn report(&mut self, line: u32, message: &str) {
        self.has_error = true;
        let module_name = self.module_name.clone();
        self.vm
            .report_error(ErrorKind::Compile, Some(&module_name), line as i32, message);
    }

    fn error_at(&mut self, token_kind: TokenKind, text: String, line: u32, message: &str) {
        let label = match token_kind {
            TokenKind::Line => "Error at newline".to_string(),
            TokenKind::Eof => "Error at end of file".to_string(),
            TokenKind::Error => "Error".to_string(),
            _ => format!("Error at '{}'", text),
        };
        self.report(line, &format!("{}: {}", label, message));
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        let text = token.text(self.lexer.source()).to_string();
        self.error_at(token.kind, text, token.line, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        let text = token.text(self.lexer.source()).to_string();
        self.error_at(token.kind, text, token.line, message);
    }

    // ── Function-state plumbing ──────────────────────────────────────────────

    fn st(&mut self) -> &mut FnState {
        match self.states.last_mut() {
            Some(state) => state,
            None => unreachable!("no function state"),
        }
    }

    fn st_ref(&self) -> &FnState {
        match self.states.last() {
            Some(state) => state,
            None => unreachable!("no function state"),
        }
    }

    /// Begins compiling a new function nested in the current one.
    fn begin_state(&mut self, is_method: bool) {
        let enclosing_class =
            if self.classes.is_empty() { None } else { Some(self.classes.len() - 1) };
        let mut locals = Vec::new();
        // Slot zero holds the method receiver, or stays unnamed for plain
        // function bodies.
        locals.push(Local {
            name: if is_method { "this".to_string() } else { String::new() },
            depth: -1,
            is_upvalue: false,
        });
        self.states.push(FnState {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            slots: 1,
            max_slots: 1,
            loops: Vec::new(),
            enclosing_class,
            direct_method_class: if is_method { enclosing_class } else { None },
            is_initializer: false,
            arity: 0,
        });
    }

    /// Finishes the innermost function: allocates its Fn object and, when
    /// nested, emits the Closure instruction in the enclosing function.
    fn end_state(&mut self, debug_name: &str) -> Option<Handle> {
        if self.has_error {
            self.states.pop();
            return None;
        }
        self.emit_op(Op::End);
        let state = match self.states.pop() {
            Some(state) => state,
            None => unreachable!("no function state"),
        };
        let function = FnObj {
            code: Rc::new(state.code),
            constants: state.constants,
            module: self.module,
            arity: state.arity,
            max_slots: state.max_slots.max(1) as usize,
            num_upvalues: state.upvalues.len(),
            debug: FnDebug { name: debug_name.to_string(), lines: state.lines },
        };
        let fn_class = self.vm.core.fn_class;
        let handle = self
            .vm
            .alloc(Some(fn_class), crate::heap::ObjData::Fn(function));

        if !self.states.is_empty() {
            let constant = self.add_constant(Value::obj(handle));
            self.emit_short_arg(Op::Closure, constant as u16);
            for upvalue in state.upvalues {
                self.emit_raw_byte(if upvalue.is_local { 1 } else { 0 });
                self.emit_raw_byte(upvalue.index as u8);
            }
        }
        Some(handle)
    }

    /// Discards the innermost function state (foreign method signatures
    /// parse parameters but have no body).
    fn abandon_state(&mut self) {
        self.states.pop();
    }

    // ── Emission ─────────────────────────────────────────────────────────────

    fn emit_raw_byte(&mut self, byte: u8) -> usize {
        let line = self.previous.line;
        let state = self.st();
        state.code.push(byte);
        state.lines.push(line);
        state.code.len() - 1
    }

    fn emit_op(&mut self, op: Op) -> usize {
        let offset = self.emit_raw_byte(op as u8);
        let state = self.st();
        state.slots += op.stack_effect();
        if state.slots > state.max_slots {
            state.max_slots = state.slots;
        }
        offset
    }

    fn emit_byte_arg(&mut self, op: Op, arg: u8) -> usize {
        self.emit_op(op);
        self.emit_raw_byte(arg)
    }

    fn emit_short(&mut self, arg: u16) -> usize {
        let offset = self.emit_raw_byte((arg >> 8) as u8);
        self.emit_raw_byte(arg as u8);
        offset
    }

    fn emit_short_arg(&mut self, op: Op, arg: u16) -> usize {
        self.emit_op(op);
        self.emit_short(arg)
    }

    /// Emits a forward jump with a placeholder offset, returning the
    /// placeholder's position for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_short(0xffff)
    }

    fn patch_jump(&mut self, placeholder: usize) {
        let state = self.st();
        let offset = state.code.len() - (placeholder + 2);
        if offset > MAX_JUMP {
            self.error("Too much code to jump over.");
            return;
        }
        let state = self.st();
        state.code[placeholder] = (offset >> 8) as u8;
        state.code[placeholder + 1] = offset as u8;
    }

    fn add_constant(&mut self, value: Value) -> usize {
        // Reuse an existing equal constant when there is one.
        for (i, &existing) in self.st_ref().constants.iter().enumerate() {
            if self.vm.heap.values_equal(existing, value) {
                return i;
            }
        }
        if self.st_ref().constants.len() >= MAX_CONSTANTS {
            self.error("A function may only contain 65536 unique constants.");
            return 0;
        }
        let state = self.st();
        state.constants.push(value);
        state.constants.len() - 1
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.add_constant(value);
        self.emit_short_arg(Op::Constant, constant as u16);
    }

    // ── Scopes and variables ─────────────────────────────────────────────────

    fn push_scope(&mut self) {
        self.st().scope_depth += 1;
    }

    /// Emits code to discard locals at `depth` or deeper without forgetting
    /// them; used for break/continue which jump out of scopes that stay
    /// syntactically open.
    fn discard_locals(&mut self, depth: i32) -> usize {
        let mut discarded = 0;
        let count = self.st_ref().locals.len();
        for i in (0..count).rev() {
            if self.st_ref().locals[i].depth < depth {
                break;
            }
            // Captured locals move their value into the upvalue; plain ones
            // just pop.
            let op = if self.st_ref().locals[i].is_upvalue {
                Op::CloseUpvalue
            } else {
                Op::Pop
            };
            // Raw byte: this can run inside branches, where the statically
            // tracked stack height already accounts for the values.
            self.emit_raw_byte(op as u8);
            discarded += 1;
        }
        discarded
    }

    fn pop_scope(&mut self) {
        let depth = self.st_ref().scope_depth;
        let discarded = self.discard_locals(depth);
        let state = self.st();
        state.locals.truncate(state.locals.len() - discarded);
        state.slots -= discarded as i32;
        state.scope_depth -= 1;
    }

    fn add_local(&mut self, name: &str) -> usize {
        let state = self.st();
        state.locals.push(Local {
            name: name.to_string(),
            depth: state.scope_depth,
            is_upvalue: false,
        });
        state.locals.len() - 1
    }

    /// Declares a variable named by `token` (or the just-consumed token) in
    /// the current scope, returning its slot or symbol.
    fn declare_variable(&mut self, token: Option<Token>) -> usize {
        let token = token.unwrap_or_else(|| self.previous.clone());
        let name = token.text(self.lexer.source()).to_string();
        if name.len() > MAX_VARIABLE_NAME {
            self.error("Variable name cannot be longer than 64 characters.");
        }

        if self.st_ref().scope_depth == -1 {
            return self.define_module_variable(&name, token.line);
        }

        // Duplicate check within the innermost scope only; shadowing outer
        // scopes is allowed.
        let depth = self.st_ref().scope_depth;
        for i in (0..self.st_ref().locals.len()).rev() {
            if self.st_ref().locals[i].depth < depth {
                break;
            }
            if self.st_ref().locals[i].name == name {
                self.error("Variable is already declared in this scope.");
                return i;
            }
        }

        if self.st_ref().locals.len() >= MAX_LOCALS {
            self.error("Cannot declare more than 256 variables in one scope.");
            return 0;
        }
        self.add_local(&name)
    }

    fn declare_named_variable(&mut self) -> usize {
        self.consume(TokenKind::Name, "Expect variable name.");
        self.declare_variable(None)
    }

    /// Module-scope declaration, honoring forward references: an implicit
    /// slot holding its first-use line may already exist.
    fn define_module_variable(&mut self, name: &str, _line: u32) -> usize {
        let module = self.vm.heap.module_mut(self.module);
        match module.variable_names.find(name) {
            Some(symbol) => {
                let implicit = self
                    .implicit_module_vars
                    .iter()
                    .position(|&(s, _, _)| s == symbol);
                match implicit {
                    Some(position) => {
                        // A forward reference becomes a real definition.
                        self.implicit_module_vars.remove(position);
                        self.vm.heap.module_mut(self.module).variables[symbol] = Value::NULL;
                        symbol
                    }
                    None => {
                        self.error("Module variable is already defined.");
                        symbol
                    }
                }
            }
            None => {
                if module.variable_names.len() >= MAX_MODULE_VARS {
                    self.error("Too many module variables defined.");
                    return 0;
                }
                let symbol = module.variable_names.add(name);
                module.variables.push(Value::NULL);
                symbol
            }
        }
    }

    /// Emits the store for a just-declared variable. Locals simply keep
    /// their slot; module variables store and discard.
    fn define_variable(&mut self, symbol: usize) {
        if self.st_ref().scope_depth >= 0 {
            return;
        }
        self.emit_short_arg(Op::StoreModuleVar, symbol as u16);
        self.emit_op(Op::Pop);
    }

    fn resolve_local(&self, state: usize, name: &str) -> Option<usize> {
        self.states[state]
            .locals
            .iter()
            .rposition(|local| local.name == name)
    }

    fn add_upvalue(&mut self, state: usize, is_local: bool, index: usize) -> usize {
        for (i, upvalue) in self.states[state].upvalues.iter().enumerate() {
            if upvalue.is_local == is_local && upvalue.index == index {
                return i;
            }
        }
        if self.states[state].upvalues.len() >= MAX_UPVALUES {
            self.error("A function cannot close over more than 256 variables.");
            return 0;
        }
        self.states[state]
            .upvalues
            .push(CompilerUpvalue { is_local, index });
        self.states[state].upvalues.len() - 1
    }

    /// Resolves `name` as an upvalue of `state`, walking the enclosing
    /// function chain and threading capture records through every level.
    fn find_upvalue(&mut self, state: usize, name: &str) -> Option<usize> {
        if state == 0 {
            return None;
        }
        let parent = state - 1;
        if let Some(local) = self.resolve_local(parent, name) {
            self.states[parent].locals[local].is_upvalue = true;
            return Some(self.add_upvalue(state, true, local));
        }
        if let Some(upvalue) = self.find_upvalue(parent, name) {
            return Some(self.add_upvalue(state, false, upvalue));
        }
        None
    }

    fn resolve_non_module(&mut self, name: &str) -> Option<Variable> {
        let state = self.states.len() - 1;
        if let Some(index) = self.resolve_local(state, name) {
            return Some(Variable { index, scope: Scope::Local });
        }
        self.find_upvalue(state, name)
            .map(|index| Variable { index, scope: Scope::Upvalue })
    }

    fn load_variable(&mut self, variable: Variable) {
        match variable.scope {
            Scope::Local => match Op::load_local(variable.index) {
                Some(op) => {
                    self.emit_op(op);
                }
                None => {
                    self.emit_byte_arg(Op::LoadLocal, variable.index as u8);
                }
            },
            Scope::Upvalue => {
                self.emit_byte_arg(Op::LoadUpvalue, variable.index as u8);
            }
            Scope::Module => {
                self.emit_short_arg(Op::LoadModuleVar, variable.index as u16);
            }
        }
    }

    fn load_core_variable(&mut self, name: &str) {
        match self.vm.heap.module(self.module).variable_names.find(name) {
            Some(symbol) => {
                self.emit_short_arg(Op::LoadModuleVar, symbol as u16);
            }
            None => unreachable!("core variable '{}' missing", name),
        }
    }

    fn load_this(&mut self) {
        match self.resolve_non_module("this") {
            Some(variable) => self.load_variable(variable),
            None => self.error("Cannot use 'this' outside of a method."),
        }
    }

    // ── Method calls ─────────────────────────────────────────────────────────

    fn signature_symbol(&mut self, signature: &Signature) -> usize {
        let full = signature.full_name();
        let symbol = self.vm.method_names.ensure(&full);
        if symbol >= 1 << 16 {
            self.error("Too many methods defined.");
        }
        symbol
    }

    /// Emits the call (or super call) for a fully parsed signature.
    fn call_signature(&mut self, is_super: bool, signature: &Signature) {
        let symbol = self.signature_symbol(signature);
        let op = if is_super {
            Op::super_(signature.arity)
        } else {
            Op::call(signature.arity)
        };
        self.emit_short_arg(op, symbol as u16);
        if is_super {
            // A fresh placeholder constant, never shared: method binding
            // overwrites it with the superclass.
            if self.st_ref().constants.len() >= MAX_CONSTANTS {
                self.error("A function may only contain 65536 unique constants.");
            }
            self.st().constants.push(Value::NULL);
            let constant = self.st_ref().constants.len() - 1;
            self.emit_short(constant as u16);
        }
    }

    fn call_method_name(&mut self, arity: usize, full_name: &str) {
        let symbol = self.vm.method_names.ensure(full_name);
        self.emit_short_arg(Op::call(arity), symbol as u16);
    }

    fn validate_num_parameters(&mut self, count: usize) {
        if count == MAX_PARAMETERS + 1 {
            self.error("Methods cannot have more than 16 parameters.");
        }
    }

    fn finish_argument_list(&mut self, signature: &mut Signature) {
        loop {
            self.ignore_newlines();
            signature.arity += 1;
            self.validate_num_parameters(signature.arity);
            self.expression();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        // Allow a newline before the closing delimiter.
        self.ignore_newlines();
    }

    fn finish_parameter_list(&mut self, signature: &mut Signature) {
        loop {
            self.ignore_newlines();
            signature.arity += 1;
            self.validate_num_parameters(signature.arity);
            self.declare_named_variable();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    /// Compiles an optional argument list and block argument, then emits the
    /// call. `base` carries the method name and, for bare super calls inside
    /// constructors, the initializer kind.
    fn method_call(&mut self, is_super: bool, base: &Signature) {
        let mut called =
            Signature { name: base.name.clone(), kind: SigKind::Getter, arity: 0 };

        if self.match_token(TokenKind::LeftParen) {
            called.kind = SigKind::Method;
            self.ignore_newlines();
            if self.peek() != TokenKind::RightParen {
                self.finish_argument_list(&mut called);
            }
            self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        }

        if self.match_token(TokenKind::LeftBrace) {
            // A block argument becomes one more (function) argument.
            called.kind = SigKind::Method;
            called.arity += 1;

            self.begin_state(false);
            let mut block_signature =
                Signature { name: String::new(), kind: SigKind::Method, arity: 0 };
            if self.match_token(TokenKind::Pipe) {
                self.finish_parameter_list(&mut block_signature);
                self.consume(TokenKind::Pipe, "Expect '|' after function parameters.");
            }
            self.st().arity = block_signature.arity;
            self.finish_body();
            let name = format!("{} block argument", called.full_name());
            self.end_state(&name);
        }

        if base.kind == SigKind::Initializer {
            if called.kind != SigKind::Method {
                self.error("A superclass constructor must have an argument list.");
            }
            called.kind = SigKind::Initializer;
        }

        self.call_signature(is_super, &called);
    }

    /// Compiles a `.name` access: getter, method call, or setter.
    fn named_call(&mut self, can_assign: bool, is_super: bool) {
        let base = self.signature_from_token(SigKind::Getter);

        if can_assign && self.match_token(TokenKind::Eq) {
            let mut setter =
                Signature { name: base.name.clone(), kind: SigKind::Setter, arity: 1 };
            self.ignore_newlines();
            self.expression();
            setter.kind = SigKind::Setter;
            self.call_signature(is_super, &setter);
        } else {
            self.method_call(is_super, &base);
        }
    }

    fn signature_from_token(&mut self, kind: SigKind) -> Signature {
        let name = self.previous.text(self.lexer.source()).to_string();
        if name.len() > MAX_METHOD_NAME {
            self.error("Method names cannot be longer than 64 characters.");
        }
        Signature { name, kind, arity: 0 }
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Lowest);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.next_token();
        let kind = self.previous.kind;
        let can_assign = precedence <= Precedence::Conditional;
        if !self.prefix_rule(kind, can_assign) {
            self.error("Expected expression.");
            return;
        }
        while precedence <= infix_precedence(self.peek()) {
            self.next_token();
            let kind = self.previous.kind;
            self.infix_rule(kind, can_assign);
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => {
                self.expression();
                self.consume(TokenKind::RightParen, "Expect ')' after expression.");
            }
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::LeftBrace => self.map_literal(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde => self.unary_op(),
            TokenKind::Name => self.name(can_assign),
            TokenKind::Field => self.field(can_assign),
            TokenKind::StaticField => self.static_field(can_assign),
            TokenKind::Number | TokenKind::String => self.literal(),
            TokenKind::Interpolation => self.string_interpolation(),
            TokenKind::Null => {
                self.emit_op(Op::Null);
            }
            TokenKind::False => {
                self.emit_op(Op::False);
            }
            TokenKind::True => {
                self.emit_op(Op::True);
            }
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(can_assign),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Dot => {
                self.consume(TokenKind::Name, "Expect method name after '.'.");
                self.named_call(can_assign, false);
            }
            TokenKind::LeftBracket => self.subscript(can_assign),
            TokenKind::Question => self.conditional(),
            TokenKind::AmpAmp => self.and_expr(),
            TokenKind::PipePipe => self.or_expr(),
            _ => self.infix_op(kind),
        }
    }

    /// Binary operators compile the right operand one precedence level
    /// higher (left associative), then invoke the operator method. The five
    /// arithmetic operators get their specialized opcodes, carrying the
    /// method symbol as the non-number fallback.
    fn infix_op(&mut self, kind: TokenKind) {
        let (name, precedence) = match infix_operator(kind) {
            Some(entry) => entry,
            None => unreachable!("not an infix operator"),
        };
        self.ignore_newlines();
        self.parse_precedence(precedence.one_higher());

        let signature =
            Signature { name: name.to_string(), kind: SigKind::Method, arity: 1 };
        let arithmetic = match kind {
            TokenKind::Plus => Some(Op::Add),
            TokenKind::Minus => Some(Op::Sub),
            TokenKind::Star => Some(Op::Mul),
            TokenKind::Slash => Some(Op::Div),
            TokenKind::Percent => Some(Op::Mod),
            _ => None,
        };
        match arithmetic {
            Some(op) => {
                let symbol = self.signature_symbol(&signature);
                self.emit_short_arg(op, symbol as u16);
            }
            None => self.call_signature(false, &signature),
        }
    }

    fn unary_op(&mut self) {
        let name = self.previous.text(self.lexer.source()).to_string();
        self.ignore_newlines();
        // The operand binds tighter than the operator so -a.b parses as
        // -(a.b).
        self.parse_precedence(Precedence::Unary.one_higher());
        self.call_method_name(0, &name);
    }

    fn and_expr(&mut self) {
        self.ignore_newlines();
        let jump = self.emit_jump(Op::And);
        self.parse_precedence(Precedence::LogicalAnd);
        self.patch_jump(jump);
    }

    fn or_expr(&mut self) {
        self.ignore_newlines();
        let jump = self.emit_jump(Op::Or);
        self.parse_precedence(Precedence::LogicalOr);
        self.patch_jump(jump);
    }

    fn conditional(&mut self) {
        self.ignore_newlines();
        let if_jump = self.emit_jump(Op::JumpIf);
        self.parse_precedence(Precedence::Conditional);
        self.ignore_newlines();
        self.consume(
            TokenKind::Colon,
            "Expect ':' after then branch of conditional operator.",
        );
        self.ignore_newlines();
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(if_jump);
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(else_jump);
    }

    fn subscript(&mut self, can_assign: bool) {
        let mut signature =
            Signature { name: String::new(), kind: SigKind::Subscript, arity: 0 };
        self.finish_argument_list(&mut signature);
        self.consume(TokenKind::RightBracket, "Expect ']' after arguments.");

        if can_assign && self.match_token(TokenKind::Eq) {
            signature.kind = SigKind::SubscriptSetter;
            signature.arity += 1;
            self.validate_num_parameters(signature.arity);
            self.expression();
        }
        self.call_signature(false, &signature);
    }

    fn list_literal(&mut self) {
        self.load_core_variable("List");
        self.call_method_name(0, "new()");
        loop {
            self.ignore_newlines();
            if self.peek() == TokenKind::RightBracket {
                break;
            }
            self.expression();
            self.call_method_name(1, "addCore_(_)");
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.ignore_newlines();
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
    }

    fn map_literal(&mut self) {
        self.load_core_variable("Map");
        self.call_method_name(0, "new()");
        loop {
            self.ignore_newlines();
            if self.peek() == TokenKind::RightBrace {
                break;
            }
            // Keys bind tightly so `a: b` never parses `a: b` as one
            // expression.
            self.parse_precedence(Precedence::Unary);
            self.consume(TokenKind::Colon, "Expect ':' after map key.");
            self.ignore_newlines();
            self.expression();
            self.call_method_name(2, "addCore_(_,_)");
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.ignore_newlines();
        self.consume(TokenKind::RightBrace, "Expect '}' after map entries.");
    }

    fn literal(&mut self) {
        match self.previous.value.clone() {
            Some(Literal::Num(n)) => {
                // Small whole numbers ride in the instruction itself.
                if n >= 0.0 && n <= 65535.0 && n.fract() == 0.0 {
                    self.emit_short_arg(Op::IConstant, n as u16);
                } else {
                    self.emit_constant(Value::num(n));
                }
            }
            Some(Literal::Str(bytes)) => {
                let string = self.vm.new_string(bytes);
                self.emit_constant(Value::obj(string));
            }
            None => unreachable!("literal token without value"),
        }
    }

    /// An interpolated string compiles to string concatenation: each
    /// expression part is converted with toString and appended with +.
    fn string_interpolation(&mut self) {
        self.literal();
        loop {
            self.ignore_newlines();
            self.expression();
            self.call_method_name(0, "toString");
            self.call_method_name(1, "+(_)");
            self.ignore_newlines();
            if !self.match_token(TokenKind::Interpolation) {
                break;
            }
            self.literal();
            self.call_method_name(1, "+(_)");
        }
        self.consume(TokenKind::String, "Expect end of string interpolation.");
        self.literal();
        self.call_method_name(1, "+(_)");
    }

    /// Loads or assigns the named variable or, inside a method, falls back
    /// to an implicit call on `this` for lowercase names.
    fn name(&mut self, can_assign: bool) {
        let token = self.previous.clone();
        let name = token.text(self.lexer.source()).to_string();

        if let Some(variable) = self.resolve_non_module(&name) {
            self.bare_name(can_assign, variable);
            return;
        }

        if is_local_name(&name) && !self.classes.is_empty() {
            self.load_this();
            self.named_call(can_assign, false);
            return;
        }

        let symbol = match self.vm.heap.module(self.module).variable_names.find(&name) {
            Some(symbol) => symbol,
            None => {
                // Hope for a definition later in the module; the slot holds
                // the first-use line until then.
                let module = self.vm.heap.module_mut(self.module);
                if module.variable_names.len() >= MAX_MODULE_VARS {
                    self.error("Too many module variables defined.");
                    return;
                }
                let symbol = module.variable_names.add(&name);
                module.variables.push(Value::num(token.line as f64));
                self.implicit_module_vars.push((symbol, token.line, name.clone()));
                symbol
            }
        };
        self.bare_name(can_assign, Variable { index: symbol, scope: Scope::Module });
    }

    fn bare_name(&mut self, can_assign: bool, variable: Variable) {
        if can_assign && self.match_token(TokenKind::Eq) {
            self.expression();
            match variable.scope {
                Scope::Local => {
                    self.emit_byte_arg(Op::StoreLocal, variable.index as u8);
                }
                Scope::Upvalue => {
                    self.emit_byte_arg(Op::StoreUpvalue, variable.index as u8);
                }
                Scope::Module => {
                    self.emit_short_arg(Op::StoreModuleVar, variable.index as u16);
                }
            }
            return;
        }
        self.load_variable(variable);
    }

    fn field(&mut self, can_assign: bool) {
        let name = self.previous.text(self.lexer.source()).to_string();

        enum FieldCheck {
            NoClass,
            Foreign,
            Static,
            Slot(usize),
        }
        let check = match self.classes.last_mut() {
            None => FieldCheck::NoClass,
            Some(class) if class.is_foreign => FieldCheck::Foreign,
            Some(class) if class.in_static => FieldCheck::Static,
            Some(class) => {
                // Referencing a field implicitly declares it.
                let slot = match class.fields.iter().position(|f| f == &name) {
                    Some(index) => index,
                    None => {
                        class.fields.push(name.clone());
                        class.fields.len() - 1
                    }
                };
                FieldCheck::Slot(slot)
            }
        };
        let mut field = MAX_FIELDS;
        match check {
            FieldCheck::NoClass => {
                self.error("Cannot reference a field outside of a class definition.")
            }
            FieldCheck::Foreign => self.error("Cannot define fields in a foreign class."),
            FieldCheck::Static => {
                self.error("Cannot use an instance field in a static method.")
            }
            FieldCheck::Slot(slot) => {
                field = slot;
                if field >= MAX_FIELDS {
                    self.error("A class can only have 255 fields.");
                }
            }
        }

        let mut is_load = true;
        if can_assign && self.match_token(TokenKind::Eq) {
            self.expression();
            is_load = false;
        }

        let in_direct_method = self.st_ref().direct_method_class.is_some()
            && self.st_ref().direct_method_class == self.classes.len().checked_sub(1);
        if in_direct_method {
            let op = if is_load { Op::LoadFieldThis } else { Op::StoreFieldThis };
            self.emit_byte_arg(op, field as u8);
        } else {
            self.load_this();
            let op = if is_load { Op::LoadField } else { Op::StoreField };
            self.emit_byte_arg(op, field as u8);
        }
    }

    /// A `__name` reference: a variable scoped to the class body, shared by
    /// all methods of the class through upvalue capture.
    fn static_field(&mut self, can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot use a static field outside of a class definition.");
            return;
        }
        let owner_state = self.classes[self.classes.len() - 1].owner_state;
        let name = self.previous.text(self.lexer.source()).to_string();
        let known = self.resolve_local(owner_state, &name).is_some();

        if !known {
            // First mention: declare it in the scope surrounding the class
            // definition, initialized to null.
            let line = self.previous.line;
            let state = &mut self.states[owner_state];
            state.code.push(Op::Null as u8);
            state.lines.push(line);
            state.slots += 1;
            if state.slots > state.max_slots {
                state.max_slots = state.slots;
            }
            state.locals.push(Local {
                name: name.clone(),
                depth: state.scope_depth,
                is_upvalue: false,
            });
        }

        match self.resolve_non_module(&name) {
            Some(variable) => self.bare_name(can_assign, variable),
            None => unreachable!("static field just declared"),
        }
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Cannot use 'this' outside of a method.");
            return;
        }
        self.load_this();
    }

    fn super_expr(&mut self, can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot use 'super' outside of a method.");
            return;
        }
        let enclosing_signature = self.classes[self.classes.len() - 1].signature.clone();
        self.load_this();
        if self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Name, "Expect method name after 'super.'.");
            self.named_call(can_assign, true);
        } else {
            // A bare super call invokes the same-named superclass method.
            match enclosing_signature {
                Some(signature) => self.method_call(true, &signature),
                None => self.error("Cannot use 'super' in a static-field initializer."),
            }
        }
    }

    // ── Statements ───────────────────────────────────────────────────────────

    fn definition(&mut self) {
        while self.match_token(TokenKind::Hash) {
            self.attribute_line();
        }

        if self.match_token(TokenKind::Class) {
            self.class_definition(false);
            return;
        }
        if self.match_token(TokenKind::Foreign) {
            self.consume(TokenKind::Class, "Expect 'class' after 'foreign'.");
            self.class_definition(true);
            return;
        }
        if !self.pending_runtime_attributes.is_empty() {
            self.error("Attributes can only be applied to a class or a method.");
            self.pending_runtime_attributes.clear();
        }
        if self.match_token(TokenKind::Import) {
            self.import_statement();
            return;
        }
        if self.match_token(TokenKind::Var) {
            self.variable_definition();
            return;
        }
        self.statement();
    }

    fn attribute_line(&mut self) {
        let runtime = self.match_token(TokenKind::Bang);
        self.consume(TokenKind::Name, "Expect an attribute name.");
        let key = self.previous.text(self.lexer.source()).to_string();
        let value = if self.match_token(TokenKind::Eq) {
            self.attribute_value()
        } else {
            Value::NULL
        };
        self.consume_line("Expect newline after attribute.");
        if runtime {
            self.pending_runtime_attributes.push((key, value));
        }
    }

    fn attribute_value(&mut self) -> Value {
        self.next_token();
        match self.previous.kind {
            TokenKind::Number => match self.previous.value.clone() {
                Some(Literal::Num(n)) => Value::num(n),
                _ => Value::NULL,
            },
            TokenKind::String => match self.previous.value.clone() {
                Some(Literal::Str(bytes)) => {
                    let string = self.vm.new_string(bytes);
                    Value::obj(string)
                }
                _ => Value::NULL,
            },
            TokenKind::Name => {
                let text = self.previous.text(self.lexer.source()).to_string();
                self.vm.string_value(&text)
            }
            TokenKind::True => Value::TRUE,
            TokenKind::False => Value::FALSE,
            TokenKind::Null => Value::NULL,
            _ => {
                self.error("Expect an attribute value.");
                Value::NULL
            }
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.push_scope();
            if self.finish_block() {
                // Block was an expression body: discard its value.
                self.emit_op(Op::Pop);
            }
            self.pop_scope();
        } else {
            self.expression();
            self.emit_op(Op::Pop);
        }
    }

    /// Parses a curly block. Returns true when the block was a single
    /// expression whose value is left on the stack.
    fn finish_block(&mut self) -> bool {
        if self.match_token(TokenKind::RightBrace) {
            return false;
        }
        if !self.match_line() {
            // No newline after the "{": a statement keyword still makes it
            // a statement body, anything else is an expression body.
            if starts_statement(self.peek()) {
                while self.peek() != TokenKind::RightBrace && self.peek() != TokenKind::Eof {
                    self.definition();
                    self.match_line();
                    if self.has_error {
                        break;
                    }
                }
                self.consume(TokenKind::RightBrace, "Expect '}' at end of block.");
                return false;
            }
            self.expression();
            self.consume(TokenKind::RightBrace, "Expect '}' at end of block.");
            return true;
        }
        if self.match_token(TokenKind::RightBrace) {
            return false;
        }
        loop {
            self.definition();
            self.consume_line("Expect newline after statement.");
            if self.peek() == TokenKind::RightBrace || self.peek() == TokenKind::Eof {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' at end of block.");
        false
    }

    /// Method and function bodies return their final expression, this for
    /// initializers, and null otherwise.
    fn finish_body(&mut self) {
        let is_expression_body = self.finish_block();
        let is_initializer = self.st_ref().is_initializer;
        if is_initializer {
            if is_expression_body {
                self.emit_op(Op::Pop);
            }
            self.emit_op(Op::LoadLocal0);
        } else if !is_expression_body {
            self.emit_op(Op::Null);
        }
        self.emit_op(Op::Return);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.ignore_newlines();
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after if condition.");

        let if_jump = self.emit_jump(Op::JumpIf);
        self.statement();
        if self.match_token(TokenKind::Else) {
            let else_jump = self.emit_jump(Op::Jump);
            self.patch_jump(if_jump);
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(if_jump);
        }
    }

    fn start_loop(&mut self) {
        let start = self.st_ref().code.len();
        let scope_depth = self.st_ref().scope_depth;
        self.st().loops.push(LoopInfo { start, exit_jump: 0, scope_depth, breaks: Vec::new() });
    }

    fn test_exit_loop(&mut self) {
        let exit_jump = self.emit_jump(Op::JumpIf);
        match self.st().loops.last_mut() {
            Some(loop_info) => loop_info.exit_jump = exit_jump,
            None => unreachable!("no open loop"),
        }
    }

    fn end_loop(&mut self) {
        let start = match self.st_ref().loops.last() {
            Some(loop_info) => loop_info.start,
            None => unreachable!("no open loop"),
        };
        // The Loop operand is a backward offset from the ip after the
        // instruction.
        let offset = self.st_ref().code.len() + 3 - start;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_short_arg(Op::Loop, offset as u16);

        let loop_info = match self.st().loops.pop() {
            Some(loop_info) => loop_info,
            None => unreachable!("no open loop"),
        };
        self.patch_jump(loop_info.exit_jump);
        for placeholder in loop_info.breaks {
            self.patch_jump(placeholder);
        }
    }

    fn while_statement(&mut self) {
        self.start_loop();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.ignore_newlines();
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after while condition.");
        self.test_exit_loop();
        self.statement();
        self.end_loop();
    }

    /// `for (item in sequence)` desugars to the iterator protocol with two
    /// hidden locals:
    ///
    ///     var seq_ = sequence
    ///     var iter_ = null
    ///     while (iter_ = seq_.iterate(iter_)) {
    ///       var item = seq_.iteratorValue(iter_)
    ///       body
    ///     }
    fn for_statement(&mut self) {
        self.push_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        self.consume(TokenKind::Name, "Expect for loop variable name.");
        let variable_name = self.previous.text(self.lexer.source()).to_string();
        self.consume(TokenKind::In, "Expect 'in' after loop variable.");
        self.ignore_newlines();

        self.expression();

        if self.st_ref().locals.len() + 2 > MAX_LOCALS {
            self.error(
                "Cannot declare more than 256 variables in one scope. (Not enough space for for-loop internal variables.)",
            );
        }
        // The space in the hidden names keeps them out of reach of user
        // code.
        let seq_slot = self.add_local("seq ");
        self.emit_op(Op::Null);
        let iter_slot = self.add_local("iter ");

        self.consume(TokenKind::RightParen, "Expect ')' after loop expression.");

        self.start_loop();
        self.load_variable(Variable { index: seq_slot, scope: Scope::Local });
        self.load_variable(Variable { index: iter_slot, scope: Scope::Local });
        self.call_method_name(1, "iterate(_)");
        self.emit_byte_arg(Op::StoreLocal, iter_slot as u8);
        self.test_exit_loop();

        self.load_variable(Variable { index: seq_slot, scope: Scope::Local });
        self.load_variable(Variable { index: iter_slot, scope: Scope::Local });
        self.call_method_name(1, "iteratorValue(_)");

        self.push_scope();
        self.add_local(&variable_name);
        self.statement();
        self.pop_scope();

        self.end_loop();
        self.pop_scope();
    }

    fn break_statement(&mut self) {
        if self.st_ref().loops.is_empty() {
            self.error("Cannot use 'break' outside of a loop.");
            return;
        }
        // Locals declared inside the loop are going out of scope.
        let depth = match self.st_ref().loops.last() {
            Some(loop_info) => loop_info.scope_depth + 1,
            None => unreachable!(),
        };
        self.discard_locals(depth);
        let placeholder = self.emit_jump(Op::Jump);
        match self.st().loops.last_mut() {
            Some(loop_info) => loop_info.breaks.push(placeholder),
            None => unreachable!(),
        }
    }

    fn continue_statement(&mut self) {
        if self.st_ref().loops.is_empty() {
            self.error("Cannot use 'continue' outside of a loop.");
            return;
        }
        let (depth, start) = match self.st_ref().loops.last() {
            Some(loop_info) => (loop_info.scope_depth + 1, loop_info.start),
            None => unreachable!(),
        };
        self.discard_locals(depth);
        let offset = self.st_ref().code.len() + 3 - start;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_short_arg(Op::Loop, offset as u16);
    }

    fn return_statement(&mut self) {
        if self.peek() == TokenKind::Line || self.peek() == TokenKind::RightBrace {
            // No value: initializers return this, everything else null.
            let op = if self.st_ref().is_initializer { Op::LoadLocal0 } else { Op::Null };
            self.emit_op(op);
        } else {
            if self.st_ref().is_initializer {
                self.error("A constructor cannot return a value.");
            }
            self.expression();
        }
        self.emit_op(Op::Return);
    }

    fn variable_definition(&mut self) {
        // The variable is not in scope in its own initializer.
        self.consume(TokenKind::Name, "Expect variable name.");
        let name_token = self.previous.clone();

        if self.match_token(TokenKind::Eq) {
            self.ignore_newlines();
            self.expression();
        } else {
            self.emit_op(Op::Null);
        }

        let symbol = self.declare_variable(Some(name_token));
        self.define_variable(symbol);
    }

    fn import_statement(&mut self) {
        self.ignore_newlines();
        self.consume(TokenKind::String, "Expect a string after 'import'.");
        let module_value = match self.previous.value.clone() {
            Some(Literal::Str(bytes)) => {
                let string = self.vm.new_string(bytes);
                Value::obj(string)
            }
            _ => Value::NULL,
        };
        let module_constant = self.add_constant(module_value);
        self.emit_short_arg(Op::ImportModule, module_constant as u16);
        // Discard the module body's return value.
        self.emit_op(Op::Pop);

        if !self.match_token(TokenKind::For) {
            return;
        }

        loop {
            self.ignore_newlines();
            self.consume(TokenKind::Name, "Expect variable name.");
            let source_token = self.previous.clone();
            let source_name = source_token.text(self.lexer.source()).to_string();
            let name_value = self.vm.string_value(&source_name);
            let source_constant = self.add_constant(name_value);

            // `a as b` binds the imported value under a different name.
            let slot = if self.match_token(TokenKind::As) {
                self.declare_named_variable()
            } else {
                self.declare_variable(Some(source_token))
            };

            self.emit_short_arg(Op::ImportVariable, source_constant as u16);
            self.define_variable(slot);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    // ── Classes ──────────────────────────────────────────────────────────────

    fn class_definition(&mut self, is_foreign: bool) {
        self.consume(TokenKind::Name, "Expect class name.");
        let name = self.previous.text(self.lexer.source()).to_string();
        let symbol = self.declare_variable(Some(self.previous.clone()));
        let class_variable = Variable {
            index: symbol,
            scope: if self.st_ref().scope_depth == -1 { Scope::Module } else { Scope::Local },
        };

        let name_value = self.vm.string_value(&name);
        self.emit_constant(name_value);

        if self.match_token(TokenKind::Is) {
            self.parse_precedence(Precedence::Call);
        } else {
            self.load_core_variable("Object");
        }

        let num_fields_instruction = if is_foreign {
            self.emit_op(Op::ForeignClass);
            None
        } else {
            Some(self.emit_byte_arg(Op::Class, 255))
        };

        self.define_variable(symbol);

        self.push_scope();
        self.classes.push(ClassInfo {
            name,
            class_variable,
            is_foreign,
            in_static: false,
            fields: Vec::new(),
            methods: Vec::new(),
            static_methods: Vec::new(),
            owner_state: self.states.len() - 1,
            signature: None,
            runtime_attributes: std::mem::take(&mut self.pending_runtime_attributes),
        });

        self.consume(TokenKind::LeftBrace, "Expect '{' after class declaration.");
        self.match_line();

        while !self.match_token(TokenKind::RightBrace) {
            if !self.method(class_variable) {
                break;
            }
            if self.match_token(TokenKind::RightBrace) {
                break;
            }
            // Definitions are usually newline-separated, but a same-line
            // method after a braced body is unambiguous.
            self.match_line();
        }

        if let Some(instruction) = num_fields_instruction {
            let count = match self.classes.last() {
                Some(class) => class.fields.len() as u8,
                None => unreachable!(),
            };
            self.st().code[instruction] = count;
        }

        // Attach runtime attributes and close the class.
        self.load_variable(class_variable);
        let attributes = match self.classes.last() {
            Some(class) => class.runtime_attributes.clone(),
            None => unreachable!(),
        };
        if attributes.is_empty() {
            self.emit_op(Op::Null);
        } else {
            self.load_core_variable("Map");
            self.call_method_name(0, "new()");
            for (key, value) in attributes {
                let key_value = self.vm.string_value(&key);
                self.emit_constant(key_value);
                self.emit_constant(value);
                self.call_method_name(2, "addCore_(_,_)");
            }
        }
        self.emit_op(Op::EndClass);

        self.classes.pop();
        self.pop_scope();
    }

    /// Compiles one method definition in a class body. Returns false when
    /// no definition could be parsed.
    fn method(&mut self, class_variable: Variable) -> bool {
        while self.match_token(TokenKind::Hash) {
            self.attribute_line();
        }
        if !self.pending_runtime_attributes.is_empty() {
            // Method-level runtime attributes fold into the class's map.
            let pending = std::mem::take(&mut self.pending_runtime_attributes);
            match self.classes.last_mut() {
                Some(class) => class.runtime_attributes.extend(pending),
                None => unreachable!(),
            }
        }

        let is_foreign = self.match_token(TokenKind::Foreign);
        let is_static = self.match_token(TokenKind::Static);
        match self.classes.last_mut() {
            Some(class) => class.in_static = is_static,
            None => unreachable!(),
        }

        let signature_token = self.peek();
        if !has_signature_rule(signature_token) {
            self.error_at_current("Expect method definition.");
            return false;
        }
        self.next_token();

        let mut signature = self.signature_from_token(SigKind::Getter);
        self.begin_state(true);
        self.parse_signature(signature_token, &mut signature);
        self.st().arity = signature.arity;
        self.st().is_initializer = signature.kind == SigKind::Initializer;
        if is_static && signature.kind == SigKind::Initializer {
            self.error("A constructor cannot be static.");
        }
        match self.classes.last_mut() {
            Some(class) => class.signature = Some(signature.clone()),
            None => unreachable!(),
        }
        let full_signature = signature.full_name();
        let symbol = self.vm.method_names.ensure(&full_signature);

        // Duplicate definitions are compile errors.
        let duplicate = match self.classes.last_mut() {
            Some(class) => {
                let list = if is_static { &mut class.static_methods } else { &mut class.methods };
                if list.contains(&symbol) {
                    true
                } else {
                    list.push(symbol);
                    false
                }
            }
            None => unreachable!(),
        };
        if duplicate {
            let class_name = match self.classes.last() {
                Some(class) => class.name.clone(),
                None => unreachable!(),
            };
            self.error(&format!(
                "Class {} already defines a {}method '{}'.",
                class_name,
                if is_static { "static " } else { "" },
                full_signature
            ));
        }

        if is_foreign {
            // The "body" is the signature string; the host resolves it when
            // the method is bound.
            self.abandon_state();
            let signature_value = self.vm.string_value(&full_signature);
            self.emit_constant(signature_value);
        } else {
            self.consume(TokenKind::LeftBrace, "Expect '{' to begin method body.");
            self.finish_body();
            self.end_state(&full_signature);
        }

        self.define_method(class_variable, is_static, symbol);

        if signature.kind == SigKind::Initializer {
            // The constructor itself lives on the metaclass: allocate, then
            // run the initializer.
            let mut constructor = signature.clone();
            constructor.kind = SigKind::Method;
            let constructor_symbol = self.signature_symbol(&constructor);
            self.create_constructor(&constructor, symbol);
            self.define_method(class_variable, true, constructor_symbol);
        }
        true
    }

    fn create_constructor(&mut self, signature: &Signature, initializer_symbol: usize) {
        self.begin_state(true);
        let is_foreign = match self.classes.last() {
            Some(class) => class.is_foreign,
            None => unreachable!(),
        };
        self.emit_op(if is_foreign { Op::ForeignConstruct } else { Op::Construct });
        self.emit_short_arg(Op::call(signature.arity), initializer_symbol as u16);
        self.emit_op(Op::Return);
        self.st().arity = signature.arity;
        self.end_state(&signature.full_name());
    }

    fn define_method(&mut self, class_variable: Variable, is_static: bool, symbol: usize) {
        self.load_variable(class_variable);
        let op = if is_static { Op::MethodStatic } else { Op::MethodInstance };
        self.emit_short_arg(op, symbol as u16);
    }

    // ── Method signatures ────────────────────────────────────────────────────

    fn parse_signature(&mut self, token: TokenKind, signature: &mut Signature) {
        match token {
            TokenKind::Name => self.named_signature(signature),
            TokenKind::LeftBracket => self.subscript_signature(signature),
            TokenKind::Minus => self.mixed_signature(signature),
            TokenKind::Bang | TokenKind::Tilde => {
                signature.kind = SigKind::Getter;
            }
            TokenKind::Construct => self.constructor_signature(signature),
            _ => self.infix_signature(signature),
        }
    }

    fn named_signature(&mut self, signature: &mut Signature) {
        signature.kind = SigKind::Getter;
        if self.maybe_setter(signature) {
            return;
        }
        self.parameter_list(signature);
    }

    fn maybe_setter(&mut self, signature: &mut Signature) -> bool {
        if !self.match_token(TokenKind::Eq) {
            return false;
        }
        signature.kind = if signature.kind == SigKind::Subscript {
            SigKind::SubscriptSetter
        } else {
            SigKind::Setter
        };
        self.consume(TokenKind::LeftParen, "Expect '(' after '='.");
        self.declare_named_variable();
        self.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
        signature.arity += 1;
        true
    }

    fn parameter_list(&mut self, signature: &mut Signature) {
        if !self.match_token(TokenKind::LeftParen) {
            return;
        }
        signature.kind = SigKind::Method;
        if self.match_token(TokenKind::RightParen) {
            return;
        }
        self.finish_parameter_list(signature);
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
    }

    fn subscript_signature(&mut self, signature: &mut Signature) {
        signature.kind = SigKind::Subscript;
        signature.name.clear();
        self.finish_parameter_list(signature);
        self.consume(TokenKind::RightBracket, "Expect ']' after parameters.");
        self.maybe_setter(signature);
    }

    fn infix_signature(&mut self, signature: &mut Signature) {
        signature.kind = SigKind::Method;
        signature.arity = 1;
        self.consume(TokenKind::LeftParen, "Expect '(' after operator name.");
        self.declare_named_variable();
        self.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
    }

    /// Minus is a getter when declared bare (unary) and a one-parameter
    /// method when declared with a parameter list (binary).
    fn mixed_signature(&mut self, signature: &mut Signature) {
        signature.kind = SigKind::Getter;
        if self.match_token(TokenKind::LeftParen) {
            signature.kind = SigKind::Method;
            signature.arity = 1;
            self.declare_named_variable();
            self.consume(TokenKind::RightParen, "Expect ')' after parameter name.");
        }
    }

    fn constructor_signature(&mut self, signature: &mut Signature) {
        self.consume(TokenKind::Name, "Expect constructor name after 'construct'.");
        *signature = self.signature_from_token(SigKind::Initializer);
        if self.match_token(TokenKind::Eq) {
            self.error("A constructor cannot be a setter.");
        }
        if !self.match_token(TokenKind::LeftParen) {
            self.error("A constructor cannot be a getter.");
            return;
        }
        if self.match_token(TokenKind::RightParen) {
            return;
        }
        self.finish_parameter_list(signature);
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
    }

    // ── Module entry ─────────────────────────────────────────────────────────

    fn compile_module(&mut self) -> Option<Handle> {
        // The module body compiles as a function with module-level scope.
        self.states.push(FnState {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: -1,
            slots: 0,
            max_slots: 0,
            loops: Vec::new(),
            enclosing_class: None,
            direct_method_class: None,
            is_initializer: false,
            arity: 0,
        });

        self.ignore_newlines();
        loop {
            if self.match_token(TokenKind::Eof) {
                break;
            }
            self.definition();
            if !self.match_line() {
                self.consume(TokenKind::Eof, "Expect end of file.");
                break;
            }
        }

        self.emit_op(Op::EndModule);
        self.emit_op(Op::Return);

        // Forward references that never saw a definition are errors.
        let unresolved: Vec<(usize, u32, String)> =
            self.implicit_module_vars.drain(..).collect();
        for (_, line, name) in unresolved {
            self.report(
                line,
                &format!("Error at '{}': Variable is used but not defined.", name),
            );
        }

        self.end_state("(script)")
    }
}

// ── Token classification tables ──────────────────────────────────────────────

fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Question => Precedence::Assignment,
        TokenKind::PipePipe => Precedence::LogicalOr,
        TokenKind::AmpAmp => Precedence::LogicalAnd,
        TokenKind::EqEq | TokenKind::BangEq => Precedence::Equality,
        TokenKind::Is => Precedence::Is,
        TokenKind::Lt | TokenKind::Gt | TokenKind::LtEq | TokenKind::GtEq => {
            Precedence::Comparison
        }
        TokenKind::Pipe => Precedence::BitwiseOr,
        TokenKind::Caret => Precedence::BitwiseXor,
        TokenKind::Amp => Precedence::BitwiseAnd,
        TokenKind::LtLt | TokenKind::GtGt => Precedence::BitwiseShift,
        TokenKind::DotDot | TokenKind::DotDotDot => Precedence::Range,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
        TokenKind::Dot | TokenKind::LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

fn infix_operator(kind: TokenKind) -> Option<(&'static str, Precedence)> {
    let entry = match kind {
        TokenKind::PipePipe => ("||", Precedence::LogicalOr),
        TokenKind::AmpAmp => ("&&", Precedence::LogicalAnd),
        TokenKind::EqEq => ("==", Precedence::Equality),
        TokenKind::BangEq => ("!=", Precedence::Equality),
        TokenKind::Is => ("is", Precedence::Is),
        TokenKind::Lt => ("<", Precedence::Comparison),
        TokenKind::Gt => (">", Precedence::Comparison),
        TokenKind::LtEq => ("<=", Precedence::Comparison),
        TokenKind::GtEq => (">=", Precedence::Comparison),
        TokenKind::Pipe => ("|", Precedence::BitwiseOr),
        TokenKind::Caret => ("^", Precedence::BitwiseXor),
        TokenKind::Amp => ("&", Precedence::BitwiseAnd),
        TokenKind::LtLt => ("<<", Precedence::BitwiseShift),
        TokenKind::GtGt => (">>", Precedence::BitwiseShift),
        TokenKind::DotDot => ("..", Precedence::Range),
        TokenKind::DotDotDot => ("...", Precedence::Range),
        TokenKind::Plus => ("+", Precedence::Term),
        TokenKind::Minus => ("-", Precedence::Term),
        TokenKind::Star => ("*", Precedence::Factor),
        TokenKind::Slash => ("/", Precedence::Factor),
        TokenKind::Percent => ("%", Precedence::Factor),
        _ => return None,
    };
    Some(entry)
}

fn has_signature_rule(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Name
            | TokenKind::LeftBracket
            | TokenKind::Minus
            | TokenKind::Bang
            | TokenKind::Tilde
            | TokenKind::Construct
            | TokenKind::Plus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::EqEq
            | TokenKind::BangEq
            | TokenKind::Lt
            | TokenKind::Gt
            | TokenKind::LtEq
            | TokenKind::GtEq
            | TokenKind::Amp
            | TokenKind::Pipe
            | TokenKind::Caret
            | TokenKind::LtLt
            | TokenKind::GtGt
            | TokenKind::DotDot
            | TokenKind::DotDotDot
            | TokenKind::Is
    )
}

fn is_local_name(name: &str) -> bool {
    name.as_bytes().first().is_some_and(|&c| c.is_ascii_lowercase())
}

/// Tokens that can only begin a statement, never an expression.
fn starts_statement(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Return
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Break
            | TokenKind::Continue
            | TokenKind::Var
            | TokenKind::Import
            | TokenKind::Class
            | TokenKind::Foreign
    )
}

#[cfg(test)]
mod tests {
    use crate::vm::{Vm, VmConfig};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn try_compile(source: &str) -> (bool, Vec<String>) {
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        let mut config = VmConfig::default();
        config.error = Some(Box::new(move |_kind, _module, _line, message| {
            sink.borrow_mut().push(message.to_string());
        }));
        let mut vm = Vm::new(config);
        let compiled = vm.compile_in_module("test", source).is_some();
        let collected = errors.borrow().clone();
        (compiled, collected)
    }

    fn expect_error(source: &str, fragment: &str) {
        let (compiled, errors) = try_compile(source);
        assert!(!compiled, "expected a compile failure for {:?}", source);
        assert!(
            errors.iter().any(|e| e.contains(fragment)),
            "no error containing {:?} in {:?}",
            fragment,
            errors
        );
    }

    #[test]
    fn test_empty_module_compiles() {
        assert!(try_compile("").0);
        assert!(try_compile("\n\n").0);
    }

    #[test]
    fn test_statements_compile() {
        let source = "var a = 1\n\
                      a = a + 2\n\
                      if (a > 1) a = 0 else a = 9\n\
                      while (a < 3) a = a + 1\n\
                      for (x in [1, 2]) a = a + x\n\
                      var t = a > 0 ? \"p\" : \"n\"";
        let (compiled, errors) = try_compile(source);
        assert!(compiled, "{:?}", errors);
    }

    #[test]
    fn test_duplicate_local_is_an_error() {
        expect_error(
            "var f = Fn.new {\nvar a = 1\nvar a = 2\n}",
            "Variable is already declared in this scope.",
        );
    }

    #[test]
    fn test_module_variable_redefinition() {
        expect_error("var x = 1\nvar x = 2", "Module variable is already defined.");
    }

    #[test]
    fn test_break_outside_loop() {
        expect_error("break", "Cannot use 'break' outside of a loop.");
    }

    #[test]
    fn test_this_outside_method() {
        expect_error("this", "Cannot use 'this' outside of a method.");
    }

    #[test]
    fn test_field_outside_class() {
        expect_error("_x", "Cannot reference a field outside of a class definition.");
    }

    #[test]
    fn test_field_in_static_method() {
        expect_error(
            "class C {\nstatic go { _x }\n}",
            "Cannot use an instance field in a static method.",
        );
    }

    #[test]
    fn test_constructor_cannot_return_a_value() {
        expect_error(
            "class C {\nconstruct new() { return 1 }\n}",
            "A constructor cannot return a value.",
        );
    }

    #[test]
    fn test_constructor_cannot_be_a_getter() {
        expect_error(
            "class C {\nconstruct new { 1 }\n}",
            "A constructor cannot be a getter.",
        );
    }

    #[test]
    fn test_too_many_parameters() {
        let params: Vec<String> = (0..17).map(|i| format!("p{}", i)).collect();
        let source = format!("class C {{\nm({}) {{ 1 }}\n}}", params.join(", "));
        expect_error(&source, "Methods cannot have more than 16 parameters.");
    }

    #[test]
    fn test_duplicate_method_definition() {
        expect_error(
            "class C {\nfoo() { 1 }\nfoo() { 2 }\n}",
            "Class C already defines a method 'foo()'.",
        );
    }

    #[test]
    fn test_signature_grammar_interning() {
        let source = "class C {\n\
                      construct new(x) {}\n\
                      [i] { 1 }\n\
                      [i]=(v) { 1 }\n\
                      <(other) { 1 }\n\
                      - { 1 }\n\
                      -(other) { 1 }\n\
                      name=(v) { 1 }\n\
                      count { 1 }\n\
                      }";
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        let mut config = VmConfig::default();
        config.error = Some(Box::new(move |_k, _m, _l, message| {
            sink.borrow_mut().push(message.to_string());
        }));
        let mut vm = Vm::new(config);
        assert!(
            vm.compile_in_module("test", source).is_some(),
            "{:?}",
            errors.borrow()
        );
        for signature in [
            "init new(_)",
            "new(_)",
            "[_]",
            "[_]=(_)",
            "<(_)",
            "-",
            "-(_)",
            "name=(_)",
            "count",
        ] {
            assert!(
                vm.method_names.find(signature).is_some(),
                "signature {:?} was not interned",
                signature
            );
        }
    }

    #[test]
    fn test_method_bodies_can_nest_classes() {
        let source = "class Outer {\n\
                      static make() {\n\
                      class Inner {\nconstruct new() { _v = 1 }\nv { _v }\n}\n\
                      return Inner.new().v\n\
                      }\n\
                      }";
        let (compiled, errors) = try_compile(source);
        assert!(compiled, "{:?}", errors);
    }

    #[test]
    fn test_expression_required() {
        expect_error("var x = )", "Expected expression.");
    }
}
