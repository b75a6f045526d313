//! Single-pass AST → bytecode compiler (spec.md §4.4). Walks the AST
//! produced by `parser`, emitting into a `CodeBuilder` against the current
//! file scope's `SymbolTable`, producing a `CompilationUnit`.
//!
//! Grounded on `ouros/src/bytecode/builder.rs` + `ouros/src/namespace.rs`
//! for the scope/emit shape; control-flow lowering and opcode choreography
//! are this crate's own translation of spec.md §4.4.3/§4.4.4 into the
//! opcode set in `bytecode::op`.

use std::rc::Rc;

use ahash::AHashMap;

use crate::ast::*;
use crate::bytecode::builder::CodeBuilder;
use crate::bytecode::code::{CompilationUnit, Constant, FunctionId, FunctionProto};
use crate::bytecode::op::Op;
use crate::errors::{ApeError, ErrorKind, ErrorList};
use crate::optimize;
use crate::parser::Parser;
use crate::position::{CompilationFile, SourcePosition};
use crate::symbol::{Symbol, SymbolKind, SymbolTable};

/// Open-question dispositions from SPEC_FULL.md §4: the optimizer pass is
/// implemented but off by default (`original_source/ccopt.c`'s entry point
/// short-circuits before its dispatch switch runs); undeclared assignment
/// targets auto-define as assignable symbols in the current scope unless
/// disabled.
#[derive(Debug, Clone, Copy)]
pub struct CompilerConfig {
    pub constant_folding: bool,
    pub implicit_globals: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self { constant_folding: false, implicit_globals: true }
    }
}

/// Resolves an `include` path to source text. The core only consumes this
/// interface; the host-embedding surface that implements it is out of
/// scope (spec.md §1).
pub trait ModuleSource {
    fn read_module(&self, canonical_path: &str) -> Result<String, String>;
}

struct ModuleRecord {
    globals: Vec<(String, u16)>,
}

struct CompileState<'m> {
    unit: CompilationUnit,
    strings: AHashMap<String, u16>,
    errors: ErrorList,
    config: CompilerConfig,
    loader: Option<&'m dyn ModuleSource>,
    modules: AHashMap<String, ModuleRecord>,
    include_stack: Vec<String>,
}

impl<'m> CompileState<'m> {
    fn error(&mut self, pos: &SourcePosition, msg: impl Into<String>) {
        self.errors.push(ApeError::new(ErrorKind::Compilation, msg.into(), pos.clone()));
    }

    fn intern_string(&mut self, value: &str) -> u16 {
        if let Some(&idx) = self.strings.get(value) {
            return idx;
        }
        let idx = self.unit.constants.len() as u16;
        self.unit.constants.push(Constant::Str(Rc::from(value)));
        self.strings.insert(value.to_string(), idx);
        idx
    }
}

/// Compiles a top-level source file into a complete `CompilationUnit`.
/// `loader` is consulted for `include` statements; pass `None` if the
/// program contains none.
///
/// `context_globals` reserves the first `context_globals.len()` global
/// slots for names a host has already bound (natives installed via
/// `Context::register_native`, values set via `Context::set_global`)
/// before this source is compiled, so the script can refer to them as
/// bare identifiers without a prior local assignment (spec.md §6).
pub fn compile_source(
    source: &str,
    file_path: &str,
    config: CompilerConfig,
    loader: Option<&dyn ModuleSource>,
    context_globals: &[&str],
) -> Result<CompilationUnit, ErrorList> {
    let file = CompilationFile::new(file_path, source);
    let lexer = crate::lexer::Lexer::new(source, file.clone());
    let mut parser = Parser::new(lexer);
    let program = parser.parse_program();

    let mut state = CompileState {
        unit: CompilationUnit::default(),
        strings: AHashMap::new(),
        errors: ErrorList::new(),
        config,
        loader,
        modules: AHashMap::new(),
        include_stack: vec![file.path.clone()],
    };
    state.errors.extend(parser.errors);
    if !state.errors.is_empty() {
        return Err(state.errors);
    }

    let mut symbols = SymbolTable::new_root(context_globals.len() as u16);
    for (index, name) in context_globals.iter().enumerate() {
        symbols.register_context_global(name, index as u16);
    }
    let main_code = {
        let mut builder = CodeBuilder::new();
        compile_block(&mut state, &mut symbols, &mut builder, &program);
        if !matches!(builder.last_op(), Some(Op::ReturnValue) | Some(Op::ReturnNothing)) {
            builder.emit(Op::ReturnNothing, &[], &SourcePosition::synthetic(file.clone()));
        }
        builder.finish()
    };
    state.unit.main = main_code;
    state.unit.num_module_globals = symbols.definition_count();

    if !state.errors.is_empty() {
        return Err(state.errors);
    }
    Ok(state.unit)
}

// --- statements -------------------------------------------------------

fn compile_block(state: &mut CompileState, symbols: &mut SymbolTable, builder: &mut CodeBuilder, block: &Block) {
    for stmt in &block.statements {
        compile_statement(state, symbols, builder, stmt);
    }
}

fn compile_scoped_block(state: &mut CompileState, symbols: &mut SymbolTable, builder: &mut CodeBuilder, block: &Block) {
    symbols.push_block_scope();
    compile_block(state, symbols, builder, block);
    symbols.pop_block_scope();
}

fn compile_statement(state: &mut CompileState, symbols: &mut SymbolTable, builder: &mut CodeBuilder, expr: &Expression) {
    match &expr.kind {
        ExpressionKind::Define { name, value, assignable } => {
            compile_expression(state, symbols, builder, value);
            match symbols.define(&name.name, *assignable) {
                Ok(sym) => emit_define(builder, &sym, &expr.position),
                Err(msg) => state.error(&expr.position, msg),
            }
        }
        ExpressionKind::ExpressionStatement(inner) => {
            compile_expression(state, symbols, builder, inner);
            builder.emit(Op::Pop, &[], &expr.position);
        }
        ExpressionKind::Block(block) => compile_scoped_block(state, symbols, builder, block),
        ExpressionKind::If { cases, alternative } => compile_if(state, symbols, builder, cases, alternative, &expr.position),
        ExpressionKind::While { test, body } => compile_while(state, symbols, builder, test, body, &expr.position),
        ExpressionKind::For { init, test, update, body } => {
            compile_for(state, symbols, builder, init.as_deref(), test.as_deref(), update.as_deref(), body, &expr.position)
        }
        ExpressionKind::ForEach { iterator, source, body } => {
            compile_for_each(state, symbols, builder, iterator, source, body, &expr.position)
        }
        ExpressionKind::Break => {
            let ip = builder.emit(Op::Jump, &[0], &expr.position);
            if !builder.record_break(ip) {
                state.error(&expr.position, "'break' outside of a loop");
            }
        }
        ExpressionKind::Continue => match builder.current_continue_ip() {
            Some(target) => {
                builder.emit(Op::Jump, &[target as u16], &expr.position);
            }
            None => state.error(&expr.position, "'continue' outside of a loop"),
        },
        ExpressionKind::Return(value) => {
            if !symbols.is_function_boundary {
                state.error(&expr.position, "'return' outside of a function");
            }
            match value {
                Some(v) => {
                    compile_expression(state, symbols, builder, v);
                    builder.emit(Op::ReturnValue, &[], &expr.position);
                }
                None => {
                    builder.emit(Op::ReturnNothing, &[], &expr.position);
                }
            }
        }
        ExpressionKind::Include { path, .. } => compile_include(state, symbols, builder, path, &expr.position),
        ExpressionKind::Recover { error_name, body } => compile_recover(state, symbols, builder, error_name, body, &expr.position),
        _ => {
            compile_expression(state, symbols, builder, expr);
            builder.emit(Op::Pop, &[], &expr.position);
        }
    }
}

fn compile_if(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    cases: &[IfCase],
    alternative: &Option<Block>,
    pos: &SourcePosition,
) {
    let mut end_jumps = Vec::new();
    for case in cases {
        compile_expression(state, symbols, builder, &case.test);
        let next_jump = builder.emit(Op::JumpIfFalse, &[0], pos);
        compile_scoped_block(state, symbols, builder, &case.consequence);
        end_jumps.push(builder.emit(Op::Jump, &[0], pos));
        let next_ip = builder.ip();
        builder.patch_jump(next_jump, next_ip);
    }
    if let Some(alt) = alternative {
        compile_scoped_block(state, symbols, builder, alt);
    }
    let end_ip = builder.ip();
    for jump in end_jumps {
        builder.patch_jump(jump, end_ip);
    }
}

fn compile_while(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    test: &Expression,
    body: &Block,
    pos: &SourcePosition,
) {
    let before = builder.ip();
    compile_expression(state, symbols, builder, test);
    let exit_jump = builder.emit(Op::JumpIfFalse, &[0], pos);
    builder.enter_loop(before);
    compile_scoped_block(state, symbols, builder, body);
    builder.emit(Op::Jump, &[before as u16], pos);
    let end_ip = builder.ip();
    builder.patch_jump(exit_jump, end_ip);
    builder.exit_loop(end_ip);
}

fn compile_for(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    init: Option<&Expression>,
    test: Option<&Expression>,
    update: Option<&Expression>,
    body: &Block,
    pos: &SourcePosition,
) {
    symbols.push_block_scope();
    if let Some(init) = init {
        compile_statement(state, symbols, builder, init);
    }
    let test_ip = builder.ip();
    let exit_jump = if let Some(test) = test {
        compile_expression(state, symbols, builder, test);
        Some(builder.emit(Op::JumpIfFalse, &[0], pos))
    } else {
        None
    };
    let continue_ip;
    if let Some(update) = update {
        let skip_update = builder.emit(Op::Jump, &[0], pos);
        let update_ip = builder.ip();
        compile_expression(state, symbols, builder, update);
        builder.emit(Op::Pop, &[], pos);
        builder.emit(Op::Jump, &[test_ip as u16], pos);
        let after_update = builder.ip();
        builder.patch_jump(skip_update, after_update);
        continue_ip = update_ip;
    } else {
        continue_ip = test_ip;
    }
    builder.enter_loop(continue_ip);
    compile_scoped_block(state, symbols, builder, body);
    builder.emit(Op::Jump, &[continue_ip as u16], pos);
    let end_ip = builder.ip();
    if let Some(exit_jump) = exit_jump {
        builder.patch_jump(exit_jump, end_ip);
    }
    builder.exit_loop(end_ip);
    symbols.pop_block_scope();
}

fn compile_for_each(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    iterator: &Identifier,
    source: &Expression,
    body: &Block,
    pos: &SourcePosition,
) {
    symbols.push_block_scope();

    let source_symbol = if let ExpressionKind::Identifier(ident) = &source.kind {
        match symbols.resolve(&ident.name) {
            Some(sym) => sym,
            None => {
                state.error(&source.position, format!("undefined symbol '{}'", ident.name));
                return;
            }
        }
    } else {
        compile_expression(state, symbols, builder, source);
        let sym = symbols.define("@source", false).expect("synthetic @source redefinition");
        emit_define(builder, &sym, pos);
        sym
    };

    compile_expression(state, symbols, builder, &Expression::new(ExpressionKind::NumberLiteral(0.0), pos.clone()));
    let index_symbol = symbols.define("@i", true).expect("synthetic @i redefinition");
    emit_define(builder, &index_symbol, pos);

    let test_ip = builder.ip();
    emit_get(builder, &source_symbol, pos);
    builder.emit(Op::Len, &[], pos);
    emit_get(builder, &index_symbol, pos);
    builder.emit(Op::CompareEqual, &[], pos);
    builder.emit(Op::IsEqual, &[], pos);
    let exit_jump = builder.emit(Op::JumpIfTrue, &[0], pos);

    // The index increment sits physically between the test and the body
    // (same trick `compile_for` uses for a C-style update clause), reached
    // by falling through from the body and skipped over on first entry, so
    // `continue`'s target can be the increment itself rather than the test
    // — jumping straight to the test would re-run it against the
    // not-yet-advanced index and re-bind the same element forever
    // (spec.md §4.4.3).
    let skip_update = builder.emit(Op::Jump, &[0], pos);
    let update_ip = builder.ip();
    emit_get(builder, &index_symbol, pos);
    builder.emit(Op::MkNumber, &encode_number(1.0), pos);
    builder.emit(Op::Add, &[], pos);
    emit_set(builder, &index_symbol, pos);
    builder.emit(Op::Pop, &[], pos);
    builder.emit(Op::Jump, &[test_ip as u16], pos);
    let after_update = builder.ip();
    builder.patch_jump(skip_update, after_update);

    builder.enter_loop(update_ip);
    symbols.push_block_scope();
    emit_get(builder, &source_symbol, pos);
    emit_get(builder, &index_symbol, pos);
    builder.emit(Op::GetValueAt, &[], pos);
    match symbols.define(&iterator.name, true) {
        Ok(sym) => emit_define(builder, &sym, pos),
        Err(msg) => state.error(pos, msg),
    }
    compile_block(state, symbols, builder, body);
    symbols.pop_block_scope();

    builder.emit(Op::Jump, &[update_ip as u16], pos);
    let end_ip = builder.ip();
    builder.patch_jump(exit_jump, end_ip);
    builder.exit_loop(end_ip);

    symbols.pop_block_scope();
}

fn compile_recover(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    error_name: &Identifier,
    body: &Block,
    pos: &SourcePosition,
) {
    if !symbols.is_function_boundary {
        state.error(pos, "'recover' is only valid inside a function body");
    }
    let set_recover_ip = builder.emit(Op::SetRecover, &[0], pos);
    let skip_jump = builder.emit(Op::Jump, &[0], pos);
    let handler_ip = builder.ip();
    builder.patch_jump(set_recover_ip, handler_ip);

    symbols.push_block_scope();
    match symbols.define(&error_name.name, false) {
        Ok(sym) => emit_define(builder, &sym, pos),
        Err(msg) => state.error(pos, msg),
    }
    compile_block(state, symbols, builder, body);
    symbols.pop_block_scope();

    if !matches!(builder.last_op(), Some(Op::ReturnValue) | Some(Op::ReturnNothing)) {
        state.error(pos, "'recover' body must end in a return statement");
    }
    let after_ip = builder.ip();
    builder.patch_jump(skip_jump, after_ip);
}

fn compile_include(state: &mut CompileState, symbols: &mut SymbolTable, builder: &mut CodeBuilder, path: &str, pos: &SourcePosition) {
    if !symbols.is_module_root() || !symbols.is_top_scope() {
        state.error(pos, "'include' is only valid at module top level");
        return;
    }
    // Resolved relative to "" rather than the including file's own
    // directory: multi-directory module layouts are out of scope here.
    let canonical = canonicalize_module_path(path, "");
    if state.include_stack.contains(&canonical) {
        state.error(pos, format!("cyclic include of '{canonical}'"));
        return;
    }

    if !state.modules.contains_key(&canonical) {
        let Some(loader) = state.loader else {
            state.error(pos, format!("no module loader configured to resolve '{canonical}'"));
            return;
        };
        let source = match loader.read_module(&canonical) {
            Ok(s) => s,
            Err(e) => {
                state.error(pos, format!("failed to read module '{canonical}': {e}"));
                return;
            }
        };
        let file = CompilationFile::new(canonical.clone(), &source);
        let lexer = crate::lexer::Lexer::new(&source, file);
        let mut parser = Parser::new(lexer);
        let program = parser.parse_program();
        state.errors.extend(parser.errors);

        state.include_stack.push(canonical.clone());
        let mut module_symbols = SymbolTable::new_root(state.unit.num_module_globals);
        let mut module_builder = CodeBuilder::new();
        compile_block(state, &mut module_symbols, &mut module_builder, &program);
        state.include_stack.pop();
        state.unit.num_module_globals = module_symbols.definition_count();

        let record = ModuleRecord { globals: module_globals_of(&module_symbols) };
        state.modules.insert(canonical.clone(), record);

        // The module's own top-level code must still execute once, inline
        // at the include site, to run its side effects and populate its
        // globals. Its `DefModuleGlobal`/`GetModuleGlobal` operands already
        // address the shared global-slot range handed out above, so the
        // importer reaches the same storage through `GetContextGlobal`
        // rather than through a second, redundant definition.
        builder.splice(module_builder.finish());
    }

    let record = &state.modules[&canonical];
    for (name, index) in &record.globals {
        symbols.register_context_global(name, *index);
    }
}

fn module_globals_of(table: &SymbolTable) -> Vec<(String, u16)> {
    table.module_global_names()
}

/// Collapses `./` and `x/../` segments and appends `.ape` if missing.
fn canonicalize_module_path(path: &str, base_dir: &str) -> String {
    let raw = if path.starts_with('/') || base_dir.is_empty() {
        path.to_string()
    } else {
        format!("{base_dir}/{path}")
    };
    let raw = if raw.ends_with(".ape") { raw } else { format!("{raw}.ape") };
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

// --- expressions --------------------------------------------------------

fn compile_expression(state: &mut CompileState, symbols: &mut SymbolTable, builder: &mut CodeBuilder, expr: &Expression) {
    if state.config.constant_folding {
        if let Some(folded) = optimize::fold(expr) {
            compile_expression_inner(state, symbols, builder, &folded);
            return;
        }
    }
    compile_expression_inner(state, symbols, builder, expr);
}

fn compile_expression_inner(state: &mut CompileState, symbols: &mut SymbolTable, builder: &mut CodeBuilder, expr: &Expression) {
    let pos = &expr.position;
    match &expr.kind {
        ExpressionKind::NumberLiteral(n) => {
            builder.emit(Op::MkNumber, &encode_number(*n), pos);
        }
        ExpressionKind::BoolLiteral(b) => {
            builder.emit(if *b { Op::True } else { Op::False }, &[], pos);
        }
        ExpressionKind::NullLiteral => {
            builder.emit(Op::Null, &[], pos);
        }
        ExpressionKind::StringLiteral { value, .. } => {
            let idx = state.intern_string(value);
            builder.emit(Op::Constant, &[idx], pos);
        }
        ExpressionKind::ArrayLiteral(items) => {
            for item in items {
                compile_expression(state, symbols, builder, item);
            }
            builder.emit(Op::MkArray, &[items.len() as u16], pos);
        }
        ExpressionKind::MapLiteral { keys, values } => {
            builder.emit(Op::MapStart, &[keys.len() as u16], pos);
            for (k, v) in keys.iter().zip(values) {
                compile_expression(state, symbols, builder, k);
                compile_expression(state, symbols, builder, v);
            }
            builder.emit(Op::MapEnd, &[keys.len() as u16], pos);
        }
        ExpressionKind::Identifier(ident) => match symbols.resolve(&ident.name) {
            Some(sym) => emit_get(builder, &sym, pos),
            None => state.error(pos, format!("undefined symbol '{}'", ident.name)),
        },
        ExpressionKind::Prefix { op, right } => {
            compile_expression(state, symbols, builder, right);
            match op {
                PrefixOp::Minus => {
                    builder.emit(Op::Minus, &[], pos);
                }
                PrefixOp::Bang => {
                    builder.emit(Op::Not, &[], pos);
                }
                PrefixOp::BitNot => {
                    // No dedicated unary-not opcode; `x ^ -1` truncates
                    // through i64 the same way `fold_prefix` does.
                    builder.emit(Op::MkNumber, &encode_number(-1.0), pos);
                    builder.emit(Op::BitXor, &[], pos);
                }
            }
        }
        ExpressionKind::Infix { op, left, right } => compile_infix(state, symbols, builder, *op, left, right, pos),
        ExpressionKind::Logical { op, left, right } => compile_logical(state, symbols, builder, *op, left, right, pos),
        ExpressionKind::Ternary { test, then_branch, else_branch } => {
            compile_expression(state, symbols, builder, test);
            let else_jump = builder.emit(Op::JumpIfFalse, &[0], pos);
            compile_expression(state, symbols, builder, then_branch);
            let end_jump = builder.emit(Op::Jump, &[0], pos);
            let else_ip = builder.ip();
            builder.patch_jump(else_jump, else_ip);
            compile_expression(state, symbols, builder, else_branch);
            let end_ip = builder.ip();
            builder.patch_jump(end_jump, end_ip);
        }
        ExpressionKind::Index { left, index, via_dot } => {
            compile_expression(state, symbols, builder, left);
            if *via_dot && dot_member_name(index) == Some("length") {
                // `a.length` has no parens, so `parse_dot` hands us a plain
                // `Index` node rather than a `Call`; spec.md §4.5.3's `LEN`
                // opcode is exactly what a bare (non-called) `.length` means
                // for an array/map/string receiver.
                builder.emit(Op::Len, &[], pos);
            } else {
                compile_expression(state, symbols, builder, index);
                builder.emit(Op::GetIndex, &[], pos);
            }
        }
        ExpressionKind::Call { callee, args, receiver } => compile_call(state, symbols, builder, callee, args, receiver.as_deref(), pos),
        ExpressionKind::FunctionLiteral(lit) => compile_function_literal(state, symbols, builder, lit),
        ExpressionKind::Assignment { dest, source, is_postfix } => compile_assignment(state, symbols, builder, dest, source, *is_postfix, pos),
        _ => state.error(pos, "this node cannot appear in expression position"),
    }
}

fn compile_infix(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    op: InfixOp,
    left: &Expression,
    right: &Expression,
    pos: &SourcePosition,
) {
    // `<`/`<=` become `>`/`>=` with swapped operands so the VM needs only
    // one comparison direction (spec.md §4.4.4).
    let (op, left, right) = match op {
        InfixOp::Lt => (InfixOp::Gt, right, left),
        InfixOp::LtEq => (InfixOp::GtEq, right, left),
        other => (other, left, right),
    };
    compile_expression(state, symbols, builder, left);
    compile_expression(state, symbols, builder, right);
    match op {
        InfixOp::Plus => builder.emit(Op::Add, &[], pos),
        InfixOp::Minus => builder.emit(Op::Sub, &[], pos),
        InfixOp::Asterisk => builder.emit(Op::Mul, &[], pos),
        InfixOp::Slash => builder.emit(Op::Div, &[], pos),
        InfixOp::Percent => builder.emit(Op::Mod, &[], pos),
        InfixOp::BitAnd => builder.emit(Op::BitAnd, &[], pos),
        InfixOp::BitOr => builder.emit(Op::BitOr, &[], pos),
        InfixOp::BitXor => builder.emit(Op::BitXor, &[], pos),
        InfixOp::LShift => builder.emit(Op::LeftShift, &[], pos),
        InfixOp::RShift => builder.emit(Op::RightShift, &[], pos),
        InfixOp::Eq => {
            builder.emit(Op::CompareEqual, &[], pos);
            builder.emit(Op::IsEqual, &[], pos)
        }
        InfixOp::NotEq => {
            builder.emit(Op::CompareEqual, &[], pos);
            builder.emit(Op::NotEqual, &[], pos)
        }
        InfixOp::Gt => {
            builder.emit(Op::ComparePlain, &[], pos);
            builder.emit(Op::GreaterThan, &[], pos)
        }
        InfixOp::GtEq => {
            builder.emit(Op::ComparePlain, &[], pos);
            builder.emit(Op::GreaterEqual, &[], pos)
        }
        InfixOp::Lt | InfixOp::LtEq => unreachable!("rewritten above"),
    };
}

fn compile_logical(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    op: LogicalOp,
    left: &Expression,
    right: &Expression,
    pos: &SourcePosition,
) {
    compile_expression(state, symbols, builder, left);
    builder.emit(Op::Dup, &[], pos);
    let jump_op = match op {
        LogicalOp::And => Op::JumpIfFalse,
        LogicalOp::Or => Op::JumpIfTrue,
    };
    let short_circuit = builder.emit(jump_op, &[0], pos);
    builder.emit(Op::Pop, &[], pos);
    compile_expression(state, symbols, builder, right);
    let end_ip = builder.ip();
    builder.patch_jump(short_circuit, end_ip);
}

fn compile_call(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    callee: &Expression,
    args: &[Expression],
    receiver: Option<&Expression>,
    pos: &SourcePosition,
) {
    if let Some(receiver) = receiver {
        compile_expression(state, symbols, builder, receiver);
        builder.emit(Op::Dup, &[], pos);
        builder.emit(Op::PushThis, &[], pos);
        // Top of stack now holds the receiver again; GETINDEX inside
        // `callee` (an Index node over the same receiver expression,
        // reconstructed by the parser) consumes it.
        compile_index_with_receiver_on_stack(state, symbols, builder, callee, pos);
    } else {
        compile_expression(state, symbols, builder, callee);
    }
    for arg in args {
        compile_expression(state, symbols, builder, arg);
    }
    builder.emit(Op::Call, &[args.len() as u16], pos);
    if receiver.is_some() {
        builder.emit(Op::PopThis, &[], pos);
    }
}

/// The member name of a dot-access (`recv.name`), if `index` is the plain
/// string literal `parse_dot` always produces for one.
fn dot_member_name(index: &Expression) -> Option<&str> {
    match &index.kind {
        ExpressionKind::StringLiteral { value, .. } => Some(value.as_str()),
        _ => None,
    }
}

/// `callee` is the `Index{left, index, via_dot: true}` node the parser
/// builds for `recv.name`; the receiver value is already duplicated on top
/// of the stack (one copy pushed to the this-stack, one left for us), so
/// we only need to push the member name and emit `GETINDEX` rather than
/// re-evaluating `left`.
fn compile_index_with_receiver_on_stack(
    state: &mut CompileState,
    _symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    callee: &Expression,
    pos: &SourcePosition,
) {
    let ExpressionKind::Index { index, .. } = &callee.kind else {
        unreachable!("dot-call callee is always an Index node");
    };
    let ExpressionKind::StringLiteral { value, .. } = &index.kind else {
        unreachable!("dot-call index is always a string literal");
    };
    let idx = state.intern_string(value);
    builder.emit(Op::Constant, &[idx], pos);
    builder.emit(Op::GetIndex, &[], pos);
}

fn compile_assignment(
    state: &mut CompileState,
    symbols: &mut SymbolTable,
    builder: &mut CodeBuilder,
    dest: &Expression,
    source: &Expression,
    is_postfix: bool,
    pos: &SourcePosition,
) {
    match &dest.kind {
        ExpressionKind::Identifier(ident) => {
            let Some(sym) = resolve_or_define_assignable(state, symbols, &ident.name, pos) else { return };
            if !sym.assignable {
                state.error(pos, format!("cannot assign to const '{}'", ident.name));
            }
            if is_postfix {
                emit_get(builder, &sym, pos);
            }
            compile_expression(state, symbols, builder, source);
            builder.emit(Op::Dup, &[], pos);
            emit_set(builder, &sym, pos);
            if is_postfix {
                builder.emit(Op::Pop, &[], pos);
            }
        }
        ExpressionKind::Index { left, index, .. } => {
            // `a[i]++` evaluates `left`/`index` twice (once to read the old
            // value, once for the store below): there is no spare stack
            // slot to stash a duplicate under a freshly computed
            // collection/index pair without a swap/pick opcode, so a
            // second evaluation is the tradeoff. Fine for the common case
            // of pure subscript expressions; a `left`/`index` with side
            // effects would observe them twice.
            if is_postfix {
                compile_expression(state, symbols, builder, left);
                compile_expression(state, symbols, builder, index);
                builder.emit(Op::GetIndex, &[], pos);
            }
            compile_expression(state, symbols, builder, left);
            compile_expression(state, symbols, builder, index);
            compile_expression(state, symbols, builder, source);
            // `SetIndex` mutates and pushes the stored value back, so the
            // assignment expression's value falls out naturally without
            // needing a `Dup` (there is no stack slot to duplicate into
            // since collection/index sit beneath the value).
            builder.emit(Op::SetIndex, &[], pos);
            if is_postfix {
                builder.emit(Op::Pop, &[], pos);
            }
        }
        _ => state.error(pos, "assignment target must be an identifier or index expression"),
    }
}

fn resolve_or_define_assignable(state: &mut CompileState, symbols: &mut SymbolTable, name: &str, pos: &SourcePosition) -> Option<Symbol> {
    if let Some(sym) = symbols.resolve(name) {
        return Some(sym);
    }
    if state.config.implicit_globals {
        match symbols.define(name, true) {
            Ok(sym) => Some(sym),
            Err(msg) => {
                state.error(pos, msg);
                None
            }
        }
    } else {
        state.error(pos, format!("undefined symbol '{name}'"));
        None
    }
}

fn compile_function_literal(state: &mut CompileState, symbols: &SymbolTable, builder: &mut CodeBuilder, lit: &FunctionLiteral) {
    let mut func_symbols = SymbolTable::new_function_scope(symbols);
    if let Some(name) = &lit.name {
        func_symbols.define_special(name, SymbolKind::Function);
    }
    func_symbols.define_special("this", SymbolKind::This);
    for param in &lit.params {
        if let Err(msg) = func_symbols.define(&param.name, true) {
            state.error(&param.position, msg);
        }
    }

    let mut func_builder = CodeBuilder::new();
    compile_block(state, &mut func_symbols, &mut func_builder, &lit.body);
    if !matches!(func_builder.last_op(), Some(Op::ReturnValue) | Some(Op::ReturnNothing)) {
        func_builder.emit(Op::ReturnNothing, &[], &lit.position);
    }
    let code = func_builder.finish();
    let free_symbols = func_symbols.drain_free_symbols();
    let num_locals = func_symbols.definition_count();

    let proto = FunctionProto {
        name: lit.name.clone().unwrap_or_default(),
        code,
        num_locals,
        num_params: lit.params.len() as u8,
        num_free: free_symbols.len() as u16,
    };
    let function_id = FunctionId(state.unit.functions.len() as u32);
    state.unit.functions.push(proto);
    let pool_idx = state.unit.constants.len() as u16;
    state.unit.constants.push(Constant::Function(function_id));

    // Emitted in the ENCLOSING scope: read each captured free symbol (from
    // its home in the enclosing table) to push its value, then MKFUNCTION
    // pops them and attaches them to the new closure.
    for free in &free_symbols {
        emit_get(builder, &free.outer, &lit.position);
    }
    builder.emit(Op::MkFunction, &[pool_idx, free_symbols.len() as u16], &lit.position);
}

fn emit_get(builder: &mut CodeBuilder, sym: &Symbol, pos: &SourcePosition) {
    match sym.kind {
        SymbolKind::ModuleGlobal => builder.emit(Op::GetModuleGlobal, &[sym.index], pos),
        SymbolKind::ContextGlobal => builder.emit(Op::GetContextGlobal, &[sym.index], pos),
        SymbolKind::Local => builder.emit(Op::GetLocal, &[sym.index], pos),
        SymbolKind::Free => builder.emit(Op::GetFree, &[sym.index], pos),
        SymbolKind::Function => builder.emit(Op::CurrentFunction, &[], pos),
        SymbolKind::This => builder.emit(Op::GetThis, &[], pos),
    };
}

fn emit_set(builder: &mut CodeBuilder, sym: &Symbol, pos: &SourcePosition) {
    match sym.kind {
        SymbolKind::ModuleGlobal => builder.emit(Op::SetModuleGlobal, &[sym.index], pos),
        SymbolKind::Local => builder.emit(Op::SetLocal, &[sym.index], pos),
        SymbolKind::Free => builder.emit(Op::SetFree, &[sym.index], pos),
        SymbolKind::ContextGlobal | SymbolKind::Function | SymbolKind::This => {
            // Unreachable in well-formed programs: `resolve_or_define_assignable`
            // and `compile_assignment`'s `assignable` check reject these
            // before an emit is attempted.
            builder.emit(Op::Pop, &[], pos)
        }
    };
}

fn emit_define(builder: &mut CodeBuilder, sym: &Symbol, pos: &SourcePosition) {
    match sym.kind {
        SymbolKind::ModuleGlobal => builder.emit(Op::DefModuleGlobal, &[sym.index], pos),
        SymbolKind::Local => builder.emit(Op::DefLocal, &[sym.index], pos),
        other => unreachable!("define() never produces symbol kind {other:?}"),
    };
}

/// Packs a double into 4 big-endian-ordered 16-bit words, most-significant
/// first (SPEC_FULL.md §4 disposition 2).
fn encode_number(value: f64) -> [u16; 4] {
    let bits = value.to_bits();
    [(bits >> 48) as u16, (bits >> 32) as u16, (bits >> 16) as u16, bits as u16]
}

pub fn decode_number(words: &[u16]) -> f64 {
    let bits = (words[0] as u64) << 48 | (words[1] as u64) << 32 | (words[2] as u64) << 16 | (words[3] as u64);
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> CompilationUnit {
        compile_source(source, "test.ape", CompilerConfig::default(), None, &[]).unwrap()
    }

    fn all_codes(unit: &CompilationUnit) -> Vec<&crate::bytecode::code::Code> {
        std::iter::once(&unit.main).chain(unit.functions.iter().map(|f| &f.code)).collect()
    }

    /// Testable property 1: every emitted word has a matching position.
    #[test]
    fn instructions_and_positions_have_equal_length() {
        let unit = compile("function f(x) { if (x) { return 1; } return 2; } return f(true);");
        for code in all_codes(&unit) {
            assert_eq!(code.instructions.len(), code.positions.len());
        }
    }

    /// Testable property 2: every jump operand lands on an opcode boundary.
    #[test]
    fn jump_targets_land_on_instruction_boundaries() {
        let unit = compile(
            "var x = 0; while (x < 5) { if (x == 2) { x += 1; continue; } if (x == 4) { break; } x += 1; } return x;",
        );
        for code in all_codes(&unit) {
            let mut boundaries = std::collections::HashSet::new();
            let mut ip = 0;
            while ip < code.instructions.len() {
                boundaries.insert(ip);
                let op = Op::from_u16(code.instructions[ip]).expect("malformed opcode word");
                ip += op.width();
            }
            let mut ip = 0;
            while ip < code.instructions.len() {
                let op = Op::from_u16(code.instructions[ip]).unwrap();
                if matches!(op, Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse) {
                    let target = code.instructions[ip + 1] as usize;
                    assert!(boundaries.contains(&target), "jump target {target} is not an instruction boundary");
                }
                ip += op.width();
            }
        }
    }

    /// Testable property 3: every function body ends in a return opcode.
    #[test]
    fn every_function_body_ends_in_a_return_opcode() {
        let unit = compile("function f() { var y = 1; } function g() { return 9; } return 0;");
        for code in all_codes(&unit) {
            let mut ip = 0;
            let mut last_op = None;
            while ip < code.instructions.len() {
                let op = Op::from_u16(code.instructions[ip]).unwrap();
                last_op = Some(op);
                ip += op.width();
            }
            assert!(matches!(last_op, Some(Op::ReturnValue) | Some(Op::ReturnNothing)), "body ended in {last_op:?}");
        }
    }

    /// Testable property 4: `break`/`continue` outside a loop is rejected.
    #[test]
    fn break_outside_loop_is_a_compile_error() {
        assert!(compile_source("break;", "test.ape", CompilerConfig::default(), None, &[]).is_err());
    }

    #[test]
    fn continue_outside_loop_is_a_compile_error() {
        assert!(compile_source("continue;", "test.ape", CompilerConfig::default(), None, &[]).is_err());
    }

    /// Top-level `return` is legal (the module body is itself a 0-param
    /// function, spec.md §8 scenarios 1-6 all return from module scope).
    #[test]
    fn top_level_return_compiles() {
        assert!(compile_source("return 1;", "test.ape", CompilerConfig::default(), None, &[]).is_ok());
    }

    #[test]
    fn include_outside_module_root_is_a_compile_error() {
        let err = compile_source("function f() { include \"x\"; }", "test.ape", CompilerConfig::default(), None, &[]).unwrap_err();
        assert!(!err.is_empty());
    }
}
