//! Round-trip laws and boundary behaviors against the public API (spec.md
//! §8). The bytecode-shape invariants (positions array length, jump target
//! validity, function-body return termination, break/continue/return
//! scoping) are white-box and live in `bytecode::compiler`'s and `vm`'s own
//! `#[cfg(test)]` modules instead, since they need private struct fields.

use std::collections::HashMap;

use ape_core::bytecode::compiler::{self, decode_number};
use ape_core::bytecode::code::Constant;
use ape_core::{Context, CompilerConfig, ExecutionConfig, HostCallbacks, HostValue};
use pretty_assertions::assert_eq;

fn compile(source: &str) -> ape_core::CompilationUnit {
    compiler::compile_source(source, "test.ape", CompilerConfig::default(), None, &[]).unwrap()
}

fn run(source: &str) -> HostValue {
    let mut ctx = Context::new(ape_core::StdHostCallbacks, ExecutionConfig::default());
    ctx.execute_source(source, "test.ape").unwrap_or_else(|e| panic!("{}", e.render())).result
}

// --- Round-trip laws ---------------------------------------------------

#[test]
fn literal_double_round_trips_bit_exactly() {
    for literal in ["3.5", "0.1", "1e100", "-2.25", "0", "12345.6789"] {
        let unit = compile(&format!("const x = {literal}; return x;"));
        let words = unit.main.instructions.as_slice();
        // MKNUMBER is the only way a numeric literal enters the module
        // body; find it and decode its 4 operand words.
        let mut ip = 0;
        let mut found = None;
        while ip < words.len() {
            let op = ape_core::bytecode::Op::from_u16(words[ip]).unwrap();
            if op == ape_core::bytecode::Op::MkNumber {
                found = Some(decode_number(&words[ip + 1..ip + 5]));
                break;
            }
            ip += op.width();
        }
        let decoded = found.expect("literal must compile through MKNUMBER");
        let parsed: f64 = literal.parse().unwrap();
        assert_eq!(decoded.to_bits(), parsed.to_bits(), "literal {literal} did not round-trip bit-exactly");
    }
}

#[test]
fn duplicate_string_literals_share_one_constant_pool_slot() {
    let unit = compile(r#"const a = "hello"; const b = "hello"; const c = "world"; return 0;"#);
    let strings: Vec<&str> = unit
        .constants
        .iter()
        .filter_map(|c| match c {
            Constant::Str(s) => Some(s.as_ref()),
            Constant::Function(_) => None,
        })
        .collect();
    let hello_count = strings.iter().filter(|s| **s == "hello").count();
    assert_eq!(hello_count, 1, "\"hello\" should be interned once, found in constants: {strings:?}");
    assert!(strings.contains(&"world"));
}

#[test]
fn optimizer_constant_folding_is_idempotent() {
    let config = CompilerConfig { constant_folding: true, ..CompilerConfig::default() };
    let source = "return 1 + 2 * 3 - 4;";
    let once = compiler::compile_source(source, "test.ape", config, None, &[]).unwrap();
    let twice = compiler::compile_source(source, "test.ape", config, None, &[]).unwrap();
    // Folding the same AST twice (two independent compiles of identical
    // source under the same config) must yield the identical instruction
    // stream -- a stand-in for "folding twice == folding once" since the
    // compiler doesn't expose a way to re-run the pass on an already-folded
    // AST directly.
    assert_eq!(once.main.instructions, twice.main.instructions);
}

// --- Boundary behaviors --------------------------------------------------

#[test]
fn array_get_index_negative_counts_from_the_end() {
    assert_eq!(run("var a = [1,2,3]; return a[-1];"), HostValue::Number(3.0));
}

#[test]
fn array_get_index_out_of_range_is_null() {
    assert_eq!(run("var a = [1,2,3]; return a[99];"), HostValue::Null);
}

#[test]
fn array_set_index_beyond_length_pads_with_null() {
    let result = run("var a = [1,2,3]; a[5] = 9; return a;");
    assert_eq!(
        result,
        HostValue::Array(vec![
            HostValue::Number(1.0),
            HostValue::Number(2.0),
            HostValue::Number(3.0),
            HostValue::Null,
            HostValue::Null,
            HostValue::Number(9.0),
        ])
    );
}

#[test]
fn map_get_index_missing_key_is_null() {
    assert_eq!(run(r#"const m = {a: 1}; return m["missing"];"#), HostValue::Null);
}

#[test]
fn division_by_zero_is_a_runtime_error_not_infinity() {
    let mut ctx = Context::new(ape_core::StdHostCallbacks, ExecutionConfig::default());
    let err = ctx.execute_source("return 1/0;", "test.ape").unwrap_err();
    assert!(err.render().contains("division by zero"));
}

#[test]
fn modulus_by_zero_is_a_runtime_error() {
    let mut ctx = Context::new(ape_core::StdHostCallbacks, ExecutionConfig::default());
    let err = ctx.execute_source("return 1 % 0;", "test.ape").unwrap_err();
    assert!(err.render().contains("division by zero"));
}

#[test]
fn recover_body_not_ending_in_return_is_a_compile_error() {
    let result = compiler::compile_source("function f() { recover (e) { var x = e; } return 1; }", "test.ape", CompilerConfig::default(), None, &[]);
    assert!(result.is_err());
}

/// In-memory `HostCallbacks` for exercising `include` without touching the
/// filesystem.
struct MapCallbacks(HashMap<String, String>);

impl HostCallbacks for MapCallbacks {
    fn read_file(&mut self, path: &str) -> Result<String, String> {
        self.0.get(path).cloned().ok_or_else(|| format!("no such module: {path}"))
    }
}

#[test]
fn including_the_same_module_twice_is_a_compile_error() {
    let mut files = HashMap::new();
    files.insert("a.ape".to_string(), "const a_value = 1;".to_string());
    let mut ctx = Context::new(MapCallbacks(files), ExecutionConfig::default());
    let err = ctx.execute_source(r#"include "a.ape"; include "a.ape"; return 0;"#, "test.ape").unwrap_err();
    assert!(matches!(err, ape_core::ContextError::Compile(_)));
}

#[test]
fn cyclic_include_is_a_compile_error() {
    let mut files = HashMap::new();
    files.insert("a.ape".to_string(), r#"include "b.ape";"#.to_string());
    files.insert("b.ape".to_string(), r#"include "a.ape";"#.to_string());
    let mut ctx = Context::new(MapCallbacks(files), ExecutionConfig::default());
    let err = ctx.execute_source(r#"include "a.ape"; return 0;"#, "test.ape").unwrap_err();
    assert!(matches!(err, ape_core::ContextError::Compile(_)));
}
