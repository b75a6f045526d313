//! Full compile+run scenarios against the public `Context` API (spec.md §8
//! "End-to-end scenarios (literal)").

use ape_core::heap::{ObjData, StringObj};
use ape_core::{Context, ExecutionConfig, HostValue, StdHostCallbacks, Value};
use pretty_assertions::assert_eq;

fn context() -> Context<StdHostCallbacks> {
    let mut ctx = Context::new(StdHostCallbacks, ExecutionConfig::default());
    // Template strings lower to a call to `tostring` (parser.rs); the core
    // itself ships no standard library, so the host installs one, same as
    // any other native (spec.md §6).
    ctx.register_native("tostring", |vm, args| {
        let v = args.first().copied().unwrap_or(Value::Null);
        let rendered = match v {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(_) | Value::Float(_) => {
                let n = v.as_f64().unwrap();
                if n.is_finite() && n.fract() == 0.0 {
                    format!("{}", n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Native(_) => "function".to_string(),
            Value::Heap(id) => match vm.heap().get(id) {
                ObjData::String(s) => s.bytes.clone(),
                _ => "object".to_string(),
            },
        };
        let id = vm.heap_mut().allocate(ObjData::String(StringObj::new(rendered)));
        Ok(Value::Heap(id))
    });
    ctx
}

fn run(source: &str) -> HostValue {
    context().execute_source(source, "test.ape").unwrap_or_else(|e| panic!("{}", e.render())).result
}

#[test]
fn string_concat_in_a_loop() {
    let result = run(r#"var s = ""; for (var i = 0; i < 3; i++) { s += i; } return s;"#);
    assert_eq!(result, HostValue::Str("012".to_string()));
}

#[test]
fn closure_capture() {
    let result = run("function adder(x) { return function(y) { return x + y; }; } const f = adder(10); return f(5);");
    assert_eq!(result, HostValue::Number(15.0));
}

#[test]
fn for_each_over_a_map_binds_the_key() {
    let result = run("const m = {a:1, b:2}; var t = 0; for (k in m) { t += m[k]; } return t;");
    assert_eq!(result, HostValue::Number(3.0));
}

#[test]
fn continue_inside_for_each_advances_past_the_current_element() {
    // Regression test: `continue`'s target must be the index increment, not
    // the loop test, or this never terminates (re-binds `x == 2` forever).
    let result = run("var t = 0; for (x in [1,2,3,4]) { if (x == 2) { continue; } t += x; } return t;");
    assert_eq!(result, HostValue::Number(8.0));
}

#[test]
fn recover_catches_division_by_zero() {
    let result = run("function f() { recover (e) { return e; } 1/0; } return f();");
    match result {
        HostValue::Error(message) => assert!(message.contains("division by zero"), "unexpected message: {message}"),
        other => panic!("expected an error value, got {other:?}"),
    }
}

#[test]
fn template_string_lowers_through_tostring() {
    let result = run("return `hi ${1+2}!`;");
    assert_eq!(result, HostValue::Str("hi 3!".to_string()));
}

#[test]
fn array_set_index_pads_with_null_and_length_reflects_it() {
    // spec.md §8 scenario 6: a bare (no-parens) `.length` lowers to the
    // `LEN` opcode (parser.rs's `parse_dot` produces an `Index` node for
    // it, same shape as `a["length"]`, but compiler.rs special-cases the
    // member name so it measures the receiver instead of indexing into it).
    let result = run("var a = [1,2,3]; a[10] = 99; return a.length;");
    assert_eq!(result, HostValue::Number(11.0));
}

#[test]
fn map_keys_that_compare_equal_share_one_slot_across_value_kinds() {
    // spec.md §4.6: map-key equality follows the language's own `==`, which
    // treats bools and numbers as interchangeable (`true == 1`, `1 == 1.0`).
    // Writing through each of those keys in turn must all land on the same
    // slot, not three distinct ones.
    let result = run("var m = {}; m[true] = 1; m[1] = 2; m[1.0] = 3; return m[true];");
    assert_eq!(result, HostValue::Number(3.0));
}

#[test]
fn division_by_zero_without_recover_is_a_runtime_error() {
    let err = context().execute_source("return 1/0;", "test.ape").unwrap_err();
    assert!(err.render().contains("division by zero"));
}

#[test]
fn host_registered_global_is_visible_without_prior_assignment() {
    let mut ctx = context();
    ctx.set_global("limit", ape_core::HostGlobal::Number(42.0));
    let outcome = ctx.execute_source("return limit;", "test.ape").unwrap();
    assert_eq!(outcome.result, HostValue::Number(42.0));
}

#[test]
fn native_function_can_be_called_from_script() {
    let mut ctx = context();
    ctx.register_native("double", |_vm, args| Ok(Value::Float(args[0].as_f64().unwrap_or(0.0) * 2.0)));
    let outcome = ctx.execute_source("return double(21);", "test.ape").unwrap();
    assert_eq!(outcome.result, HostValue::Number(42.0));
}
