//! Host-embedding surface (spec.md §6): a `Context` owns the bindings a
//! host installs before running any script and drives repeated compile +
//! execute cycles against them.
//!
//! Each `execute_source`/`execute_file` call compiles its own
//! `CompilationUnit` and runs it against a freshly built `Vm` — mirroring
//! `ouros::Runner`, which keeps only the parsed program across calls and
//! builds a new heap/VM inside every `run()` rather than keeping one
//! long-lived VM borrowing one compilation alive forever. A `Vm<'u>`
//! borrows its `CompilationUnit` by reference, so a type trying to own both
//! at once (across separate calls, with separate compilations) runs into a
//! self-referential struct; scoping the `Vm` to the lifetime of a single
//! `execute_*` call sidesteps that rather than reaching for unsafe
//! self-referencing machinery. Module-global state from one call therefore
//! does not persist into the next — only host-registered bindings
//! (`register_native`, `set_global`) do, because `Context` reinstalls them
//! into the fresh `Vm` on every call.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::code::CompilationUnit;
use crate::bytecode::compiler::{self, CompilerConfig, ModuleSource};
use crate::errors::{ApeError, ErrorList};
use crate::heap::{ObjData, StringObj};
use crate::resource::ExecutionConfig;
use crate::value::Value;
use crate::vm::{NativeFn, Vm};

/// Filesystem/stdout hooks the core consults but never implements itself
/// (spec.md §6 host-to-core surface). Grounded on `ouros::io::PrintWriter`'s
/// shape: a trait with one load-bearing method (`read_file`, needed by
/// `include`) and default no-op/stdout conveniences a host can skip past.
pub trait HostCallbacks {
    /// Resolves `path` (already collapsed by the `include` resolver) to
    /// source text. The only method the compiler itself calls.
    fn read_file(&mut self, path: &str) -> Result<String, String>;

    /// Convenience hook for natives the host installs that need to write a
    /// file; the core's compile/execute contract never calls this itself
    /// (spec.md §6: "used by built-ins... that the host installs").
    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), String> {
        let _ = (path, contents);
        Err("write_file is not supported by this host".to_string())
    }

    /// Convenience hook for a host-installed `print`-style native.
    fn stdout_write(&mut self, text: &str) {
        print!("{text}");
    }
}

/// Reads `include`d modules from the real filesystem and writes `print`
/// output to real stdout — the default a host reaches for unless it needs
/// to sandbox I/O.
#[derive(Debug, Default)]
pub struct StdHostCallbacks;

impl HostCallbacks for StdHostCallbacks {
    fn read_file(&mut self, path: &str) -> Result<String, String> {
        std::fs::read_to_string(path).map_err(|e| e.to_string())
    }

    fn write_file(&mut self, path: &str, contents: &str) -> Result<(), String> {
        std::fs::write(path, contents).map_err(|e| e.to_string())
    }
}

/// Adapts a host's `HostCallbacks` (which needs `&mut self`, since it may
/// buffer or track state) to the compiler's `ModuleSource` (which, being
/// called from deep inside a borrow-heavy recursive descent, only offers
/// `&self`).
struct CallbacksModuleSource<'a, C: HostCallbacks> {
    callbacks: &'a RefCell<&'a mut C>,
}

impl<'a, C: HostCallbacks> ModuleSource for CallbacksModuleSource<'a, C> {
    fn read_module(&self, canonical_path: &str) -> Result<String, String> {
        self.callbacks.borrow_mut().read_file(canonical_path)
    }
}

/// A value a host binds under a global name before compiling a script,
/// either a plain constant or a native function (spec.md §6 "install a
/// native function under a given global name" / "set a global by name").
/// Distinct from `Value`: it must survive across `execute_*` calls, each of
/// which builds a fresh heap, so a `Value::Heap` id from a previous run
/// would already be dangling.
#[derive(Clone)]
pub enum HostGlobal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Native(Rc<NativeFn>),
}

impl HostGlobal {
    fn install(&self, vm: &mut Vm, index: u16) {
        let value = match self {
            HostGlobal::Null => Value::Null,
            HostGlobal::Bool(b) => Value::Bool(*b),
            HostGlobal::Number(n) => Value::Float(*n),
            HostGlobal::Str(s) => {
                let id = vm.heap_mut().allocate(ObjData::String(StringObj::new(s.clone())));
                Value::Heap(id)
            }
            HostGlobal::Native(f) => {
                let id = vm.register_native(f.clone());
                Value::Native(id)
            }
        };
        vm.set_global(index, value);
    }
}

struct Binding {
    name: String,
    value: HostGlobal,
}

/// An executed program's result, fully materialized off the heap so it
/// outlives the `Vm` that produced it (the same reason `ouros::Runner::run`
/// returns an owned `Object` rather than an internal `Value`).
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    /// An `ApeError` captured by a `recover` block and returned as a plain
    /// value (spec.md §8 end-to-end scenario 4): the rendered message, so a
    /// host can inspect what went wrong without reaching back into the
    /// dropped `Vm`'s heap.
    Error(String),
    /// A script function, native function, or external host handle: the
    /// core has no host-meaningful representation to offer beyond "it
    /// exists".
    Opaque(&'static str),
}

/// Caps `render_value`'s recursion so a script-constructed cyclic structure
/// (an array containing itself) can't recurse forever; not a spec
/// requirement, just a guard against a program that manages to build one
/// despite `SETINDEX`/`MAPEND` never doing so on their own.
const MAX_RENDER_DEPTH: usize = 64;

fn render_value(vm: &Vm, value: Value, depth: usize) -> HostValue {
    if depth > MAX_RENDER_DEPTH {
        return HostValue::Opaque("max-depth");
    }
    match value {
        Value::Null => HostValue::Null,
        Value::Bool(b) => HostValue::Bool(b),
        Value::Int(_) | Value::Float(_) => HostValue::Number(value.as_f64().unwrap()),
        Value::Native(_) => HostValue::Opaque("function"),
        Value::Heap(id) => match vm.heap().get(id) {
            ObjData::String(s) => HostValue::Str(s.bytes.clone()),
            ObjData::Array(items) => HostValue::Array(items.iter().map(|v| render_value(vm, *v, depth + 1)).collect()),
            ObjData::Map(m) => {
                HostValue::Map(m.entries.iter().map(|(k, v)| (render_value(vm, *k, depth + 1), render_value(vm, *v, depth + 1))).collect())
            }
            ObjData::Function(_) => HostValue::Opaque("function"),
            ObjData::Error(e) => HostValue::Error(e.inner.message().to_string()),
            ObjData::External(_) => HostValue::Opaque("external"),
        },
    }
}

/// What one `execute_source`/`execute_file` call produced: the last
/// popped value (spec.md glossary "last popped", surfaced when the
/// top-level program ends on a bare expression) plus every error a
/// `recover` caught along the way, most recent last.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: HostValue,
    pub recovered_errors: Vec<ApeError>,
}

/// Either stage a program can fail at: compilation (a bounded batch of
/// parse/compile errors) or execution (the single fatal error that escaped
/// every `recover` in scope).
#[derive(Debug)]
pub enum ContextError {
    Compile(ErrorList),
    Runtime(ApeError),
}

impl ContextError {
    /// Renders every contained error via `ApeError::render` (spec.md §7),
    /// one per line.
    pub fn render(&self) -> String {
        match self {
            ContextError::Compile(errors) => errors.to_string(),
            ContextError::Runtime(error) => error.render(),
        }
    }
}

/// Owns host bindings and drives compile+execute cycles against them
/// (spec.md §6). `C` is the host's `HostCallbacks` implementation.
pub struct Context<C: HostCallbacks> {
    callbacks: C,
    compiler_config: CompilerConfig,
    exec_config: ExecutionConfig,
    bindings: Vec<Binding>,
}

impl<C: HostCallbacks> Context<C> {
    pub fn new(callbacks: C, exec_config: ExecutionConfig) -> Self {
        Self { callbacks, compiler_config: CompilerConfig::default(), exec_config, bindings: Vec::new() }
    }

    pub fn with_compiler_config(mut self, config: CompilerConfig) -> Self {
        self.compiler_config = config;
        self
    }

    /// Installs a native function under `name`, visible to every script
    /// subsequently compiled through this context. Replaces a binding
    /// previously registered under the same name.
    pub fn register_native(&mut self, name: impl Into<String>, f: impl Fn(&mut Vm, &[Value]) -> Result<Value, ApeError> + 'static) {
        self.bind(name, HostGlobal::Native(Rc::new(f)));
    }

    /// Sets a plain-value global visible to every script subsequently
    /// compiled through this context.
    pub fn set_global(&mut self, name: impl Into<String>, value: HostGlobal) {
        self.bind(name, value);
    }

    fn bind(&mut self, name: impl Into<String>, value: HostGlobal) {
        let name = name.into();
        match self.bindings.iter_mut().find(|b| b.name == name) {
            Some(existing) => existing.value = value,
            None => self.bindings.push(Binding { name, value }),
        }
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    fn compile(&mut self, source: &str, file_path: &str) -> Result<CompilationUnit, ContextError> {
        let names: Vec<&str> = self.bindings.iter().map(|b| b.name.as_str()).collect();
        let cell = RefCell::new(&mut self.callbacks);
        let loader = CallbacksModuleSource { callbacks: &cell };
        compiler::compile_source(source, file_path, self.compiler_config, Some(&loader), &names).map_err(ContextError::Compile)
    }

    /// Compiles `source` and runs it to completion.
    pub fn execute_source(&mut self, source: &str, file_path: &str) -> Result<ExecutionOutcome, ContextError> {
        let unit = self.compile(source, file_path)?;
        let mut vm = Vm::new(&unit, self.exec_config.clone());
        for (index, binding) in self.bindings.iter().enumerate() {
            binding.value.install(&mut vm, index as u16);
        }
        let result = vm.run().map_err(ContextError::Runtime)?;
        let result = render_value(&vm, result, 0);
        let recovered_errors = vm.errors().iter().cloned().collect();
        Ok(ExecutionOutcome { result, recovered_errors })
    }

    /// Reads `path` via `HostCallbacks::read_file` and executes it.
    pub fn execute_file(&mut self, path: &str) -> Result<ExecutionOutcome, ContextError> {
        let source = self.callbacks.read_file(path).map_err(|msg| {
            ContextError::Runtime(ApeError::new(
                crate::errors::ErrorKind::Runtime,
                format!("cannot read \"{path}\": {msg}"),
                crate::position::SourcePosition::synthetic(crate::position::CompilationFile::new(path, "")),
            ))
        })?;
        self.execute_source(&source, path)
    }
}
