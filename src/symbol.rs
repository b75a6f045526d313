//! Lexical scoping with block levels and module globals (spec.md §3 Symbol
//! & symbol table, §4.4.2). Grounded on `ouros/src/namespace.rs`'s
//! scope-stack shape, adapted to carry symbol kind/assignability rather
//! than bare slot indices.

use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    ModuleGlobal,
    ContextGlobal,
    Local,
    Free,
    Function,
    This,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub index: u16,
    pub assignable: bool,
}

#[derive(Default)]
struct Scope {
    table: AHashMap<String, Symbol>,
    /// Sequential index offset for the next definition in this scope.
    next_index: u16,
}

/// A free variable captured across a function boundary: `outer` is the
/// symbol as resolved in the enclosing table, `index` is its slot within
/// the capturing function's free-variable list.
#[derive(Debug, Clone)]
pub struct FreeSymbol {
    pub outer: Symbol,
    pub index: u16,
}

/// A stack of block-scopes over an optional outer table. The outermost
/// table in a file additionally owns the module-global namespace; a
/// function's table is linked to its defining scope's table via `outer`.
pub struct SymbolTable<'p> {
    scopes: Vec<Scope>,
    outer: Option<&'p SymbolTable<'p>>,
    /// True for the single table representing a function's own top scope
    /// (as opposed to a nested block within it) — resolving past this
    /// boundary produces a free variable rather than a direct local.
    pub is_function_boundary: bool,
    pub free_symbols: std::cell::RefCell<Vec<FreeSymbol>>,
    /// Context-global bindings, visible from every module in a context.
    /// Only meaningful on the root table (no `outer`).
    context_globals: AHashMap<String, u16>,
}

impl<'p> SymbolTable<'p> {
    pub fn new_root(global_offset: u16) -> Self {
        let mut scopes = vec![Scope::default()];
        scopes[0].next_index = global_offset;
        Self {
            scopes,
            outer: None,
            // The module's top-level statements count as a function with 0
            // params (bytecode/code.rs's `Code` doc comment) and compile to
            // a body that always ends in RETURNVALUE/RETURNNOTHING just
            // like any other function — so a bare top-level `return` must
            // be legal. Harmless for free-variable capture: that logic only
            // fires while walking `outer`, which the root table never has.
            is_function_boundary: true,
            free_symbols: std::cell::RefCell::new(Vec::new()),
            context_globals: AHashMap::new(),
        }
    }

    pub fn new_function_scope(outer: &'p SymbolTable<'p>) -> Self {
        Self {
            scopes: vec![Scope::default()],
            outer: Some(outer),
            is_function_boundary: true,
            free_symbols: std::cell::RefCell::new(Vec::new()),
            context_globals: AHashMap::new(),
        }
    }

    /// A nested block inherits the enclosing scope's running slot counter
    /// rather than restarting at 0 — two simultaneously-live scopes (an
    /// outer local and a sibling-nested one) must never be handed the same
    /// stack slot.
    pub fn push_block_scope(&mut self) {
        let next_index = self.scopes.last().map(|s| s.next_index).unwrap_or(0);
        self.scopes.push(Scope { table: AHashMap::new(), next_index });
    }

    pub fn pop_block_scope(&mut self) {
        self.scopes.pop();
        assert!(!self.scopes.is_empty(), "popped the outermost scope of a symbol table");
    }

    pub fn is_top_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    /// True anywhere in the module's outermost table, including nested
    /// blocks: there is no separate stack-local storage outside a function
    /// body, so a `var` inside a top-level `if`/`while` still lands in the
    /// module-global array rather than colliding with a nonexistent
    /// top-level stack frame. Also what distinguishes the module root from
    /// a function's own table for constructs (`include`) that are only
    /// legal at the true top level — `is_function_boundary` can't serve
    /// that role since the root table sets it too (spec.md §4.4: the
    /// module body compiles like a 0-param function, so top-level `return`
    /// must be legal there as well).
    pub fn is_module_root(&self) -> bool {
        self.outer.is_none()
    }

    pub fn register_context_global(&mut self, name: &str, index: u16) {
        self.context_globals.insert(name.to_string(), index);
    }

    /// Defines a new symbol in the current (innermost) scope. Returns an
    /// error message if the name already exists in this exact scope
    /// (non-shadowing redefinition).
    pub fn define(&mut self, name: &str, assignable: bool) -> Result<Symbol, String> {
        let at_module_root = self.is_module_root();
        let scope = self.scopes.last_mut().expect("symbol table has no scopes");
        if scope.table.contains_key(name) {
            return Err(format!("symbol '{name}' is already defined in this scope"));
        }
        let kind = if at_module_root { SymbolKind::ModuleGlobal } else { SymbolKind::Local };
        let index = scope.next_index;
        scope.next_index += 1;
        let symbol = Symbol { name: name.to_string(), kind, index, assignable };
        scope.table.insert(name.to_string(), symbol.clone());
        Ok(symbol)
    }

    /// Defines the function's own name (for self-reference) or `this`.
    /// Neither occupies a local stack slot — both are read via dedicated
    /// opcodes (`CURRENTFUNCTION`, `GETTHIS`) rather than `GETLOCAL`, so
    /// this does not advance `next_index`.
    pub fn define_special(&mut self, name: &str, kind: SymbolKind) -> Symbol {
        let scope = self.scopes.last_mut().expect("symbol table has no scopes");
        let symbol = Symbol { name: name.to_string(), kind, index: 0, assignable: false };
        scope.table.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Number of definitions made directly in this table across all of its
    /// block scopes reached so far (used as `num_locals` for a function).
    pub fn definition_count(&self) -> u16 {
        self.scopes.iter().map(|s| s.next_index).max().unwrap_or(0)
    }

    fn find_local(&self, name: &str) -> Option<Symbol> {
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.table.get(name) {
                return Some(sym.clone());
            }
        }
        None
    }

    /// Resolves `name`, walking inner→outer. Crossing a function boundary
    /// records the outer symbol as a free variable of the inner function
    /// and returns a synthesized `Free` symbol in its place.
    pub fn resolve(&self, name: &str) -> Option<Symbol> {
        if let Some(sym) = self.find_local(name) {
            return Some(sym);
        }
        if let Some(idx) = self.context_globals.get(name) {
            return Some(Symbol { name: name.to_string(), kind: SymbolKind::ContextGlobal, index: *idx, assignable: false });
        }
        let outer = self.outer?;
        let outer_sym = outer.resolve(name)?;
        if matches!(outer_sym.kind, SymbolKind::ModuleGlobal | SymbolKind::ContextGlobal) {
            // Globals are reachable directly; no capture needed.
            return Some(outer_sym);
        }
        if self.is_function_boundary {
            let mut free = self.free_symbols.borrow_mut();
            if let Some(existing) = free.iter().find(|f| f.outer.name == name) {
                return Some(Symbol { name: name.to_string(), kind: SymbolKind::Free, index: existing.index, assignable: outer_sym.assignable });
            }
            let index = free.len() as u16;
            free.push(FreeSymbol { outer: outer_sym.clone(), index });
            Some(Symbol { name: name.to_string(), kind: SymbolKind::Free, index, assignable: outer_sym.assignable })
        } else {
            Some(outer_sym)
        }
    }

    pub fn drain_free_symbols(&self) -> Vec<FreeSymbol> {
        self.free_symbols.borrow_mut().drain(..).collect()
    }

    /// Names and slot indices of every `ModuleGlobal` defined directly in
    /// this table, used to expose a compiled module's top-level bindings
    /// to whoever includes it.
    pub fn module_global_names(&self) -> Vec<(String, u16)> {
        self.scopes
            .iter()
            .flat_map(|scope| scope.table.values())
            .filter(|sym| sym.kind == SymbolKind::ModuleGlobal)
            .map(|sym| (sym.name.clone(), sym.index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_module_globals_at_root() {
        let mut table = SymbolTable::new_root(0);
        let sym = table.define("x", true).unwrap();
        assert_eq!(sym.kind, SymbolKind::ModuleGlobal);
        assert_eq!(sym.index, 0);
    }

    #[test]
    fn redefinition_in_same_scope_is_rejected() {
        let mut table = SymbolTable::new_root(0);
        table.define("x", true).unwrap();
        assert!(table.define("x", true).is_err());
    }

    #[test]
    fn crossing_function_boundary_captures_free_variable() {
        // Module globals resolve directly (see `module_globals_are_not_captured_as_free`
        // below) so capture only fires for a genuine local: define `x` in an
        // intermediate function scope, then resolve it from a function
        // nested inside that one.
        let root = SymbolTable::new_root(0);
        let mut middle = SymbolTable::new_function_scope(&root);
        middle.define("x", true).unwrap();
        let inner = SymbolTable::new_function_scope(&middle);
        let resolved = inner.resolve("x").unwrap();
        assert_eq!(resolved.kind, SymbolKind::Free);
        assert_eq!(inner.drain_free_symbols().len(), 1);
    }

    #[test]
    fn module_globals_are_not_captured_as_free() {
        let mut outer = SymbolTable::new_root(0);
        outer.define("x", true).unwrap();
        let inner = SymbolTable::new_function_scope(&outer);
        let resolved = inner.resolve("x").unwrap();
        assert_eq!(resolved.kind, SymbolKind::ModuleGlobal);
        assert!(inner.drain_free_symbols().is_empty());
    }
}
