//! Source positions and the per-file line table used for error rendering.

use std::fmt;
use std::rc::Rc;

/// A compilation unit's identity: its canonicalised path, the directory it
/// was resolved relative to, and the source split into lines for error
/// previews. Shared (via `Rc`) by every position that points into it.
#[derive(Debug, PartialEq, Eq)]
pub struct CompilationFile {
    /// Canonicalised path, e.g. `"lib/collections.ape"`.
    pub path: String,
    /// Directory prefix `path` was resolved against (used by `include`).
    pub dir: String,
    lines: Vec<String>,
}

impl CompilationFile {
    pub fn new(path: impl Into<String>, source: &str) -> Rc<Self> {
        let path = path.into();
        let dir = match path.rfind('/') {
            Some(idx) => path[..idx].to_string(),
            None => String::new(),
        };
        let lines = source.split('\n').map(|l| l.trim_end_matches('\r').to_string()).collect();
        Rc::new(Self { path, dir, lines })
    }

    /// Returns the given 0-indexed source line, if present.
    pub fn line(&self, index: u32) -> Option<&str> {
        self.lines.get(index as usize).map(String::as_str)
    }
}

/// `{file, line, column}`, attached to tokens, AST nodes, and every byte of
/// emitted bytecode via a parallel source-position array.
#[derive(Debug, Clone)]
pub struct SourcePosition {
    pub file: Rc<CompilationFile>,
    /// 0-indexed line number.
    pub line: u32,
    /// 0-indexed column number.
    pub column: u32,
}

impl SourcePosition {
    pub fn new(file: Rc<CompilationFile>, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }

    /// A placeholder position for synthesized nodes that have no source
    /// counterpart (e.g. compiler-inserted `@i`/`@source` locals).
    pub fn synthetic(file: Rc<CompilationFile>) -> Self {
        Self { file, line: 0, column: 0 }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.path, self.line + 1, self.column + 1)
    }
}

impl PartialEq for SourcePosition {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.file, &other.file) && self.line == other.line && self.column == other.column
    }
}
