//! Error kinds, the bounded compile-error queue, and traceback rendering
//! (spec.md §7).

use std::fmt;

use crate::position::SourcePosition;

/// Messages are truncated at this many bytes, matching the original's
/// fixed-capacity error buffer (spec.md §7, SPEC_FULL.md §3).
const MAX_MESSAGE_BYTES: usize = 255;

/// The compile-error queue holds at most this many entries; further errors
/// are silently dropped (spec.md §7).
const MAX_ERRORS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parsing,
    Compilation,
    Runtime,
    Timeout,
    Allocation,
    /// An error raised from a native (host) callback.
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsing => "PARSING",
            Self::Compilation => "COMPILATION",
            Self::Runtime => "RUNTIME",
            Self::Timeout => "TIMEOUT",
            Self::Allocation => "ALLOCATION",
            Self::User => "USER",
        };
        f.write_str(s)
    }
}

/// One frame of a traceback: the function that was executing and the
/// position within it, recorded by walking the VM's frame chain from the
/// point of the fault outward (`original_source/error.c`,
/// `ape_traceback_appendfromvm`).
#[derive(Debug, Clone)]
pub struct TracebackEntry {
    pub function_name: String,
    pub position: SourcePosition,
}

#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub entries: Vec<TracebackEntry>,
}

impl Traceback {
    pub fn push(&mut self, function_name: impl Into<String>, position: SourcePosition) {
        self.entries.push(TracebackEntry { function_name: function_name.into(), position });
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{} in {}", entry.function_name, entry.position)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApeError {
    pub kind: ErrorKind,
    message: String,
    pub position: SourcePosition,
    pub traceback: Option<Traceback>,
}

impl ApeError {
    pub fn new(kind: ErrorKind, message: String, position: SourcePosition) -> Self {
        let mut message = message;
        if message.len() > MAX_MESSAGE_BYTES {
            let mut cut = MAX_MESSAGE_BYTES;
            while cut > 0 && !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self { kind, message, position, traceback: None }
    }

    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `<KIND> ERROR in "<file>" on <line>:<col>: <message>`, optionally
    /// preceded by the offending source line with a caret under the
    /// column, optionally followed by a traceback.
    pub fn render(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        if let Some(line) = self.position.file.line(self.position.line) {
            let _ = writeln!(out, "{line}");
            let _ = writeln!(out, "{}^", " ".repeat(self.position.column as usize));
        }
        let _ = write!(
            out,
            "{} ERROR in \"{}\" on {}:{}: {}",
            self.kind,
            self.position.file.path,
            self.position.line + 1,
            self.position.column + 1,
            self.message
        );
        if let Some(tb) = &self.traceback {
            if !tb.entries.is_empty() {
                out.push('\n');
                let _ = write!(out, "{tb}");
            }
        }
        out
    }
}

impl fmt::Display for ApeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for ApeError {}

/// Bounded queue of accumulated parse/compile errors. Overflow beyond
/// `MAX_ERRORS` is silently dropped, matching the original's fixed-capacity
/// error array.
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    errors: Vec<ApeError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ApeError) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(error);
        }
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = ApeError>) {
        for e in other {
            self.push(e);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ApeError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<ApeError> {
        self.errors
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

impl IntoIterator for ErrorList {
    type Item = ApeError;
    type IntoIter = std::vec::IntoIter<ApeError>;
    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
