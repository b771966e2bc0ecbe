//! Error and diagnostic types.
//!
//! Runtime unwinding is unified under [`RunError`]: `die` carries an arbitrary
//! scalar payload and is caught by the nearest `eval` boundary; `return` and
//! loop-control signals unwind through closure and `eval` frames to the frame
//! or loop that owns them; resource errors are never caught by `eval`.
//!
//! Compile-time problems are [`Diagnostic`]s with a `#line`-adjusted position.

use std::fmt;

use strum::{Display, IntoStaticStr};

use crate::{resource::ResourceError, value::Value};

/// Result alias for operations that can unwind.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Unwinding signal raised during execution.
#[derive(Debug)]
pub(crate) enum RunError {
    /// `die` payload: the error scalar (usually a string, possibly a blessed ref).
    Die(Value),
    /// `return` unwinding to the owning sub frame, carrying the return value.
    Return(Value),
    /// `last`/`next`/`redo` that did not resolve inside its own frame.
    Loop(LoopSignal),
    /// `exit EXPR` — unwinds everything; END blocks still run.
    Exit(i32),
    /// Resource limit hit; not catchable by `eval`.
    Resource(ResourceError),
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}

/// A loop-control transfer in flight.
#[derive(Debug, Clone)]
pub(crate) struct LoopSignal {
    pub kind: LoopKind,
    /// Target label, or `None` for the innermost enclosing loop.
    pub label: Option<std::rc::Rc<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum LoopKind {
    Last,
    Next,
    Redo,
}

/// One frame of an unhandled-exception stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub package: String,
    pub file: String,
    pub line: u32,
    /// Fully qualified sub name; `None` for the top-level program frame.
    pub sub_name: Option<String>,
}

/// An unhandled runtime exception surfaced to the embedder.
#[derive(Debug, Clone)]
pub struct Exception {
    /// The stringified `die` payload (already location-suffixed when the
    /// payload was a string without a trailing newline).
    pub message: String,
    /// Innermost frame first.
    pub frames: Vec<StackFrame>,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.message.ends_with('\n') {
            writeln!(f)?;
        }
        for frame in &self.frames {
            if let Some(name) = &frame.sub_name {
                writeln!(f, "    {} called at {} line {}", name, frame.file, frame.line)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

impl Exception {
    pub(crate) fn new(message: String) -> Self {
        Self { message, frames: Vec::new() }
    }
}

/// Severity of a compile-time diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Severity {
    Warning,
    Error,
}

/// A compile-time diagnostic with `#line`-adjusted position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {} line {}.", self.message, self.file, self.line)
    }
}

/// A parse or code-generation failure. Fatal to the containing compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseError {
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self { message: message.into(), file: file.into(), line }
    }

    pub(crate) fn into_diagnostic(self) -> Diagnostic {
        Diagnostic { severity: Severity::Error, message: self.message, file: self.file, line: self.line }
    }
}

pub(crate) type ParseResult<T> = Result<T, ParseError>;

/// Appends Perl's ` at FILE line N.\n` suffix to a die/warn message unless the
/// message already ends with a newline.
pub(crate) fn with_location_suffix(message: &str, file: &str, line: u32) -> String {
    if message.ends_with('\n') {
        message.to_string()
    } else {
        format!("{message} at {file} line {line}.\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_suffix_respects_trailing_newline() {
        assert_eq!(with_location_suffix("boom", "x.pl", 3), "boom at x.pl line 3.\n");
        assert_eq!(with_location_suffix("boom\n", "x.pl", 3), "boom\n");
    }

    #[test]
    fn diagnostic_display_matches_perl_wording() {
        let d = Diagnostic {
            severity: Severity::Error,
            message: "syntax error".to_string(),
            file: "t.pl".to_string(),
            line: 7,
        };
        assert_eq!(d.to_string(), "syntax error at t.pl line 7.");
    }
}
