pub mod ansi;
pub mod json;

use crate::ast::Span;
use crate::emitter::EmitError;
use crate::lexer::LexError;
use crate::parser::ParseError;
use crate::value::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    /// No stage reports warnings yet; the renderers already handle them.
    #[allow(dead_code)]
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// One reportable problem from any pipeline stage, renderable as ANSI,
/// plain text, or NDJSON.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Line and column of a byte offset, both 1-based. Programs are usually
/// one-liners, so this scans instead of keeping a line table.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for b in source.bytes().take(offset) {
        if b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Full text of a 1-based line.
pub fn line_text(source: &str, line: usize) -> &str {
    source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
}

// ---- From impls for the stage error types ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        let span = Span {
            start: e.position,
            end: e.position + e.snippet.len().max(1),
        };
        Diagnostic::error(format!("unexpected token '{}'", e.snippet))
            .with_code(e.code)
            .with_span(span, "here")
            .with_suggestion(e.suggestion.clone())
    }
}

impl From<&ParseError> for Diagnostic {
    fn from(e: &ParseError) -> Self {
        Diagnostic::error(&e.message)
            .with_code(e.code)
            .with_span(e.span, "here")
            .with_note(format!("at token index {}", e.position))
    }
}

impl From<&EmitError> for Diagnostic {
    fn from(e: &EmitError) -> Self {
        let (code, span) = match e {
            EmitError::InvalidStoreDestination { span } => ("KN-C001", *span),
            EmitError::IntegerOverflow { span, .. } => ("KN-C002", *span),
        };
        Diagnostic::error(e.to_string()).with_code(code).with_span(span, "here")
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        let code = match e {
            RuntimeError::BlockNotAllowed => "KN-R001",
            RuntimeError::BadAscii => "KN-R002",
            RuntimeError::BadAdd(_) => "KN-R003",
            RuntimeError::BadSub(_) => "KN-R004",
            RuntimeError::BadMult(_) => "KN-R005",
            RuntimeError::BadDiv(_) => "KN-R006",
            RuntimeError::DivisionByZero => "KN-R007",
            RuntimeError::BadMod(_) => "KN-R008",
            RuntimeError::BadExp(_) => "KN-R009",
            RuntimeError::BadHead(_) => "KN-R010",
            RuntimeError::BadTail(_) => "KN-R011",
            RuntimeError::BadGet(_) => "KN-R012",
            RuntimeError::BadSet(_) => "KN-R013",
            RuntimeError::OutOfRange { .. } => "KN-R014",
            RuntimeError::BadCall(_) => "KN-R015",
            RuntimeError::InvalidOpcode => "KN-R016",
            RuntimeError::StackUnderflow => "KN-R017",
            RuntimeError::Io(_) => "KN-R018",
        };
        Diagnostic::error(e.to_string()).with_code(code)
    }
}
