use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::backend_traits::{CompilationError, CompilationResult};
use crate::log_parser;

/// A compiler message placed on a byte range of the document source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range<usize>,
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub source: String,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        })
    }
}

impl Diagnostic {
    pub fn error(range: Range<usize>, message: String, source: String) -> Self {
        Self {
            range,
            severity: DiagnosticSeverity::Error,
            message,
            source,
            line: None,
        }
    }

    pub fn warning(range: Range<usize>, message: String, source: String) -> Self {
        Self {
            range,
            severity: DiagnosticSeverity::Warning,
            message,
            source,
            line: None,
        }
    }

    fn on_line(mut self, line: Option<u32>) -> Self {
        self.line = line;
        self
    }
}

/// Diagnostics for `text` from a compile result. Errors without a line sit at
/// the start of the document; warnings without a line are dropped.
pub fn from_result(text: &str, main_file: &str, result: &CompilationResult) -> Vec<Diagnostic> {
    let source = result.backend.map_or("latex", |b| b.as_str()).to_string();
    let mut diagnostics = Vec::new();

    for error in result.errors.iter().filter(|e| concerns(e, main_file)) {
        let range = error
            .line
            .and_then(|line| line_range(text, line, error.column))
            .unwrap_or(0..0);
        let diagnostic = Diagnostic::error(range, error.message.clone(), source.clone());
        diagnostics.push(diagnostic.on_line(error.line));
    }

    for warning in &result.warnings {
        let Some(line) = log_parser::warning_line(warning) else { continue };
        if let Some(range) = line_range(text, line, None) {
            let diagnostic = Diagnostic::warning(range, warning.clone(), source.clone());
            diagnostics.push(diagnostic.on_line(Some(line)));
        }
    }

    diagnostics
}

fn concerns(error: &CompilationError, main_file: &str) -> bool {
    error
        .file
        .as_deref()
        .is_none_or(|file| file == main_file || file.ends_with(&format!("/{}", main_file)))
}

/// Byte range of `line` (1-based), starting at `column` when given.
pub fn line_range(text: &str, line: u32, column: Option<u32>) -> Option<Range<usize>> {
    let line_index = line.checked_sub(1)? as usize;
    let start = if line_index == 0 {
        0
    } else {
        text.match_indices('\n').nth(line_index - 1).map(|(i, _)| i + 1)?
    };
    let end = text[start..].find('\n').map_or(text.len(), |i| start + i);

    let start = match column {
        Some(column) if column > 1 => text[start..end]
            .char_indices()
            .nth(column as usize - 1)
            .map_or(end, |(i, _)| start + i),
        _ => start,
    };
    Some(start..end)
}
