use std::sync::LazyLock;

use regex::Regex;

use crate::backend_traits::CompilationError;

/// How many lines after a `! message` we look for the `l.<n>` context line.
const CONTEXT_LOOKAHEAD: usize = 8;

static FILE_LINE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<file>[^:\s][^:]*\.(?:tex|sty|cls|bib|ltx|dtx))",
        r":(?P<line>\d+): (?P<message>.+)$",
    ))
    .expect("file-line-error pattern")
});

static BANG_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^! (?P<message>.+)$").expect("error pattern"));

static CONTEXT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^l\.(?P<line>\d+)").expect("context pattern"));

static INPUT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"on input line (?P<line>\d+)").expect("input line pattern"));

static WARNING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:on input line|at lines?) (?P<line>\d+)").expect("warning line pattern")
});

static WARNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:LaTeX|Package \S+|Class \S+|LaTeX Font) Warning: .+$",
        r"|^(?:Overfull|Underfull) \\[hv]box .+$",
    ))
    .expect("warning pattern")
});

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedLog {
    pub errors: Vec<CompilationError>,
    pub warnings: Vec<String>,
}

/// Extracts diagnostics from a TeX log, in the order they were reported.
pub fn parse_log(log: &str) -> ParsedLog {
    let lines: Vec<&str> = log.lines().collect();
    let mut parsed = ParsedLog::default();

    for (idx, raw) in lines.iter().enumerate() {
        let line = raw.trim_end();

        if let Some(caps) = FILE_LINE_ERROR.captures(line) {
            parsed.errors.push(CompilationError {
                message: caps["message"].trim().to_string(),
                line: caps["line"].parse().ok(),
                column: None,
                file: Some(normalize_path(&caps["file"])),
            });
            continue;
        }

        if let Some(caps) = BANG_ERROR.captures(line) {
            let message = caps["message"].trim().to_string();
            // file-line-error mode reports the same error twice
            if parsed.errors.last().is_some_and(|e| e.message == message) {
                continue;
            }
            let line_no = context_line(&lines[idx + 1..]).or_else(|| {
                INPUT_LINE
                    .captures(&message)
                    .and_then(|c| c["line"].parse().ok())
            });
            parsed.errors.push(CompilationError {
                message,
                line: line_no,
                column: None,
                file: None,
            });
            continue;
        }

        if WARNING.is_match(line) {
            parsed.warnings.push(line.to_string());
        }
    }

    parsed
}

/// Source line a warning points at, if it names one.
pub fn warning_line(warning: &str) -> Option<u32> {
    WARNING_LINE
        .captures(warning)
        .and_then(|c| c["line"].parse().ok())
}

fn context_line(following: &[&str]) -> Option<u32> {
    following
        .iter()
        .take(CONTEXT_LOOKAHEAD)
        .take_while(|l| !l.starts_with("! "))
        .find_map(|l| CONTEXT_LINE.captures(l))
        .and_then(|c| c["line"].parse().ok())
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}
