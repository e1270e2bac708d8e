//! Built-in in-process engine.
//!
//! It does not typeset. It checks the structure TeX would choke on first
//! (braces, environments, the document body, unknown control sequences),
//! reports problems the way TeX logs them, and renders the body text into a
//! plain preview PDF.

use super::vocabulary;
use super::worker::{EngineCore, EngineReply, VirtualFs};
use super::{EngineFactory, EngineVariant};
use crate::parser::{self, Token};
use crate::pdf;

const LINES_PER_PAGE: usize = 48;
const WRAP_COLUMN: usize = 90;

const PAGE_BREAKS: &[&str] = &["newpage", "clearpage", "cleardoublepage", "pagebreak"];
const HEADINGS: &[&str] =
    &["part", "chapter", "section", "subsection", "subsubsection", "paragraph", "title"];
const INLINE_TEXT: &[&str] =
    &["textbf", "textit", "emph", "texttt", "underline", "textsc", "mbox", "author", "date"];

#[derive(Debug, Default, Clone, Copy)]
pub struct DraftEngineFactory;

impl EngineFactory for DraftEngineFactory {
    fn load(&self, variant: EngineVariant) -> Result<Box<dyn EngineCore>, String> {
        Ok(Box::new(DraftEngine { variant }))
    }
}

#[derive(Debug)]
pub struct DraftEngine {
    variant: EngineVariant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StructureError {
    message: String,
    line: Option<u32>,
    context: String,
}

impl StructureError {
    fn at(message: impl Into<String>, line: u32, source: &str) -> Self {
        let context = source
            .lines()
            .nth(line.saturating_sub(1) as usize)
            .unwrap_or("")
            .trim_end()
            .to_string();
        Self {
            message: message.into(),
            line: Some(line),
            context,
        }
    }

    fn render(&self) -> String {
        match self.line {
            Some(line) => format!("! {}\nl.{} {}\n", self.message, line, self.context),
            None => format!("! {}\n{}\n", self.message, self.context),
        }
    }
}

impl EngineCore for DraftEngine {
    fn compile(&mut self, fs: &VirtualFs, main_file: &str) -> EngineReply {
        let mut log =
            format!("This is DraftTeX ({} mode), in-process preview engine\n", self.variant);

        let Some(source) = fs.read_to_string(main_file) else {
            log.push_str(&format!("! I can't find file `{}'.\n", main_file));
            return EngineReply { status: 1, log, pdf: None };
        };
        log.push_str(&format!("({}\n", main_file));

        if let Err(error) = check_structure(&source) {
            log.push_str(&error.render());
            log.push_str(")\nNo pages of output.\n");
            return EngineReply { status: 1, log, pdf: None };
        }

        let pages = layout(&source);
        let pdf = pdf::write_text_document(&pages);
        let stem = main_file.rsplit_once('.').map_or(main_file, |(stem, _)| stem);
        log.push_str(&format!(
            ")\nOutput written on {}.pdf ({} page{}, {} bytes).\n",
            stem,
            pages.len(),
            if pages.len() == 1 { "" } else { "s" },
            pdf.len()
        ));

        EngineReply { status: 0, log, pdf: Some(pdf) }
    }
}

fn check_structure(source: &str) -> Result<(), StructureError> {
    check_braces(source)?;
    check_environments(source)?;
    check_vocabulary(source)
}

fn check_vocabulary(source: &str) -> Result<(), StructureError> {
    match vocabulary::first_undefined(&parser::tokenize(source)) {
        Some(undefined) => {
            Err(StructureError::at("Undefined control sequence.", undefined.line, source))
        }
        None => Ok(()),
    }
}

fn check_braces(source: &str) -> Result<(), StructureError> {
    // (line, text before the brace on that line)
    let mut open: Vec<(u32, String)> = Vec::new();

    for (idx, text) in source.lines().enumerate() {
        let line = idx as u32 + 1;
        let mut chars = text.char_indices();
        while let Some((pos, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '%' => break,
                '{' => open.push((line, text[..pos].to_string())),
                '}' => {
                    if open.pop().is_none() {
                        return Err(StructureError::at("Too many }'s.", line, source));
                    }
                }
                _ => {}
            }
        }
    }

    match open.pop() {
        Some((line, before)) => {
            let control = before.trim_end().rsplit('\\').next().filter(|name| {
                before.contains('\\') && name.chars().all(|c| c.is_ascii_alphabetic())
            });
            let message = match control {
                Some(name) => format!("File ended while scanning use of \\{}.", name),
                None => "Missing } inserted.".to_string(),
            };
            Err(StructureError::at(message, line, source))
        }
        None => Ok(()),
    }
}

fn check_environments(source: &str) -> Result<(), StructureError> {
    let last_line = source.lines().count().max(1) as u32;
    let mut stack: Vec<(&str, u32)> = Vec::new();
    let mut saw_class = false;
    let mut document_started = false;
    let mut document_ended = false;

    for cmd in parser::commands(source) {
        match (cmd.name, cmd.argument) {
            ("documentclass", _) => saw_class = true,
            ("begin", Some(env)) => {
                if env == "document" {
                    if !saw_class {
                        return Err(StructureError::at(
                            "LaTeX Error: The font size command \\normalsize is not defined.",
                            cmd.line,
                            source,
                        ));
                    }
                    document_started = true;
                }
                stack.push((env, cmd.line));
            }
            ("end", Some(env)) => match stack.pop() {
                Some((open, _)) if open == env => {
                    if env == "document" {
                        document_ended = true;
                        break;
                    }
                }
                Some((open, opened_at)) => {
                    return Err(StructureError::at(
                        format!(
                            "LaTeX Error: \\begin{{{}}} on input line {} ended by \\end{{{}}}.",
                            open, opened_at, env
                        ),
                        cmd.line,
                        source,
                    ));
                }
                None => {
                    return Err(StructureError::at(
                        format!(
                            "LaTeX Error: Environment {} ended without \\begin{{{}}}.",
                            env, env
                        ),
                        cmd.line,
                        source,
                    ));
                }
            },
            _ => {}
        }
    }

    if !document_started {
        let message = "LaTeX Error: Missing \\begin{document}.";
        return Err(StructureError::at(message, last_line, source));
    }
    if !document_ended {
        return Err(StructureError {
            message: "Emergency stop.".to_string(),
            line: None,
            context: "*** (job aborted, no legal \\end found)".to_string(),
        });
    }
    Ok(())
}

#[derive(Default)]
struct PageBuilder {
    pages: Vec<Vec<String>>,
    current: Vec<String>,
    paragraph: String,
}

impl PageBuilder {
    fn push_text(&mut self, text: &str) {
        let mut parts = text.split("\n\n").peekable();
        while let Some(part) = parts.next() {
            for word in part.split_whitespace() {
                if !self.paragraph.is_empty() {
                    self.paragraph.push(' ');
                }
                self.paragraph.push_str(word);
            }
            if parts.peek().is_some() {
                self.end_paragraph();
            }
        }
    }

    fn end_paragraph(&mut self) {
        if self.paragraph.is_empty() {
            return;
        }
        let paragraph = std::mem::take(&mut self.paragraph);
        let mut line = String::new();
        for word in paragraph.split(' ') {
            if !line.is_empty() && line.len() + word.len() + 1 > WRAP_COLUMN {
                self.push_line(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        self.push_line(line);
        self.push_line(String::new());
    }

    fn push_line(&mut self, line: String) {
        if self.current.len() >= LINES_PER_PAGE {
            self.pages.push(std::mem::take(&mut self.current));
        }
        if line.is_empty() && self.current.is_empty() {
            return;
        }
        self.current.push(line);
    }

    fn break_page(&mut self) {
        self.end_paragraph();
        if !self.current.is_empty() {
            self.pages.push(std::mem::take(&mut self.current));
        }
    }

    fn finish(mut self) -> Vec<Vec<String>> {
        self.break_page();
        if self.pages.is_empty() {
            self.pages.push(Vec::new());
        }
        self.pages
    }
}

/// Body text split into pages of wrapped lines.
fn layout(source: &str) -> Vec<Vec<String>> {
    let mut builder = PageBuilder::default();
    let mut in_body = false;

    for token in parser::tokenize(source) {
        match token {
            Token::Command(cmd) if cmd.is_environment(&["document"]) => in_body = true,
            Token::Command(cmd) if cmd.name == "end" && cmd.argument == Some("document") => break,
            _ if !in_body => {}
            Token::Command(cmd) if PAGE_BREAKS.contains(&cmd.name) => builder.break_page(),
            Token::Command(cmd) if HEADINGS.contains(&cmd.name) => {
                builder.end_paragraph();
                builder.push_text(cmd.argument.unwrap_or(""));
                builder.end_paragraph();
            }
            Token::Command(cmd) if INLINE_TEXT.contains(&cmd.name) => {
                builder.push_text(cmd.argument.unwrap_or(""));
            }
            Token::Command(cmd) if cmd.name == "par" => builder.end_paragraph(),
            Token::Text { text, .. } => builder.push_text(&text.replace(['{', '}'], "")),
            Token::Symbol(c) if "%&$#_".contains(c) => builder.push_text(&c.to_string()),
            _ => {}
        }
    }

    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(source: &str) -> EngineReply {
        let mut fs = VirtualFs::default();
        fs.write("main.tex", source.as_bytes().to_vec()).unwrap();
        DraftEngine { variant: EngineVariant::PdfTex }.compile(&fs, "main.tex")
    }

    #[test]
    fn minimal_document_compiles_to_pdf() {
        let reply = compile(r"\documentclass{article}\begin{document}Hello\end{document}");
        assert_eq!(reply.status, 0);
        let pdf = reply.pdf.unwrap();
        assert!(pdf.starts_with(b"%PDF"));
        assert_eq!(pdf::page_count(&pdf), 1);
        assert!(reply.log.contains("Output written on main.pdf (1 page"));
    }

    #[test]
    fn unterminated_begin_reports_line() {
        let reply = compile(r"\begin{document");
        assert_eq!(reply.status, 1);
        assert!(reply.pdf.is_none());
        let expected = "! File ended while scanning use of \\begin.\nl.1 \\begin{document";
        assert!(reply.log.contains(expected));
    }

    #[test]
    fn mismatched_environment_reports_both_lines() {
        let source = concat!(
            "\\documentclass{article}\n\\begin{document}\n",
            "\\begin{itemize}\n\\item a\n\\end{enumerate}\n\\end{document}",
        );
        let err = check_structure(source).unwrap_err();
        assert_eq!(err.line, Some(5));
        assert_eq!(
            err.message,
            "LaTeX Error: \\begin{itemize} on input line 3 ended by \\end{enumerate}."
        );
    }

    #[test]
    fn extra_closing_brace() {
        let err = check_structure("\\documentclass{article}\n}").unwrap_err();
        assert_eq!(err.message, "Too many }'s.");
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn escaped_braces_and_comments_are_ignored() {
        let source = "\\documentclass{article}\n\\begin{document}\n\\{ % {\n\\end{document}";
        assert_eq!(check_structure(source), Ok(()));
    }

    #[test]
    fn missing_end_document_is_an_emergency_stop() {
        let err = check_structure("\\documentclass{article}\n\\begin{document}\ntext").unwrap_err();
        assert_eq!(err.message, "Emergency stop.");
        assert_eq!(err.line, None);
    }

    #[test]
    fn unknown_command_is_undefined() {
        let reply = compile("\\documentclass{article}\n\\begin{document}\n\\foo\n\\end{document}");
        assert_eq!(reply.status, 1);
        assert!(reply.pdf.is_none());
        assert!(reply.log.contains("! Undefined control sequence.\nl.3 \\foo\n"));
    }

    #[test]
    fn defined_commands_compile() {
        let source = concat!(
            "\\documentclass{article}\n\\usepackage{amsmath}\n",
            "\\newcommand{\\foo}{bar}\n\\DeclareMathOperator{\\rank}{rank}\n",
            "\\begin{document}\n\\foo $\\rank A \\text{ and } \\binom{n}{k}$\n\\end{document}",
        );
        let reply = compile(source);
        assert_eq!(reply.status, 0, "{}", reply.log);
        assert!(reply.pdf.is_some());
    }

    #[test]
    fn page_breaks_split_the_preview() {
        let source = concat!(
            "\\documentclass{article}\n\\begin{document}\n",
            "\\section{One}\nfirst\n\\newpage\nsecond\n\\end{document}",
        );
        let pages = layout(source);
        assert_eq!(pages, vec![
            vec!["One".to_string(), String::new(), "first".to_string(), String::new()],
            vec!["second".to_string(), String::new()],
        ]);
    }

    #[test]
    fn long_bodies_overflow_onto_new_pages() {
        let body: String = (0..120).map(|i| format!("para {}\n\n", i)).collect();
        let source =
            format!("\\documentclass{{article}}\\begin{{document}}{}\\end{{document}}", body);
        assert!(layout(&source).len() > 1);
    }
}
