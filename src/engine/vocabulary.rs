//! Control sequences the draft engine knows about.
//!
//! The base set covers the LaTeX kernel and the standard classes. Each bundled
//! package adds its own commands; documents that load anything else are not
//! sent to the in-process engine at all (see `router::blocking_features`).

use std::collections::HashSet;

use crate::parser::{Command, Token};

pub const BUNDLED_CLASSES: &[&str] = &["article", "report", "book", "letter", "minimal"];

const KERNEL: &[&str] = &[
    // document structure
    "documentclass", "usepackage", "RequirePackage", "begin", "end", "item", "par", "appendix",
    "part", "chapter", "section", "subsection", "subsubsection", "paragraph", "subparagraph",
    "tableofcontents", "listoffigures", "listoftables", "maketitle", "title", "author", "date",
    "thanks", "and", "today", "label", "ref", "pageref", "cite", "nocite", "footnote",
    "footnotemark", "footnotetext", "marginpar", "caption", "bibliographystyle", "bibitem", "input",
    "include", "includeonly", "bibliography", "pagestyle", "thispagestyle", "pagenumbering",
    "twocolumn", "onecolumn", "hyphenation", "sloppy", "fussy", "nonumber",
    // breaks and spacing
    "newline", "linebreak", "nolinebreak", "newpage", "clearpage", "cleardoublepage", "pagebreak",
    "nopagebreak", "centering", "raggedright", "raggedleft", "noindent", "indent", "hspace",
    "vspace", "hfill", "vfill", "hss", "vss", "smallskip", "medskip", "bigskip", "quad", "qquad",
    "enspace", "hskip", "vskip", "kern", "hrule", "vrule", "hline", "cline", "multicolumn",
    "tabularnewline", "noalign", "cr", "crcr", "null", "mbox", "makebox", "fbox", "framebox",
    "parbox", "raisebox", "rule", "phantom", "hphantom", "vphantom", "strut", "leavevmode", "hbox",
    "vbox", "baselineskip", "parindent", "parskip", "textwidth", "linewidth", "textheight",
    "columnsep", "tabcolsep", "arraystretch", "fill", "stretch",
    // fonts
    "textbf", "textit", "textrm", "textsf", "texttt", "textmd", "textup", "textsl", "textsc",
    "textnormal", "emph", "underline", "bfseries", "itshape", "rmfamily", "sffamily", "ttfamily",
    "mdseries", "upshape", "slshape", "scshape", "normalfont", "bf", "it", "rm", "sf", "tt", "sl",
    "sc", "em", "tiny", "scriptsize", "footnotesize", "small", "normalsize", "large", "Large",
    "LARGE", "huge", "Huge",
    // definitions and counters
    "newcommand", "renewcommand", "providecommand", "newenvironment", "renewenvironment",
    "newtheorem", "newcounter", "setcounter", "addtocounter", "stepcounter", "refstepcounter",
    "value", "arabic", "roman", "Roman", "alph", "Alph", "fnsymbol", "thepage", "thesection",
    "newlength", "setlength", "addtolength", "settowidth", "def", "gdef", "edef", "xdef", "let",
    "newif", "relax", "makeatletter", "makeatother", "protect", "ensuremath",
    "DeclareRobustCommand", "expandafter", "noexpand", "csname", "endcsname", "the", "number",
    "ifx", "ifnum", "ifdim", "else", "fi", "or", "global", "long", "string",
    // text symbols
    "LaTeX", "TeX", "LaTeXe", "ldots", "dots", "textbackslash", "textasciitilde", "textasciicircum",
    "textbar", "textless", "textgreater", "textendash", "textemdash", "textquoteleft",
    "textquoteright", "textquotedblleft", "textquotedblright", "textbullet", "copyright", "ss",
    "ae", "AE", "oe", "OE", "o", "O", "aa", "AA", "l", "L", "i", "j", "dag", "ddag", "S", "P",
    "pounds", "verb", "space",
    // math
    "[", "]", "frac", "sqrt", "sum", "prod", "coprod", "int", "oint", "lim", "limsup", "liminf",
    "sup", "inf", "max", "min", "log", "ln", "lg", "exp", "sin", "cos", "tan", "sec", "csc", "cot",
    "arcsin", "arccos", "arctan", "sinh", "cosh", "tanh", "coth", "det", "dim", "ker", "deg", "gcd",
    "hom", "arg", "Pr", "bmod", "pmod", "left", "right", "middle", "big", "Big", "bigg", "Bigg",
    "bigl", "bigr", "Bigl", "Bigr", "biggl", "biggr", "alpha", "beta", "gamma", "delta", "epsilon",
    "varepsilon", "zeta", "eta", "theta", "vartheta", "iota", "kappa", "lambda", "mu", "nu", "xi",
    "pi", "varpi", "rho", "varrho", "sigma", "varsigma", "tau", "upsilon", "phi", "varphi", "chi",
    "psi", "omega", "Gamma", "Delta", "Theta", "Lambda", "Xi", "Pi", "Sigma", "Upsilon", "Phi",
    "Psi", "Omega", "infty", "partial", "nabla", "forall", "exists", "neg", "lnot", "emptyset",
    "in", "notin", "ni", "subset", "subseteq", "supset", "supseteq", "cup", "cap", "bigcup",
    "bigcap", "setminus", "wedge", "vee", "land", "lor", "oplus", "otimes", "bigoplus", "bigotimes",
    "times", "div", "cdot", "cdots", "vdots", "ddots", "pm", "mp", "leq", "le", "geq", "ge", "neq",
    "ne", "approx", "equiv", "sim", "simeq", "cong", "propto", "ll", "gg", "prec", "succ", "preceq",
    "succeq", "to", "gets", "rightarrow", "leftarrow", "Rightarrow", "Leftarrow", "leftrightarrow",
    "Leftrightarrow", "longrightarrow", "longleftarrow", "Longrightarrow", "Longleftarrow",
    "mapsto", "longmapsto", "iff", "uparrow", "downarrow", "Uparrow", "Downarrow", "langle",
    "rangle", "lfloor", "rfloor", "lceil", "rceil", "lbrace", "rbrace", "vert", "Vert", "mid",
    "parallel", "perp", "angle", "prime", "ell", "hbar", "Re", "Im", "aleph", "wp", "circ",
    "bullet", "star", "ast", "dagger", "ddagger", "colon", "ldotp", "cdotp", "hat", "bar", "tilde",
    "vec", "dot", "ddot", "check", "breve", "acute", "grave", "widehat", "widetilde", "overline",
    "overbrace", "underbrace", "stackrel", "mathrm", "mathbf", "mathit", "mathsf", "mathtt",
    "mathcal", "mathnormal", "displaystyle", "textstyle", "scriptstyle", "scriptscriptstyle",
    "limits", "nolimits", "not", "atop", "choose", "over",
];

/// Commands each bundled package adds. Packages with an empty list only change
/// typesetting parameters.
const PACKAGES: &[(&str, &[&str])] = &[
    ("inputenc", &[]),
    ("fontenc", &[]),
    ("lmodern", &[]),
    ("textcomp", &[]),
    ("microtype", &[]),
    ("parskip", &[]),
    ("array", &[]),
    ("float", &[]),
    ("multicol", &["columnbreak"]),
    ("babel", &["selectlanguage", "foreignlanguage"]),
    ("csquotes", &["enquote"]),
    ("xspace", &["xspace"]),
    ("caption", &["captionof", "captionsetup"]),
    ("subcaption", &["subcaptionbox", "subref"]),
    ("graphicx", &["includegraphics", "rotatebox", "scalebox", "resizebox", "graphicspath"]),
    ("url", &["url"]),
    (
        "hyperref",
        &[
            "href", "url", "hyperref", "hypersetup", "autoref", "nameref", "texorpdfstring",
            "phantomsection",
        ],
    ),
    ("xcolor", &["color", "textcolor", "colorbox", "fcolorbox", "definecolor", "pagecolor"]),
    ("color", &["color", "textcolor", "colorbox", "fcolorbox", "definecolor", "pagecolor"]),
    ("geometry", &["geometry", "newgeometry", "restoregeometry"]),
    ("enumitem", &["setlist"]),
    ("booktabs", &["toprule", "midrule", "bottomrule", "cmidrule", "addlinespace"]),
    ("lipsum", &["lipsum"]),
    ("setspace", &["singlespacing", "onehalfspacing", "doublespacing", "setstretch"]),
    (
        "fancyhdr",
        &[
            "fancyhf", "fancyhead", "fancyfoot", "lhead", "chead", "rhead", "lfoot", "cfoot",
            "rfoot", "headrulewidth", "footrulewidth", "fancypagestyle",
        ],
    ),
    ("amsfonts", &["mathbb", "mathfrak"]),
    (
        "amssymb",
        &[
            "mathbb", "mathfrak", "varnothing", "leqslant", "geqslant", "therefore", "because",
            "square", "blacksquare", "lesssim", "gtrsim", "nexists", "complement", "checkmark",
            "triangleq",
        ],
    ),
    ("amsthm", &["theoremstyle", "qedhere", "qed", "qedsymbol", "proofname"]),
    (
        "amsmath",
        &[
            "eqref", "tag", "notag", "DeclareMathOperator", "operatorname", "dfrac", "tfrac",
            "binom", "dbinom", "tbinom", "intertext", "text", "boxed", "implies", "impliedby",
            "xrightarrow", "xleftarrow", "overset", "underset", "substack", "iint", "iiint",
            "idotsint", "numberwithin", "allowdisplaybreaks", "lvert", "rvert", "lVert", "rVert",
        ],
    ),
    (
        "mathtools",
        &["coloneqq", "eqqcolon", "DeclarePairedDelimiter", "mathclap", "mathllap", "mathrlap"],
    ),
    ("siunitx", &["SI", "si", "num", "qty", "unit", "ang", "sisetup"]),
];

/// Packages whose commands imply others'.
const PACKAGE_DEPENDENCIES: &[(&str, &[&str])] =
    &[("mathtools", &["amsmath"]), ("amssymb", &["amsfonts"])];

/// Commands that introduce a new control sequence.
const DEFINERS: &[&str] = &[
    "newcommand", "renewcommand", "providecommand", "DeclareRobustCommand", "DeclareMathOperator",
    "DeclarePairedDelimiter", "def", "gdef", "edef", "xdef", "let", "newlength", "newif",
];

pub fn is_bundled_package(name: &str) -> bool {
    PACKAGES.iter().any(|(package, _)| *package == name)
}

pub fn is_bundled_class(name: &str) -> bool {
    BUNDLED_CLASSES.contains(&name)
}

/// An unknown control sequence and the line it was used on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndefinedCommand {
    pub name: String,
    pub line: u32,
}

/// Body groups still to skip after a definition.
#[derive(Debug, Default)]
struct PendingBody {
    groups: usize,
    depth: usize,
}

impl PendingBody {
    fn active(&self) -> bool {
        self.groups > 0
    }

    /// Feeds raw text; returns once every pending group has closed.
    fn consume(&mut self, text: &str) {
        for c in text.chars() {
            if self.groups == 0 {
                return;
            }
            match c {
                '{' => self.depth += 1,
                '}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.groups -= 1;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Walks the document in order and reports the first control sequence that
/// was neither built in, loaded from a package, nor defined before its use.
///
/// Definition bodies, verbatim environments, `\verb` lines and anything after
/// `\end{document}` are not checked.
/// After `\makeatletter` internal names can no longer be tokenized reliably,
/// so checking stops there.
pub fn first_undefined(tokens: &[Token<'_>]) -> Option<UndefinedCommand> {
    let mut known: HashSet<String> = KERNEL.iter().map(|s| s.to_string()).collect();
    let mut body = PendingBody::default();
    // definer waiting for its name as the next command token
    let mut awaiting_name: Option<&str> = None;
    let mut in_verbatim = false;
    let mut verb_line: Option<u32> = None;

    for token in tokens {
        let cmd = match token {
            Token::Text { text, .. } => {
                body.consume(text);
                continue;
            }
            Token::Command(cmd) => cmd,
            _ => continue,
        };

        if in_verbatim {
            in_verbatim = !(cmd.name == "end" && is_verbatim(cmd.argument));
            continue;
        }
        if verb_line == Some(cmd.line) {
            continue;
        }

        if let Some(definer) = awaiting_name.take() {
            define(&mut known, definer, cmd.name);
            // `\def\foo{...}` hands the body to the name's own argument
            if cmd.argument.is_some() && body.groups > 0 {
                body.groups -= 1;
            }
            continue;
        }
        if body.active() {
            if let Some(argument) = cmd.argument {
                body.consume(&format!("{{{}}}", argument));
            }
            continue;
        }

        match cmd.name {
            "makeatletter" => return None,
            "end" if cmd.argument == Some("document") => return None,
            "verb" => verb_line = Some(cmd.line),
            "begin" if is_verbatim(cmd.argument) => in_verbatim = true,
            "usepackage" | "RequirePackage" => load_packages(&mut known, cmd),
            name if DEFINERS.contains(&name) => {
                body.groups = body_groups(name);
                match cmd.argument.and_then(|a| a.trim().strip_prefix('\\')) {
                    Some(defined) => define(&mut known, name, defined),
                    None => awaiting_name = Some(cmd.name),
                }
                continue;
            }
            "newenvironment" | "renewenvironment" => {
                body.groups = 2;
                continue;
            }
            _ => {}
        }

        let used = std::iter::once(cmd.name).chain(embedded(cmd.argument.unwrap_or("")));
        if let Some(name) = used.into_iter().find(|name| !known.contains(*name)) {
            return Some(UndefinedCommand {
                name: name.to_string(),
                line: cmd.line,
            });
        }
    }

    None
}

/// Control sequences inside a command's argument, which the tokenizer keeps as
/// plain text, e.g. `\section{The \LaTeX{} way}`.
fn embedded(argument: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = argument;
    while let Some(at) = rest.find('\\') {
        let after = &rest[at + 1..];
        let end = after
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(after.len());
        if end > 0 {
            names.push(&after[..end]);
            rest = &after[end..];
        } else {
            // `\\` and other control symbols
            let skip = after.chars().next().map_or(0, char::len_utf8);
            rest = &after[skip..];
        }
    }
    names
}

fn body_groups(definer: &str) -> usize {
    match definer {
        "let" | "newlength" | "newif" => 0,
        "DeclarePairedDelimiter" => 2,
        _ => 1,
    }
}

fn define(known: &mut HashSet<String>, definer: &str, name: &str) {
    known.insert(name.to_string());
    // `\newif\iffoo` also defines `\footrue` and `\foofalse`
    if let Some(flag) = name.strip_prefix("if").filter(|_| definer == "newif") {
        known.insert(format!("{}true", flag));
        known.insert(format!("{}false", flag));
    }
}

fn load_packages(known: &mut HashSet<String>, cmd: &Command<'_>) {
    let mut pending: Vec<&str> = cmd.argument_list().collect();
    while let Some(package) = pending.pop() {
        if let Some((_, commands)) = PACKAGES.iter().find(|(name, _)| *name == package) {
            known.extend(commands.iter().map(|c| c.to_string()));
        }
        if let Some((_, implied)) = PACKAGE_DEPENDENCIES.iter().find(|(name, _)| *name == package) {
            pending.extend(implied.iter().copied());
        }
    }
}

fn is_verbatim(environment: Option<&str>) -> bool {
    matches!(environment, Some("verbatim" | "verbatim*"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tokenize;
    use pretty_assertions::assert_eq;

    fn undefined(source: &str) -> Option<(String, u32)> {
        first_undefined(&tokenize(source)).map(|u| (u.name, u.line))
    }

    #[test]
    fn unknown_macro_is_reported_with_its_line() {
        let source = "\\documentclass{article}\n\\begin{document}\n\\foo\n\\end{document}";
        assert_eq!(undefined(source), Some(("foo".to_string(), 3)));
    }

    #[test]
    fn kernel_commands_are_known() {
        let source = concat!(
            "\\documentclass{article}\n\\begin{document}\n\\section{A}\n",
            "\\textbf{x} $\\alpha + \\frac{1}{2}$\n\\end{document}",
        );
        assert_eq!(undefined(source), None);
    }

    #[test]
    fn package_commands_need_the_package() {
        let body = "\\begin{document}\n$\\mathbb{R}$\n\\end{document}";
        let bare = format!("\\documentclass{{article}}\n{}", body);
        assert_eq!(undefined(&bare), Some(("mathbb".to_string(), 3)));
        let loaded = format!("\\documentclass{{article}}\n\\usepackage{{amssymb}}\n{}", body);
        assert_eq!(undefined(&loaded), None);
    }

    #[test]
    fn implied_packages_are_loaded() {
        assert_eq!(undefined("\\usepackage{mathtools}\n$\\dfrac{1}{2}$"), None);
    }

    #[test]
    fn user_definitions_count_from_their_definition() {
        let source = concat!(
            "\\newcommand{\\R}{\\mathbb{R}}\n",
            "\\def\\half{\\frac12}\n",
            "\\newcommand\\twice[1]{#1#1}\n",
            "\\R \\half \\twice{x}",
        );
        assert_eq!(undefined(source), None);
        assert_eq!(undefined("\\later\n\\newcommand{\\later}{x}"), Some(("later".to_string(), 1)));
    }

    #[test]
    fn definition_bodies_are_not_checked() {
        assert_eq!(undefined("\\newcommand{\\lazy}{\\undefinedinside}\ntext"), None);
        let environment = "\\newenvironment{box}{\\open}{\\close}\ntext \\oops";
        assert_eq!(undefined(environment), Some(("oops".to_string(), 2)));
    }

    #[test]
    fn control_sequences_inside_arguments_are_checked() {
        assert_eq!(undefined("\\section{The \\LaTeX\\\\ way}"), None);
        assert_eq!(undefined("text\n\\emph{a \\missing b}"), Some(("missing".to_string(), 2)));
    }

    #[test]
    fn newif_defines_its_switches() {
        assert_eq!(undefined("\\newif\\ifdraft\n\\drafttrue\n\\ifdraft x\\fi"), None);
    }

    #[test]
    fn text_after_the_document_is_ignored() {
        assert_eq!(undefined("\\begin{document}\n\\end{document}\n\\trailing"), None);
    }

    #[test]
    fn verbatim_is_skipped() {
        let source = "\\begin{verbatim}\n\\nothing\n\\end{verbatim}\n\\verb|\\neither|";
        assert_eq!(undefined(source), None);
    }

    #[test]
    fn bundled_names() {
        assert!(is_bundled_package("amsmath"));
        assert!(!is_bundled_package("tikz"));
        assert!(is_bundled_class("report"));
        assert!(!is_bundled_class("beamer"));
    }
}
