use nom::{
    IResult,
    Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_till1},
    character::complete::{alpha1, anychar, char, not_line_ending},
    combinator::opt,
    sequence::{delimited, preceded},
};
use nom_locate::LocatedSpan;

pub type Span<'a> = LocatedSpan<&'a str>;

/// A control sequence together with its first optional and mandatory argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub name: &'a str,
    pub starred: bool,
    pub options: Option<&'a str>,
    pub argument: Option<&'a str>,
    pub line: u32,
    pub column: u32,
}

impl<'a> Command<'a> {
    /// Comma separated entries of the mandatory argument, e.g. `\usepackage{a,b}`.
    pub fn argument_list(&self) -> impl Iterator<Item = &'a str> {
        self.argument
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_environment(&self, names: &[&str]) -> bool {
        self.name == "begin" && self.argument.is_some_and(|env| names.contains(&env))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    Command(Command<'a>),
    Text { text: &'a str, line: u32 },
    Symbol(char),
    Comment,
}

pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut input = Span::new(source);

    while !input.fragment().is_empty() {
        match token(input) {
            Ok((rest, tok)) => {
                tokens.push(tok);
                input = rest;
            }
            // only a lone trailing backslash gets here
            Err(_) => break,
        }
    }

    tokens
}

pub fn commands(source: &str) -> impl Iterator<Item = Command<'_>> {
    tokenize(source).into_iter().filter_map(|tok| match tok {
        Token::Command(cmd) => Some(cmd),
        _ => None,
    })
}

fn token(input: Span<'_>) -> IResult<Span<'_>, Token<'_>> {
    alt((comment, command, symbol, text)).parse(input)
}

fn comment(input: Span<'_>) -> IResult<Span<'_>, Token<'_>> {
    let (input, _) = preceded(char('%'), not_line_ending).parse(input)?;
    Ok((input, Token::Comment))
}

fn command(input: Span<'_>) -> IResult<Span<'_>, Token<'_>> {
    let line = input.location_line();
    let column = input.get_utf8_column() as u32;

    let (input, _) = char('\\').parse(input)?;
    let (input, name) = alt((alpha1, tag("["), tag("]"))).parse(input)?;
    let name = *name.fragment();

    // \[ and \] open and close display math and take no arguments
    if name == "[" || name == "]" {
        return Ok((input, Token::Command(Command {
            name,
            starred: false,
            options: None,
            argument: None,
            line,
            column,
        })));
    }

    let (input, star) = opt(char('*')).parse(input)?;
    let (input, options) = opt(delimited(
        char('['),
        take_till(|c: char| c == ']' || c == '\n'),
        char(']'),
    ))
    .parse(input)?;
    let (input, argument) = opt(delimited(
        char('{'),
        take_till(|c: char| c == '{' || c == '}' || c == '\n'),
        char('}'),
    ))
    .parse(input)?;

    Ok((input, Token::Command(Command {
        name,
        starred: star.is_some(),
        options: options.map(|s| *s.fragment()),
        argument: argument.map(|s| *s.fragment()),
        line,
        column,
    })))
}

fn symbol(input: Span<'_>) -> IResult<Span<'_>, Token<'_>> {
    let (input, c) = preceded(char('\\'), anychar).parse(input)?;
    Ok((input, Token::Symbol(c)))
}

fn text(input: Span<'_>) -> IResult<Span<'_>, Token<'_>> {
    let line = input.location_line();
    let (input, text) = take_till1(|c: char| c == '\\' || c == '%').parse(input)?;
    Ok((input, Token::Text { text: *text.fragment(), line }))
}
