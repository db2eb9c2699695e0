//! Query token grammar
//!
//! Turns the raw query tokens a caller supplies into a [`FilterExpression`].
//! Tokens are joined with single spaces before parsing, so error positions are
//! byte offsets into that joined string.
//!
//! # Supported Syntax
//!
//! ```text
//! *                          everything
//! true | false
//! +role                      has tag "role"
//! host = a                   tag equality (value may be "double quoted")
//! host != a                  tag inequality
//! $key = cpu                 series key equality
//! $key != cpu
//! !expr | not expr
//! expr and expr
//! expr or expr
//! ( expr )
//! ```
//!
//! Precedence from loosest to tightest: `or`, `and`, `not`/`!`, primary.
//! An empty token list yields [`FilterExpression::AlwaysTrue`]. Parentheses
//! and negations may nest at most [`MAX_NESTING_DEPTH`] levels deep.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0, satisfy},
    combinator::{cut, map, not, value},
    error::ErrorKind,
    multi::separated_list1,
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

use super::FilterExpression;
use crate::error::{Error, Result};

/// Deepest accepted nesting of parentheses and negations
pub const MAX_NESTING_DEPTH: usize = 128;

/// Builds filters from raw query tokens
///
/// The service layer only depends on this trait so that deployments can plug
/// in a different query language.
pub trait FilterGrammar: Send + Sync {
    /// Parse a token sequence into a filter tree
    fn parse(&self, tokens: &[String]) -> Result<FilterExpression>;
}

/// Default grammar over space-joined tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryGrammar;

impl FilterGrammar for QueryGrammar {
    fn parse(&self, tokens: &[String]) -> Result<FilterExpression> {
        parse_query(&tokens.join(" "))
    }
}

/// Parse a query string into a filter tree
///
/// ```rust
/// use kuba_metadata::filter::parser::parse_query;
/// use kuba_metadata::filter::FilterExpression;
///
/// let f = parse_query("host = a and +role").unwrap();
/// assert_eq!(
///     f,
///     FilterExpression::and(vec![
///         FilterExpression::match_tag("host", "a"),
///         FilterExpression::has_tag("role"),
///     ])
/// );
///
/// assert!(parse_query("   ").unwrap().is_always_true());
/// ```
pub fn parse_query(text: &str) -> Result<FilterExpression> {
    if text.trim().is_empty() {
        return Ok(FilterExpression::AlwaysTrue);
    }

    match (multispace0, |i| expression(i, 0), multispace0).parse(text) {
        Ok(("", (_, filter, _))) => Ok(filter),
        Ok((rest, _)) => Err(Error::filter_syntax(
            format!("unexpected input {:?}", snippet(rest)),
            Some(text.len() - rest.len()),
        )),
        Err(nom::Err::Failure(e)) if e.code == ErrorKind::TooLarge => Err(Error::filter_syntax(
            format!("filter nested deeper than {} levels", MAX_NESTING_DEPTH),
            Some(text.len() - e.input.len()),
        )),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::filter_syntax(
            format!("expected filter term near {:?}", snippet(e.input)),
            Some(text.len() - e.input.len()),
        )),
        Err(nom::Err::Incomplete(_)) => Err(Error::filter_syntax("incomplete filter", None)),
    }
}

fn snippet(rest: &str) -> &str {
    match rest.char_indices().nth(16) {
        Some((i, _)) => &rest[..i],
        None => rest,
    }
}

// ============================================================================
// Combinators
// ============================================================================

fn expression(input: &str, depth: usize) -> IResult<&str, FilterExpression> {
    map(
        separated_list1(
            delimited(multispace0, keyword("or"), multispace0),
            |i| conjunction(i, depth),
        ),
        |children| collapse(children, FilterExpression::or),
    )
    .parse(input)
}

fn conjunction(input: &str, depth: usize) -> IResult<&str, FilterExpression> {
    map(
        separated_list1(
            delimited(multispace0, keyword("and"), multispace0),
            |i| negation(i, depth),
        ),
        |children| collapse(children, FilterExpression::and),
    )
    .parse(input)
}

/// Every `!`, `not` and `(` nests one level deeper
fn negation(input: &str, depth: usize) -> IResult<&str, FilterExpression> {
    if depth > MAX_NESTING_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }

    alt((
        map(
            preceded((alt((tag("!"), keyword("not"))), multispace0), |i| {
                negation(i, depth + 1)
            }),
            FilterExpression::not,
        ),
        |i| primary(i, depth),
    ))
    .parse(input)
}

fn primary(input: &str, depth: usize) -> IResult<&str, FilterExpression> {
    alt((
        delimited(
            (char('('), multispace0),
            |i| expression(i, depth + 1),
            cut((multispace0, char(')'))),
        ),
        value(FilterExpression::AlwaysTrue, char('*')),
        map(preceded(char('+'), cut(word)), FilterExpression::has_tag),
        series_name,
        tag_match,
        value(FilterExpression::AlwaysTrue, keyword("true")),
        value(FilterExpression::AlwaysFalse, keyword("false")),
    ))
    .parse(input)
}

fn series_name(input: &str) -> IResult<&str, FilterExpression> {
    map(
        (tag("$key"), multispace0, operator, multispace0, cut(text_value)),
        |(_, _, equal, _, name)| negate_unless(equal, FilterExpression::match_series_name(name)),
    )
    .parse(input)
}

fn tag_match(input: &str) -> IResult<&str, FilterExpression> {
    map(
        (word, multispace0, operator, multispace0, cut(text_value)),
        |(key, _, equal, _, value)| negate_unless(equal, FilterExpression::match_tag(key, value)),
    )
    .parse(input)
}

/// `true` for equality, `false` for inequality
fn operator(input: &str) -> IResult<&str, bool> {
    alt((value(false, tag("!=")), value(true, tag("=")))).parse(input)
}

fn text_value(input: &str) -> IResult<&str, String> {
    alt((quoted, map(word, String::from))).parse(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !matches!(c, '(' | ')' | '"' | '=' | '!'))
        .parse(input)
}

/// Double-quoted string with backslash escapes
///
/// An unterminated string is a hard failure positioned at its opening quote.
fn quoted(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut out = String::new();

    loop {
        let mut chars = rest.chars();
        match chars.next() {
            Some('"') => return Ok((chars.as_str(), out)),
            Some('\\') => match chars.next() {
                Some(c) => out.push(c),
                None => break,
            },
            Some(c) => out.push(c),
            None => break,
        }
        rest = chars.as_str();
    }

    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        ErrorKind::Char,
    )))
}

fn keyword<'a>(
    kw: &'static str,
) -> impl Parser<&'a str, Output = &'a str, Error = nom::error::Error<&'a str>> {
    terminated(tag(kw), not(satisfy(is_word_char)))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn collapse(
    mut children: Vec<FilterExpression>,
    combine: fn(Vec<FilterExpression>) -> FilterExpression,
) -> FilterExpression {
    if children.len() == 1 {
        children.remove(0)
    } else {
        combine(children)
    }
}

fn negate_unless(equal: bool, filter: FilterExpression) -> FilterExpression {
    if equal {
        filter
    } else {
        FilterExpression::not(filter)
    }
}
