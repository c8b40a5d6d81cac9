//! Scanner splitting preprocessed C++ source into tokens
//!
//! This is not a full C++ lexer, it only recognizes enough of the language to
//! tell apart the tokens that carry structure (identifiers, brackets,
//! punctuation) from those that must be passed through untouched (comments,
//! literals, preprocessor directives and line markers). Concatenating the text
//! of every token always gives back the original source.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{anychar, char, not_line_ending, satisfy},
    combinator::{map, opt, recognize, rest},
    sequence::{pair, terminated, tuple},
    IResult,
};

/// Category of a C++ token
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TokenKind {
    /// Spaces, tabs and newlines
    Whitespace,

    /// Line or block comment
    Comment,

    /// Preprocessor directive or line marker, up to the end of its line
    Directive,

    /// Identifier or keyword
    Identifier,

    /// Preprocessing number (integer or floating-point, with suffixes)
    Number,

    /// String or character literal, including raw strings
    Literal,

    /// Any other symbol
    Punctuation,
}

/// Slice of the source along with its category
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Token<'source> {
    /// What kind of token this is
    pub kind: TokenKind,

    /// Source text of the token
    pub text: &'source str,
}
//
impl<'source> Token<'source> {
    /// Truth that this token matters to the structure of the program
    pub fn is_significant(&self) -> bool {
        !matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::Comment | TokenKind::Directive
        )
    }

    /// Truth that this token is a specific identifier or keyword
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Identifier && self.text == keyword
    }

    /// Truth that this token is a specific punctuation symbol
    pub fn is_punctuation(&self, symbol: &str) -> bool {
        self.kind == TokenKind::Punctuation && self.text == symbol
    }
}

/// Split C++ source into tokens
///
/// This never fails: characters that do not start any known token are emitted
/// as single-character punctuation.
///
pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut remainder = source;
    let mut line_start = true;
    while !remainder.is_empty() {
        let parsed = if line_start {
            directive(remainder).or_else(|_| token(remainder))
        } else {
            token(remainder)
        };
        let (next, token) = parsed.unwrap_or_else(|_| stray_char(remainder));
        line_start = match token.kind {
            TokenKind::Whitespace => line_start || token.text.contains('\n'),
            TokenKind::Comment => line_start,
            _ => false,
        };
        tokens.push(token);
        remainder = next;
    }
    tokens
}

/// Parser for any token except directives
fn token(s: &str) -> IResult<&str, Token<'_>> {
    alt((
        map(take_while1(|c: char| c.is_whitespace()), |text| Token {
            kind: TokenKind::Whitespace,
            text,
        }),
        map(comment, |text| Token {
            kind: TokenKind::Comment,
            text,
        }),
        map(alt((raw_string, string_literal, char_literal)), |text| Token {
            kind: TokenKind::Literal,
            text,
        }),
        map(number, |text| Token {
            kind: TokenKind::Number,
            text,
        }),
        map(identifier, |text| Token {
            kind: TokenKind::Identifier,
            text,
        }),
        map(punctuation, |text| Token {
            kind: TokenKind::Punctuation,
            text,
        }),
    ))(s)
}

/// Parser for preprocessor directives and line markers
///
/// Must only be attempted at the start of a line. Backslash-newline
/// continuations are part of the directive.
///
fn directive(s: &str) -> IResult<&str, Token<'_>> {
    char('#')(s)?;
    let mut end = s.len();
    let mut search_from = 0;
    while let Some(offset) = s[search_from..].find('\n') {
        let newline = search_from + offset;
        if s[..newline].trim_end_matches('\r').ends_with('\\') {
            search_from = newline + 1;
        } else {
            end = newline;
            break;
        }
    }
    Ok((
        &s[end..],
        Token {
            kind: TokenKind::Directive,
            text: &s[..end],
        },
    ))
}

/// Parser for line and block comments (unterminated ones eat up the input)
fn comment(s: &str) -> IResult<&str, &str> {
    alt((
        recognize(pair(tag("//"), not_line_ending)),
        recognize(tuple((tag("/*"), take_until("*/"), tag("*/")))),
        recognize(pair(tag("/*"), rest)),
    ))(s)
}

/// Parser for literal encoding prefixes
fn encoding_prefix(s: &str) -> IResult<&str, &str> {
    alt((tag("u8"), tag("u"), tag("U"), tag("L")))(s)
}

/// Parser for raw string literals like `R"delim(...)delim"`
fn raw_string(s: &str) -> IResult<&str, &str> {
    let (body, _) = pair(opt(encoding_prefix), tag("R\""))(s)?;
    let (contents, delimiter) = terminated(take_until("("), char('('))(body)?;
    let closing = format!("){delimiter}\"");
    let end = contents
        .find(&closing)
        .map_or(contents.len(), |idx| idx + closing.len());
    let consumed = s.len() - contents.len() + end;
    Ok((&s[consumed..], &s[..consumed]))
}

/// Parser for string literals
fn string_literal(s: &str) -> IResult<&str, &str> {
    quoted_literal(s, '"')
}

/// Parser for character literals
fn char_literal(s: &str) -> IResult<&str, &str> {
    quoted_literal(s, '\'')
}

/// Parser for quoted literals with backslash escapes
///
/// An unterminated literal stops at the end of its line.
///
fn quoted_literal(s: &str, quote: char) -> IResult<&str, &str> {
    let (body, _) = pair(opt(encoding_prefix), char(quote))(s)?;
    let mut end = body.len();
    let mut escaped = false;
    for (idx, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '\n' => {
                end = idx;
                break;
            }
            c if c == quote => {
                end = idx + c.len_utf8();
                break;
            }
            _ => {}
        }
    }
    let consumed = s.len() - body.len() + end;
    Ok((&s[consumed..], &s[..consumed]))
}

/// Parser for preprocessing numbers, including digit separators and
/// signed exponents
fn number(s: &str) -> IResult<&str, &str> {
    alt((
        recognize(satisfy(|c| c.is_ascii_digit())),
        recognize(pair(char('.'), satisfy(|c| c.is_ascii_digit()))),
    ))(s)?;
    let mut end = 0;
    let mut prev = '\0';
    let mut chars = s.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        let accepted = c.is_ascii_alphanumeric()
            || c == '_'
            || c == '.'
            || (matches!(c, '+' | '-') && matches!(prev, 'e' | 'E' | 'p' | 'P'))
            || (c == '\''
                && chars
                    .peek()
                    .map_or(false, |&(_, next)| next.is_ascii_alphanumeric()));
        if !accepted {
            break;
        }
        end = idx + c.len_utf8();
        prev = c;
    }
    Ok((&s[end..], &s[..end]))
}

/// Parser for identifiers and keywords
fn identifier(s: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_alphabetic() || c == '_' || c == '$'),
        take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '$'),
    ))(s)
}

/// Parser for punctuation
///
/// Angle brackets are always emitted one at a time, so that `>>` closing two
/// template argument lists is seen as two closing brackets.
///
fn punctuation(s: &str) -> IResult<&str, &str> {
    alt((
        tag("::"),
        tag("..."),
        tag("->"),
        tag("&&"),
        tag("||"),
        tag("=="),
        tag("!="),
        recognize(anychar),
    ))(s)
}

/// Fallback for input that no parser accepts
fn stray_char(s: &str) -> (&str, Token<'_>) {
    let len = s.chars().next().map_or(s.len(), |c| c.len_utf8());
    (
        &s[len..],
        Token {
            kind: TokenKind::Punctuation,
            text: &s[..len],
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn kinds_and_texts(source: &str) -> Vec<(TokenKind, &str)> {
        tokenize(source)
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn declaration() {
        use TokenKind::*;
        assert_eq!(
            kinds_and_texts("template <class T> std::vector<T>&& f(T x);"),
            vec![
                (Identifier, "template"),
                (Punctuation, "<"),
                (Identifier, "class"),
                (Identifier, "T"),
                (Punctuation, ">"),
                (Identifier, "std"),
                (Punctuation, "::"),
                (Identifier, "vector"),
                (Punctuation, "<"),
                (Identifier, "T"),
                (Punctuation, ">"),
                (Punctuation, "&&"),
                (Identifier, "f"),
                (Punctuation, "("),
                (Identifier, "T"),
                (Identifier, "x"),
                (Punctuation, ")"),
                (Punctuation, ";"),
            ]
        );
    }

    #[test]
    fn nested_closing_angles() {
        let closing = kinds_and_texts("A<B<int>>")
            .into_iter()
            .filter(|&(_, text)| text == ">")
            .count();
        assert_eq!(closing, 2);
    }

    #[test]
    fn literals() {
        use TokenKind::*;
        assert_eq!(
            kinds_and_texts(r#""a \" b" u8"x" L'\'' 'c' R"x(a ) " b)x" 1'000 0x1p-3 .5f"#),
            vec![
                (Literal, r#""a \" b""#),
                (Literal, r#"u8"x""#),
                (Literal, r"L'\''"),
                (Literal, "'c'"),
                (Literal, r#"R"x(a ) " b)x""#),
                (Number, "1'000"),
                (Number, "0x1p-3"),
                (Number, ".5f"),
            ]
        );
    }

    #[test]
    fn comments() {
        use TokenKind::*;
        assert_eq!(
            kinds_and_texts("a // b { c\n/* { */ d /* unterminated"),
            vec![
                (Identifier, "a"),
                (Comment, "// b { c"),
                (Comment, "/* { */"),
                (Identifier, "d"),
                (Comment, "/* unterminated"),
            ]
        );
    }

    #[test]
    fn directives() {
        use TokenKind::*;
        assert_eq!(
            kinds_and_texts("# 1 \"a.cpp\"\n  #pragma once \\\n  continued\nx # y"),
            vec![
                (Directive, "# 1 \"a.cpp\""),
                (Directive, "#pragma once \\\n  continued"),
                (Identifier, "x"),
                (Punctuation, "#"),
                (Identifier, "y"),
            ]
        );
    }

    proptest! {
        #[test]
        fn lossless(source in any::<String>()) {
            let rebuilt = tokenize(&source).into_iter().map(|t| t.text).collect::<String>();
            prop_assert_eq!(rebuilt, source);
        }

        #[test]
        fn no_empty_tokens(source in any::<String>()) {
            prop_assert!(tokenize(&source).iter().all(|t| !t.text.is_empty()));
        }
    }
}
