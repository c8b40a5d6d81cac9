//! Insertion of instantiation markers into template bodies
//!
//! Every marker is a `static_assert` calling a deprecated function template
//! with dependent template arguments. The compiler can only resolve that call
//! when the enclosing template is instantiated, so it emits one deprecation
//! diagnostic per instantiation, prefixed with the usual "in instantiation
//! of ..." context. Markers are inserted right after the opening brace of the
//! body, without newlines, so that line numbers are preserved.

use crate::lexer::{self, Token, TokenKind};
use std::collections::BTreeMap;

/// Namespace holding the marker helpers
///
/// No user template lives in this namespace, so diagnostics mentioning it
/// can be attributed to the markers themselves.
///
pub const MARKER_NAMESPACE: &str = "template_profiler";

/// Declarations prepended to every instrumented translation unit
///
/// The line markers emitted by the preprocessor at the top of its output undo
/// the line offset that this introduces.
///
pub const PRELUDE: &str = "namespace template_profiler {\n\
template <class... T>\n\
[[deprecated(\"template_profiler\")]] constexpr int enter() noexcept { return 0; }\n\
}\n";

/// Instrumented translation unit
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instrumented {
    /// Source text of the instrumented unit, prelude included
    pub text: String,

    /// What was instrumented
    pub stats: MarkerStats,
}

/// Breakdown of the markers inserted into a translation unit
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MarkerStats {
    /// Class template bodies (primary templates and partial specializations)
    pub class_templates: usize,

    /// Function template bodies
    pub function_templates: usize,

    /// Non-template member function bodies inside class templates
    pub member_functions: usize,

    /// Template bodies which could not be marked because none of their
    /// template parameters can be named in a dependent way
    pub unmarked: usize,
}
//
impl MarkerStats {
    /// Total number of markers
    pub fn markers(&self) -> usize {
        self.class_templates + self.function_templates + self.member_functions
    }
}

/// Insert instantiation markers into a preprocessed translation unit
///
/// The output only depends on the input text.
///
pub fn instrument(source: &str) -> Instrumented {
    let tokens = lexer::tokenize(source);
    let mut scanner = Scanner::new(&tokens);
    scanner.scan_declarations(0, scanner.len(), None);
    let Scanner { markers, stats, .. } = scanner;

    let extra = markers.values().map(String::len).sum::<usize>();
    let mut text = String::with_capacity(PRELUDE.len() + source.len() + extra);
    text.push_str(PRELUDE);
    for (idx, token) in tokens.iter().enumerate() {
        text.push_str(token.text);
        if let Some(marker) = markers.get(&idx) {
            text.push_str(marker);
        }
    }
    Instrumented { text, stats }
}

/// Render a marker statement
fn marker(arguments: &[String]) -> String {
    format!(
        " static_assert(::{MARKER_NAMESPACE}::enter<{}>() == 0, \"{MARKER_NAMESPACE}\");",
        arguments.join(", ")
    )
}

/// Declaration-level walk over the significant tokens of a translation unit
///
/// Positions handled by this struct are indices into the list of significant
/// tokens, not into the full token list.
///
struct Scanner<'tokens, 'source> {
    /// Full token list
    tokens: &'tokens [Token<'source>],

    /// Indices of significant tokens within `tokens`
    significant: Vec<usize>,

    /// Position of the matching closing bracket for each opening `(`, `[`, `{`
    closing: Vec<Option<usize>>,

    /// Markers to be inserted after a given index of `tokens`
    markers: BTreeMap<usize, String>,

    /// Marker statistics
    stats: MarkerStats,
}
//
impl<'tokens, 'source> Scanner<'tokens, 'source> {
    /// Prepare to scan a token list
    fn new(tokens: &'tokens [Token<'source>]) -> Self {
        let significant = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| token.is_significant())
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        // Match brackets, leaving unbalanced ones unmatched
        let mut closing = vec![None; significant.len()];
        let mut open = Vec::<(usize, &str)>::new();
        for (pos, &idx) in significant.iter().enumerate() {
            let token = &tokens[idx];
            if token.kind != TokenKind::Punctuation {
                continue;
            }
            match token.text {
                "(" => open.push((pos, ")")),
                "[" => open.push((pos, "]")),
                "{" => open.push((pos, "}")),
                ")" | "]" | "}" => {
                    if let Some(&(open_pos, expected)) = open.last() {
                        if expected == token.text {
                            closing[open_pos] = Some(pos);
                            open.pop();
                        }
                    }
                }
                _ => {}
            }
        }

        Self {
            tokens,
            significant,
            closing,
            markers: BTreeMap::new(),
            stats: MarkerStats::default(),
        }
    }

    /// Number of significant tokens
    fn len(&self) -> usize {
        self.significant.len()
    }

    /// Significant token at a given position
    fn token(&self, pos: usize) -> Option<&Token<'source>> {
        self.significant.get(pos).map(|&idx| &self.tokens[idx])
    }

    /// Truth that the token at `pos` is a given punctuation symbol
    fn is(&self, pos: usize, symbol: &str) -> bool {
        self.token(pos).map_or(false, |t| t.is_punctuation(symbol))
    }

    /// Truth that the token at `pos` is a given keyword
    fn is_keyword(&self, pos: usize, keyword: &str) -> bool {
        self.token(pos).map_or(false, |t| t.is_keyword(keyword))
    }

    /// Identifier at `pos`, if any
    fn identifier(&self, pos: usize) -> Option<&'source str> {
        self.token(pos)
            .filter(|t| t.kind == TokenKind::Identifier)
            .map(|t| t.text)
    }

    /// Position of the bracket closing the one opened at `pos`
    ///
    /// Unbalanced brackets extend to the end of the token list.
    ///
    fn close(&self, pos: usize) -> usize {
        self.closing
            .get(pos)
            .copied()
            .flatten()
            .unwrap_or_else(|| self.len().saturating_sub(1).max(pos))
    }

    /// Record a marker after the opening brace at `pos`
    fn mark(&mut self, pos: usize, arguments: &[String]) {
        self.markers
            .insert(self.significant[pos], marker(arguments));
    }

    /// Walk over a sequence of declarations in `[pos, end)`
    ///
    /// `enclosing` is the injected class name of the innermost enclosing class
    /// template, if any.
    ///
    fn scan_declarations(&mut self, mut pos: usize, end: usize, enclosing: Option<&'source str>) {
        while pos < end {
            if self.is(pos, ";") {
                pos += 1;
                continue;
            }
            if ["public", "protected", "private"]
                .iter()
                .any(|access| self.is_keyword(pos, access))
                && self.is(pos + 1, ":")
            {
                pos += 2;
                continue;
            }
            if self.is_keyword(pos, "template") && self.is(pos + 1, "<") {
                pos = self.template_declaration(pos, end, enclosing);
                continue;
            }

            let decl = self.declaration(pos, end);
            match decl.body {
                Some((BodyKind::Scope, body)) => {
                    self.scan_declarations(body + 1, self.close(body), None);
                }
                Some((BodyKind::Class, body)) => {
                    self.scan_declarations(body + 1, self.close(body), enclosing);
                }
                Some((BodyKind::Function, body)) => {
                    if let Some(class) = enclosing {
                        self.mark(body, &[class.to_owned()]);
                        self.stats.member_functions += 1;
                    }
                }
                Some((BodyKind::Other, _)) | None => {}
            }
            pos = decl.end + 1;
        }
    }

    /// Handle a declaration introduced by one or more template heads
    ///
    /// Returns the position following the declaration.
    ///
    fn template_declaration(
        &mut self,
        mut pos: usize,
        end: usize,
        enclosing: Option<&'source str>,
    ) -> usize {
        // Collect template parameters across nested heads, e.g. for
        // out-of-line definitions of member templates of class templates
        let mut parameters = Vec::new();
        let mut specialization = false;
        while self.is_keyword(pos, "template") && self.is(pos + 1, "<") {
            let head_end = self.angle_end(pos + 1, end);
            if head_end == pos + 2 {
                specialization = true;
            }
            self.template_parameters(pos + 2, head_end, &mut parameters);
            pos = head_end + 1;
        }
        pos = self.skip_requires_clause(pos, end);

        let decl = self.declaration(pos, end);
        match decl.body {
            Some((BodyKind::Class, body)) => {
                let close = self.close(body);
                if specialization {
                    self.scan_declarations(body + 1, close, enclosing);
                } else if let Some(name) = decl.name {
                    self.mark(body, &[name.to_owned()]);
                    self.stats.class_templates += 1;
                    self.scan_declarations(body + 1, close, Some(name));
                } else {
                    self.stats.unmarked += 1;
                }
            }
            Some((BodyKind::Function, body)) if !specialization => {
                let mut arguments = parameters
                    .iter()
                    .filter_map(Parameter::argument)
                    .collect::<Vec<_>>();
                arguments.extend(enclosing.map(str::to_owned));
                if arguments.is_empty() {
                    self.stats.unmarked += 1;
                } else {
                    self.mark(body, &arguments);
                    self.stats.function_templates += 1;
                }
            }
            _ => {}
        }
        decl.end + 1
    }

    /// Find the `>` closing the template argument/parameter list opened at `open`
    fn angle_end(&self, open: usize, end: usize) -> usize {
        let mut depth = 0usize;
        let mut pos = open;
        while pos < end {
            if self.is(pos, "(") || self.is(pos, "[") || self.is(pos, "{") {
                pos = self.close(pos);
            } else if self.is(pos, "<") {
                depth += 1;
            } else if self.is(pos, ">") {
                depth -= 1;
                if depth == 0 {
                    return pos;
                }
            }
            pos += 1;
        }
        end.saturating_sub(1).max(open)
    }

    /// Parse the template parameters found in `[start, end)`
    fn template_parameters(&self, start: usize, end: usize, output: &mut Vec<Parameter<'source>>) {
        let mut depth = 0usize;
        let mut first = start;
        let mut pos = start;
        while pos <= end {
            if pos == end || (depth == 0 && self.is(pos, ",")) {
                if first < pos {
                    let parameter = self.template_parameter(first, pos, output.as_slice());
                    output.push(parameter);
                }
                first = pos + 1;
            } else if self.is(pos, "(") || self.is(pos, "[") || self.is(pos, "{") {
                pos = self.close(pos);
            } else if self.is(pos, "<") {
                depth += 1;
            } else if self.is(pos, ">") {
                depth = depth.saturating_sub(1);
            }
            pos += 1;
        }
    }

    /// Analyze a single template parameter spanning `[start, end)`
    fn template_parameter(
        &self,
        start: usize,
        end: usize,
        previous: &[Parameter<'source>],
    ) -> Parameter<'source> {
        if self.is_keyword(start, "template") {
            return Parameter::unknown();
        }

        // Strip the default argument
        let mut depth = 0usize;
        let mut decl_end = end;
        for pos in start..end {
            if self.is(pos, "<") {
                depth += 1;
            } else if self.is(pos, ">") {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && self.is(pos, "=") {
                decl_end = pos;
                break;
            }
        }

        // Split into type and name
        let tokens = (start..decl_end)
            .filter_map(|pos| self.token(pos))
            .filter(|t| !t.is_punctuation("..."))
            .collect::<Vec<_>>();
        let pack = (start..decl_end).any(|pos| self.is(pos, "..."));
        let Some((last, type_tokens)) = tokens.split_last() else {
            return Parameter::unknown();
        };
        if last.kind != TokenKind::Identifier || KEYWORDS.contains(&last.text) {
            return Parameter::unknown();
        }

        // Unnamed parameters end with their type, e.g. `std::size_t = 0` or
        // `typename enable_if<C, bool>::type = true`
        let qualified = type_tokens
            .last()
            .map_or(false, |t| t.is_punctuation("::"));
        if qualified || SCALAR_WORDS.contains(&last.text) {
            return Parameter::unknown();
        }
        let name = last.text;

        // Classify
        let kind = match type_tokens {
            [single] if single.is_keyword("class") || single.is_keyword("typename") => {
                ParameterKind::Type
            }
            [single]
                if previous
                    .iter()
                    .any(|p| p.kind == ParameterKind::Type && p.name == Some(single.text)) =>
            {
                ParameterKind::Value
            }
            [first, ..] if first.is_keyword("typename") || first.is_keyword("decltype") => {
                ParameterKind::Value
            }
            _ if !type_tokens.is_empty()
                && type_tokens.iter().all(|t| {
                    SCALAR_WORDS.contains(&t.text)
                        || t.is_punctuation("::")
                        || t.is_punctuation("*")
                        || t.is_punctuation("&")
                }) =>
            {
                ParameterKind::Value
            }
            _ => ParameterKind::Unknown,
        };
        Parameter {
            name: Some(name),
            kind,
            pack,
        }
    }

    /// Skip a requires-clause starting at `pos`, if there is one
    fn skip_requires_clause(&self, mut pos: usize, end: usize) -> usize {
        if !self.is_keyword(pos, "requires") {
            return pos;
        }
        pos += 1;
        while pos < end {
            // Primary expression: parenthesized or (qualified) concept-id
            if self.is(pos, "(") {
                pos = self.close(pos) + 1;
            } else {
                if self.is(pos, "::") {
                    pos += 1;
                }
                pos += 1;
                loop {
                    if self.is(pos, "<") {
                        pos = self.angle_end(pos, end) + 1;
                    } else if self.is(pos, "::") && self.identifier(pos + 1).is_some() {
                        pos += 2;
                    } else {
                        break;
                    }
                }
            }

            // Conjunctions and disjunctions
            if self.is(pos, "&&") || self.is(pos, "||") {
                pos += 1;
            } else {
                break;
            }
        }
        pos
    }

    /// Skip an operator function name starting at `pos`, returning the
    /// position of its last token
    fn skip_operator_name(&self, pos: usize, end: usize) -> usize {
        if self.is(pos + 1, "(") && self.is(pos + 2, ")") {
            return pos + 2;
        }
        let mut last = pos;
        while last + 1 < end && !self.is(last + 1, "(") {
            last += 1;
        }
        last
    }

    /// Find the extent and body of the declaration starting at `start`
    fn declaration(&self, start: usize, end: usize) -> Declaration<'source> {
        let mut angle_depth = 0usize;
        let mut saw_parameters = false;
        let mut saw_equal = false;
        let mut constructor_init = false;
        let mut pos = start;
        while pos < end {
            let Some(token) = self.token(pos) else {
                break;
            };
            match (token.kind, token.text) {
                (TokenKind::Punctuation, ";") => {
                    return Declaration {
                        body: None,
                        name: None,
                        end: pos,
                    };
                }
                (TokenKind::Punctuation, "(") => {
                    let after_keyword = pos > start
                        && self
                            .identifier(pos - 1)
                            .map_or(false, |prev| NON_FUNCTION_PARENS.contains(&prev));
                    if angle_depth == 0 && !saw_equal && !after_keyword {
                        saw_parameters = true;
                    }
                    pos = self.close(pos);
                }
                (TokenKind::Punctuation, "[") => pos = self.close(pos),
                (TokenKind::Punctuation, "<") => angle_depth += 1,
                (TokenKind::Punctuation, ">") => angle_depth = angle_depth.saturating_sub(1),
                (TokenKind::Punctuation, "=") if angle_depth == 0 => saw_equal = true,
                (TokenKind::Punctuation, ":") if angle_depth == 0 && saw_parameters => {
                    constructor_init = true
                }
                (TokenKind::Identifier, "operator") => pos = self.skip_operator_name(pos, end),
                (TokenKind::Punctuation, "{") => {
                    let after_initialized_name = pos > start
                        && (self.identifier(pos - 1).is_some() || self.is(pos - 1, ">"));
                    let initializer =
                        saw_equal || angle_depth > 0 || (constructor_init && after_initialized_name);
                    if !initializer {
                        return self.body_declaration(start, pos, end, saw_parameters);
                    }
                    pos = self.close(pos);
                }
                _ => {}
            }
            pos += 1;
        }
        Declaration {
            body: None,
            name: None,
            end: end.saturating_sub(1).max(start),
        }
    }

    /// Classify a declaration whose body opens at `body`
    fn body_declaration(
        &self,
        start: usize,
        body: usize,
        end: usize,
        saw_parameters: bool,
    ) -> Declaration<'source> {
        let first = self.skip_attributes(start, body);
        let close = self.close(body);
        let (kind, name) = if self.is_keyword(first, "namespace")
            || (self.is_keyword(first, "inline") && self.is_keyword(first + 1, "namespace"))
            || (self.is_keyword(first, "extern")
                && self.token(first + 1).map(|t| t.kind) == Some(TokenKind::Literal))
        {
            (BodyKind::Scope, None)
        } else if saw_parameters {
            (BodyKind::Function, None)
        } else if CLASS_KEYS.iter().any(|key| self.is_keyword(first, key)) {
            (BodyKind::Class, self.class_name(first + 1, body))
        } else {
            (BodyKind::Other, None)
        };

        // Class-like declarations may declare variables after their body
        let decl_end = match kind {
            BodyKind::Class | BodyKind::Other => {
                let mut pos = close + 1;
                while pos < end && !self.is(pos, ";") && !self.is(pos, "}") {
                    pos = if self.is(pos, "(") || self.is(pos, "[") || self.is(pos, "{") {
                        self.close(pos) + 1
                    } else {
                        pos + 1
                    };
                }
                pos.min(end.saturating_sub(1)).max(close)
            }
            BodyKind::Scope | BodyKind::Function => close,
        };
        Declaration {
            body: Some((kind, body)),
            name,
            end: decl_end,
        }
    }

    /// Skip attributes and declaration specifiers that may precede a
    /// declaration's leading keyword
    fn skip_attributes(&self, mut pos: usize, end: usize) -> usize {
        while pos < end {
            if self.is(pos, "[") && self.is(pos + 1, "[") {
                pos = self.close(pos) + 1;
            } else if self
                .identifier(pos)
                .map_or(false, |id| ATTRIBUTE_KEYWORDS.contains(&id))
                && self.is(pos + 1, "(")
            {
                pos = self.close(pos + 1) + 1;
            } else if self.is_keyword(pos, "export") || self.is_keyword(pos, "friend") {
                pos += 1;
            } else {
                break;
            }
        }
        pos
    }

    /// Find the injected class name of a class whose head spans
    /// `[start, body)`
    fn class_name(&self, start: usize, body: usize) -> Option<&'source str> {
        let mut name = None;
        let mut angle_depth = 0usize;
        let mut pos = self.skip_attributes(start, body);
        while pos < body {
            if self.is(pos, "<") {
                angle_depth += 1;
            } else if self.is(pos, ">") {
                angle_depth = angle_depth.saturating_sub(1);
            } else if angle_depth == 0 {
                if self.is(pos, ":") {
                    break;
                }
                if let Some(id) = self.identifier(pos) {
                    if !KEYWORDS.contains(&id) {
                        name = Some(id);
                    }
                }
                if self.is(pos, "(") || self.is(pos, "[") {
                    pos = self.close(pos);
                }
            }
            pos += 1;
        }
        name
    }
}

/// Extent of a declaration
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Declaration<'source> {
    /// Kind and position of the opening brace of the body, if any
    body: Option<(BodyKind, usize)>,

    /// Class name, for class bodies
    name: Option<&'source str>,

    /// Position of the last token of the declaration
    end: usize,
}

/// What a brace-enclosed declaration body contains
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BodyKind {
    /// Namespace or linkage specification
    Scope,

    /// Class, struct or union definition
    Class,

    /// Function definition
    Function,

    /// Anything else (enumerations, brace-initialized variables...)
    Other,
}

/// Template parameter
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Parameter<'source> {
    /// Parameter name, if any
    name: Option<&'source str>,

    /// What the name designates
    kind: ParameterKind,

    /// Truth that this is a parameter pack
    pack: bool,
}
//
impl<'source> Parameter<'source> {
    /// Parameter that cannot be used as a marker argument
    fn unknown() -> Self {
        Self {
            name: None,
            kind: ParameterKind::Unknown,
            pack: false,
        }
    }

    /// Template argument naming this parameter in a marker
    fn argument(&self) -> Option<String> {
        let name = self.name?;
        let ellipsis = if self.pack { "..." } else { "" };
        match self.kind {
            ParameterKind::Type => Some(format!("{name}{ellipsis}")),
            ParameterKind::Value => Some(format!("decltype({name}){ellipsis}")),
            ParameterKind::Unknown => None,
        }
    }
}
//
/// What a template parameter designates
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ParameterKind {
    /// A type
    Type,

    /// A value of some type
    Value,

    /// A template, or a type or value that cannot be told apart lexically
    /// (e.g. parameters constrained by a concept)
    Unknown,
}

/// Class keys introducing class definitions
const CLASS_KEYS: &[&str] = &["class", "struct", "union"];

/// Keywords that are never the name of a class or template parameter
const KEYWORDS: &[&str] = &[
    "alignas",
    "auto",
    "bool",
    "char",
    "char16_t",
    "char32_t",
    "char8_t",
    "class",
    "const",
    "constexpr",
    "decltype",
    "double",
    "final",
    "float",
    "int",
    "long",
    "short",
    "signed",
    "struct",
    "typename",
    "union",
    "unsigned",
    "void",
    "volatile",
    "wchar_t",
];

/// Words that may make up the type of a non-type template parameter
const SCALAR_WORDS: &[&str] = &[
    "auto",
    "bool",
    "char",
    "char16_t",
    "char32_t",
    "char8_t",
    "const",
    "int",
    "int16_t",
    "int32_t",
    "int64_t",
    "int8_t",
    "intptr_t",
    "long",
    "ptrdiff_t",
    "short",
    "signed",
    "size_t",
    "std",
    "uint16_t",
    "uint32_t",
    "uint64_t",
    "uint8_t",
    "uintptr_t",
    "unsigned",
    "wchar_t",
];

/// Keywords whose parenthesized operand does not make a declaration a
/// function
const NON_FUNCTION_PARENS: &[&str] = &[
    "__attribute__",
    "__declspec",
    "alignas",
    "alignof",
    "decltype",
    "sizeof",
];

/// Keywords introducing attribute-like specifiers with a parenthesized operand
const ATTRIBUTE_KEYWORDS: &[&str] = &["__attribute__", "__declspec", "alignas"];
