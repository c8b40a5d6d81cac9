//! Recognition of template instantiations in compiler diagnostics
//!
//! Compilers do not share a diagnostic format, so recognizing which template
//! instantiation a marker diagnostic comes from is delegated to a pluggable
//! grammar that turns raw output lines into instantiation samples.

use regex::Regex;
use std::fmt::Debug;
use thiserror::Error;
use tplmarker::MARKER_NAMESPACE;

/// One observation of a template instantiation
#[derive(Clone, Debug, PartialEq)]
pub struct InstantiationSample {
    /// Normalized template signature
    pub signature: Box<str>,

    /// Cost attributed to this observation
    pub cost: f64,
}

/// Parser of compiler output into instantiation samples
///
/// Lines are fed in the order where the compiler emitted them, so grammars may
/// keep state across lines.
///
pub trait DiagnosticGrammar: Debug + Send {
    /// Parse one line of compiler output, which may or may not describe an
    /// instantiation
    fn parse_line(&mut self, line: &str) -> Option<InstantiationSample>;
}

/// Built-in diagnostic grammars
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum GrammarKind {
    /// GCC's "In instantiation of '...'" context lines
    Gcc,

    /// Clang's "note: in instantiation of ... '...' requested here"
    Clang,

    /// MSVC's "see reference to ... template instantiation '...' being
    /// compiled"
    Msvc,
}
//
impl GrammarKind {
    /// Set up a grammar of this kind
    pub fn grammar(self) -> Box<dyn DiagnosticGrammar> {
        Box::new(match self {
            Self::Gcc => RegexGrammar::gcc(),
            Self::Clang => RegexGrammar::clang(),
            Self::Msvc => RegexGrammar::msvc(),
        })
    }
}

/// Grammar based on regular expressions
///
/// Every line matching `pattern` yields a sample whose signature is the
/// `signature` capture group and whose cost is the `cost` capture group, or 1
/// if the pattern has no such group.
///
/// If a `trigger` is set, only the first match following each trigger line is
/// kept. This is needed when compilers print a whole chain of instantiation
/// contexts below a diagnostic, of which only the first is relevant.
///
/// If a `confirmation` is set, a match is only kept if a line matching
/// `confirmation` follows it before the next match. This is needed when
/// compilers print the instantiation context above the diagnostic, and the
/// same context may introduce unrelated diagnostics.
///
/// Instantiations of the marker helpers themselves are ignored.
///
#[derive(Clone, Debug)]
pub struct RegexGrammar {
    /// Pattern of instantiation lines
    pattern: Regex,

    /// Pattern of lines after which instantiation lines are relevant
    trigger: Option<Regex>,

    /// Truth that a trigger line has been seen but no instantiation yet
    armed: bool,

    /// Pattern of lines which validate the previous instantiation line
    confirmation: Option<Regex>,

    /// Last instantiation seen, awaiting confirmation
    pending: Option<InstantiationSample>,
}
//
impl RegexGrammar {
    /// Recognize instantiations using a custom pattern
    ///
    /// The pattern must contain a capture group named `signature`. It may also
    /// contain a capture group named `cost`, which must match a number.
    ///
    pub fn new(pattern: &str) -> Result<Self, GrammarError> {
        let pattern = Regex::new(pattern)?;
        if !pattern
            .capture_names()
            .any(|name| name == Some(SIGNATURE_GROUP))
        {
            return Err(GrammarError::MissingSignature);
        }
        Ok(Self {
            pattern,
            trigger: None,
            armed: false,
            confirmation: None,
            pending: None,
        })
    }

    /// Only keep the first instantiation after each line matching `trigger`
    pub fn with_trigger(mut self, trigger: &str) -> Result<Self, GrammarError> {
        self.trigger = Some(Regex::new(trigger)?);
        Ok(self)
    }

    /// Only keep instantiations followed by a line matching `confirmation`
    pub fn with_confirmation(mut self, confirmation: &str) -> Result<Self, GrammarError> {
        self.confirmation = Some(Regex::new(confirmation)?);
        Ok(self)
    }

    /// Grammar of GCC's instantiation contexts
    pub fn gcc() -> Self {
        Self::new(r"In instantiation of ['‘](?P<signature>.+)['’]:?\s*$")
            .and_then(|grammar| grammar.with_confirmation(r"warning: .*template_profiler"))
            .expect("Known-good preset pattern")
    }

    /// Grammar of clang's instantiation notes
    pub fn clang() -> Self {
        Self::new(r"note: in instantiation of [^']*'(?P<signature>.+)' requested here")
            .and_then(|grammar| grammar.with_trigger(r"warning: .*template_profiler"))
            .expect("Known-good preset pattern")
    }

    /// Grammar of MSVC's instantiation notes
    pub fn msvc() -> Self {
        Self::new(r"see reference to .*template instantiation '(?P<signature>.+)' being compiled")
            .and_then(|grammar| grammar.with_trigger(r"warning C4996: .*template_profiler"))
            .expect("Known-good preset pattern")
    }
}
//
impl DiagnosticGrammar for RegexGrammar {
    fn parse_line(&mut self, line: &str) -> Option<InstantiationSample> {
        if let Some(confirmation) = &self.confirmation {
            if confirmation.is_match(line) {
                return self.pending.take();
            }
        }
        if let Some(trigger) = &self.trigger {
            if trigger.is_match(line) {
                self.armed = true;
                return None;
            }
            if !self.armed {
                return None;
            }
        }

        let captures = self.pattern.captures(line)?;
        let signature = captures.name(SIGNATURE_GROUP)?.as_str();
        if signature.contains(MARKER_NAMESPACE) {
            return None;
        }
        let cost = match captures.name(COST_GROUP) {
            Some(cost) => match cost.as_str().trim().parse::<f64>() {
                Ok(cost) if cost.is_finite() => cost,
                _ => {
                    log::trace!("Ignoring instantiation with invalid cost: {line}");
                    return None;
                }
            },
            None => 1.0,
        };
        self.armed = false;
        let sample = InstantiationSample {
            signature: normalize_signature(signature).into(),
            cost,
        };
        if self.confirmation.is_some() {
            self.pending = Some(sample);
            return None;
        }
        Some(sample)
    }
}

/// Name of the capture group holding the signature
const SIGNATURE_GROUP: &str = "signature";

/// Name of the capture group holding the cost
const COST_GROUP: &str = "cost";

/// Failure to set up a grammar
#[derive(Debug, Error)]
pub enum GrammarError {
    /// Invalid regular expression
    #[error("invalid regular expression ({0})")]
    BadRegex(#[from] regex::Error),

    /// No signature group in the pattern
    #[error("instantiation pattern has no capture group named \"signature\"")]
    MissingSignature,
}

/// Bring a template signature to a canonical spelling
///
/// Whitespace is only kept where it separates words, and after commas. Leading
/// elaborated type specifiers (`class`, `struct`, `union`, `enum`) are
/// dropped, so that the same template spelled by different diagnostics gets
/// the same signature.
///
pub fn normalize_signature(raw: &str) -> String {
    // Drop elaborated type specifiers
    let mut text = raw.trim();
    'strip: loop {
        for keyword in ["class", "struct", "union", "enum"] {
            if let Some(rest) = text.strip_prefix(keyword) {
                if rest.starts_with(char::is_whitespace) {
                    text = rest.trim_start();
                    continue 'strip;
                }
            }
        }
        break;
    }

    // Collapse whitespace
    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    let mut output = String::with_capacity(text.len());
    let mut saw_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            saw_space = true;
            continue;
        }
        if let Some(prev) = output.chars().next_back() {
            let keep_space = saw_space
                && (c == '='
                    || prev == '='
                    || c == '['
                    || (is_word(c) && (is_word(prev) || matches!(prev, '>' | ')' | ']' | '*' | '&'))));
            if c != ',' && (prev == ',' || keep_space) {
                output.push(' ');
            }
        }
        output.push(c);
        saw_space = false;
    }
    output
}
