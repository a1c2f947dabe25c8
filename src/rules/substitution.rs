use std::borrow::Cow;

use thiserror::Error;

use super::RuleCompileError;

/// No rule produced a substitution for the input
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("regular expression does not match")]
pub struct NotMatch;

/// A compiled pattern, preferring the linear-time engine
///
/// Patterns that need backreferences or lookaround fall back to the
/// backtracking engine, which only operates on UTF-8 input.
#[derive(Debug)]
pub(crate) enum Pattern {
    Linear(regex::bytes::Regex),
    Backtracking(fancy_regex::Regex),
}

impl Pattern {
    pub(crate) fn compile(pattern: &str) -> Result<Self, RuleCompileError> {
        match regex::bytes::Regex::new(pattern) {
            Ok(re) => Ok(Self::Linear(re)),
            Err(primary) => fancy_regex::Regex::new(pattern)
                .map(Self::Backtracking)
                .map_err(|fallback| RuleCompileError::Regex {
                    pattern: pattern.to_string(),
                    reason: format!("{}; {}", primary, fallback),
                }),
        }
    }

    pub(crate) fn is_match(&self, haystack: &[u8]) -> bool {
        match self {
            Self::Linear(re) => re.is_match(haystack),
            Self::Backtracking(re) => std::str::from_utf8(haystack)
                .ok()
                .and_then(|s| re.is_match(s).ok())
                .unwrap_or(false),
        }
    }

    fn replace_all<'h>(&self, haystack: &'h [u8], template: &[u8]) -> Option<Cow<'h, [u8]>> {
        match self {
            Self::Linear(re) => Some(re.replace_all(haystack, template)),
            Self::Backtracking(re) => {
                let text = std::str::from_utf8(haystack).ok()?;
                let template = std::str::from_utf8(template).ok()?;
                let replaced = re.try_replacen(text, 0, template).ok()?;
                Some(Cow::Owned(replaced.into_owned().into_bytes()))
            }
        }
    }
}

/// A sed-style substitution `s<d>pattern<d>template<d>flags`
///
/// The delimiter is whatever character follows the leading `s`. Flags are
/// inline regex flags such as `i` or `s`.
#[derive(Debug)]
pub struct Substitution {
    expr: String,
    pattern: Pattern,
    template: Vec<u8>,
}

impl Substitution {
    pub fn compile(expr: &str) -> Result<Self, RuleCompileError> {
        let syntax = |reason: &str| RuleCompileError::Syntax {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let mut chars = expr.chars();
        match chars.next() {
            Some('s') | Some('S') => {}
            _ => return Err(syntax("expression must start with 's'")),
        }
        let delimiter = chars.next().ok_or_else(|| syntax("missing delimiter"))?;

        let parts: Vec<&str> = expr.split(delimiter).collect();
        let [_, pattern, template, flags] = parts.as_slice() else {
            return Err(syntax("expected exactly three delimited fields"));
        };

        let source = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", flags, pattern)
        };

        Ok(Self {
            expr: expr.to_string(),
            pattern: Pattern::compile(&source)?,
            template: template.as_bytes().to_vec(),
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Replace every match in `src`, or `NotMatch` when nothing matches
    pub fn apply(&self, src: &[u8]) -> Result<Vec<u8>, NotMatch> {
        if !self.pattern.is_match(src) {
            return Err(NotMatch);
        }
        self.pattern
            .replace_all(src, &self.template)
            .map(Cow::into_owned)
            .ok_or(NotMatch)
    }
}
