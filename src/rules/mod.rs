//! Compiled rewrite rules
//!
//! A [`RuleSet`] is built from a [`RulesDocument`] and indexes rules first by
//! kind and then by host pattern.

mod matcher;
mod substitution;

pub use matcher::{HostMatcher, UrlRule};
pub use substitution::{NotMatch, Substitution};

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::models::RulesDocument;

/// Errors that disqualify a single rule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleCompileError {
    #[error("Invalid substitution {expr:?}: {reason}")]
    Syntax { expr: String, reason: String },

    #[error("Invalid regular expression {pattern:?}: {reason}")]
    Regex { pattern: String, reason: String },

    #[error("Unknown rule type {0}")]
    UnknownKind(i64),

    #[error("Rule has no type")]
    MissingKind,
}

/// What a rule operates on and how its output is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Rewrite the request URL, same host only
    RewriteUrl,
    /// Answer with a redirect to the rewritten URL
    RedirectUrl,
    RewriteHtml,
    RewriteJs,
    /// Like `RedirectUrl`, with the output percent-decoded first
    FastRedirectUrl,
}

impl RuleKind {
    pub const ALL: [RuleKind; 5] = [
        RuleKind::RewriteUrl,
        RuleKind::RedirectUrl,
        RuleKind::RewriteHtml,
        RuleKind::RewriteJs,
        RuleKind::FastRedirectUrl,
    ];

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::RewriteUrl),
            1 => Some(Self::RedirectUrl),
            2 => Some(Self::RewriteHtml),
            3 => Some(Self::RewriteJs),
            4 => Some(Self::FastRedirectUrl),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::RewriteUrl => 0,
            Self::RedirectUrl => 1,
            Self::RewriteHtml => 2,
            Self::RewriteJs => 3,
            Self::FastRedirectUrl => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RewriteUrl => "rewrite_url",
            Self::RedirectUrl => "redirect_url",
            Self::RewriteHtml => "rewrite_html",
            Self::RewriteJs => "rewrite_js",
            Self::FastRedirectUrl => "fast_redirect_url",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All compiled rules plus the document's global flags
#[derive(Debug, Default)]
pub struct RuleSet {
    local_passthrough: bool,
    max_rewrite_body_bytes: i64,
    matchers: HashMap<RuleKind, HostMatcher>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile every rule in `doc`, skipping the ones that fail
    pub fn compile(doc: &RulesDocument) -> Self {
        let mut set = Self {
            local_passthrough: doc.local,
            max_rewrite_body_bytes: doc.limits.max_response_content_len,
            matchers: HashMap::new(),
        };

        for group in &doc.srules {
            for entry in &group.compilers {
                let compiled = entry
                    .effective_kind(group)
                    .ok_or(RuleCompileError::MissingKind)
                    .and_then(|code| {
                        RuleKind::from_code(code).ok_or(RuleCompileError::UnknownKind(code))
                    })
                    .and_then(|kind| UrlRule::compile(entry).map(|rule| (kind, rule)));

                match compiled {
                    Ok((kind, rule)) => {
                        set.matchers.entry(kind).or_default().insert(&entry.host, rule);
                    }
                    Err(e) => {
                        warn!(host = %entry.host, url = %entry.url, error = %e, "Skipping rule");
                    }
                }
            }
        }

        debug!(
            rules = set.rule_count(),
            local = set.local_passthrough,
            max_body = set.max_rewrite_body_bytes,
            "Compiled rule set"
        );
        set
    }

    pub fn from_json(bytes: &[u8]) -> crate::error::Result<Self> {
        let doc: RulesDocument = serde_json::from_slice(bytes)?;
        Ok(Self::compile(&doc))
    }

    pub fn local_passthrough(&self) -> bool {
        self.local_passthrough
    }

    pub fn max_rewrite_body_bytes(&self) -> i64 {
        self.max_rewrite_body_bytes
    }

    pub fn rule_count(&self) -> usize {
        self.matchers.values().map(HostMatcher::len).sum()
    }

    pub fn count(&self, kind: RuleKind) -> usize {
        self.matchers.get(&kind).map_or(0, HostMatcher::len)
    }

    /// Apply the first matching rule of `kind` for `url` to `src`
    pub fn replace(&self, kind: RuleKind, url: &Url, src: &[u8]) -> Result<Vec<u8>, NotMatch> {
        self.matchers
            .get(&kind)
            .ok_or(NotMatch)?
            .replace(url, src)
    }
}
