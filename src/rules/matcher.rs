use std::collections::HashMap;

use url::Url;

use super::substitution::{NotMatch, Pattern, Substitution};
use super::RuleCompileError;
use crate::models::RuleEntry;

/// One compiled rule: a URL pattern guarding an ordered list of substitutions
#[derive(Debug)]
pub struct UrlRule {
    url: Pattern,
    substitutions: Vec<Substitution>,
}

impl UrlRule {
    pub fn compile(entry: &RuleEntry) -> Result<Self, RuleCompileError> {
        let url = Pattern::compile(&entry.url)?;
        let substitutions = entry
            .matches
            .iter()
            .map(|expr| Substitution::compile(expr))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { url, substitutions })
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.url.is_match(url.as_bytes())
    }

    /// First successful substitution wins
    pub fn apply(&self, url: &str, src: &[u8]) -> Result<Vec<u8>, NotMatch> {
        if !self.matches_url(url) {
            return Err(NotMatch);
        }
        self.substitutions
            .iter()
            .find_map(|sub| sub.apply(src).ok())
            .ok_or(NotMatch)
    }
}

/// Rules indexed by host pattern
///
/// Keys are lowercased. A key with a leading dot matches the domain and all of
/// its subdomains, and the bare `.` key matches every host.
#[derive(Debug, Default)]
pub struct HostMatcher {
    buckets: HashMap<String, Vec<UrlRule>>,
}

impl HostMatcher {
    pub fn insert(&mut self, host: &str, rule: UrlRule) {
        self.buckets
            .entry(host.trim().to_lowercase())
            .or_default()
            .push(rule);
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Bucket keys to try for `host`, most specific first
    pub fn candidate_keys(host: &str) -> Vec<String> {
        let host = host.trim_end_matches('.').to_lowercase();
        let mut keys = vec![host.clone()];

        let mut rest = host.as_str();
        loop {
            keys.push(format!(".{}", rest));
            match rest.split_once('.') {
                Some((_, tail)) if !tail.is_empty() => rest = tail,
                _ => break,
            }
        }

        keys.push(".".to_string());
        keys.dedup();
        keys
    }

    pub fn replace(&self, url: &Url, src: &[u8]) -> Result<Vec<u8>, NotMatch> {
        let host = url.host_str().unwrap_or_default();
        let url = url.as_str();

        Self::candidate_keys(host)
            .iter()
            .filter_map(|key| self.buckets.get(key))
            .find_map(|rules| rules.iter().find_map(|rule| rule.apply(url, src).ok()))
            .ok_or(NotMatch)
    }
}
