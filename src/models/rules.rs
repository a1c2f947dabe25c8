use serde::{Deserialize, Serialize};

/// Rules document, fetched from `RULES_URL`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RulesDocument {
    /// Dial unmatched requests directly instead of through the upstream pool
    pub local: bool,
    pub limits: RuleLimits,
    pub srules: Vec<RuleGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuleLimits {
    /// Largest response body considered for rewriting
    pub max_response_content_len: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuleGroup {
    /// Rule type code applied to entries that carry none
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<i64>,
    pub compilers: Vec<RuleEntry>,
}

/// A host pattern, a URL regex and sed-style substitutions
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuleEntry {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<i64>,
    pub host: String,
    pub url: String,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
}

impl RuleEntry {
    /// Entry-level type wins over the group's
    pub fn effective_kind(&self, group: &RuleGroup) -> Option<i64> {
        self.kind.or(group.kind)
    }
}
