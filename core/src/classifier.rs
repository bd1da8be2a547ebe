//! Cookie name classification.
//!
//! An ordered rule table maps a cookie name to a [`CookieCategory`]; the
//! first matching rule wins and names no rule matches are `Unknown`.
//! Matching is case-insensitive. Classification is pure and total: once a
//! classifier is built it cannot fail.

use std::collections::BTreeMap;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::category::CookieCategory;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("invalid pattern `{pattern}` in classifier rule {index}: {source}")]
    InvalidPattern {
        index: usize,
        pattern: String,
        #[source]
        source: regex_lite::Error,
    },

    #[error("empty matcher in classifier rule {index}")]
    EmptyMatcher { index: usize },
}

/// How a rule matches a cookie name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
    Pattern,
}

/// Serializable form of one classification rule, as found in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "match")]
    pub kind: MatchKind,
    pub value: String,
    pub category: CookieCategory,
}

impl RuleSpec {
    pub fn new(kind: MatchKind, value: &str, category: CookieCategory) -> Self {
        Self {
            kind,
            value: value.to_string(),
            category,
        }
    }
}

#[derive(Debug, Clone)]
enum NameMatcher {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl NameMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Exact(exact) => name == exact,
            NameMatcher::Prefix(prefix) => name.starts_with(prefix.as_str()),
            NameMatcher::Pattern(regex) => regex.is_match(name),
        }
    }
}

#[derive(Debug, Clone)]
struct ClassificationRule {
    matcher: NameMatcher,
    category: CookieCategory,
}

/// Maps cookie names to categories.
#[derive(Debug, Clone)]
pub struct CookieClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for CookieClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl CookieClassifier {
    /// Built-in table: session and anti-forgery names, then analytics
    /// trackers, then ad/pixel names.
    pub fn default_rules() -> Vec<RuleSpec> {
        use CookieCategory::Analytics;
        use CookieCategory::Essential;
        use CookieCategory::Marketing;
        use MatchKind::Exact;
        use MatchKind::Pattern;
        use MatchKind::Prefix;

        vec![
            RuleSpec::new(Exact, "session_id", Essential),
            RuleSpec::new(Exact, "csrf_token", Essential),
            RuleSpec::new(
                Pattern,
                r"^(session|sess|sid|phpsessid|jsessionid)([_.-]|$)",
                Essential,
            ),
            RuleSpec::new(Pattern, r"(csrf|xsrf)", Essential),
            RuleSpec::new(Exact, "_ga", Analytics),
            RuleSpec::new(Exact, "_utm", Analytics),
            RuleSpec::new(Prefix, "_ga_", Analytics),
            RuleSpec::new(Exact, "_gid", Analytics),
            RuleSpec::new(Prefix, "_gat", Analytics),
            RuleSpec::new(Prefix, "__utm", Analytics),
            RuleSpec::new(Prefix, "_utm", Analytics),
            RuleSpec::new(Prefix, "_hj", Analytics),
            RuleSpec::new(Exact, "ad_id", Marketing),
            RuleSpec::new(Exact, "fb_pixel", Marketing),
            RuleSpec::new(Exact, "_fbp", Marketing),
            RuleSpec::new(Prefix, "_gcl", Marketing),
            RuleSpec::new(Pattern, r"^ads?[_-]", Marketing),
            RuleSpec::new(Pattern, r"pixel", Marketing),
        ]
    }

    pub fn with_default_rules() -> Self {
        let rules = Self::default_rules()
            .into_iter()
            .filter_map(|spec| match compile(&spec) {
                Ok(rule) => Some(rule),
                Err(_) => {
                    tracing::error!(
                        "Dropping built-in cookie rule {:?} {:?}: does not compile",
                        spec.kind,
                        spec.value
                    );
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Build a classifier from an ordered rule list.
    pub fn from_rules(specs: &[RuleSpec]) -> Result<Self, ClassifierError> {
        let mut rules = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let rule = compile(spec).map_err(|err| match err {
                CompileError::Empty => ClassifierError::EmptyMatcher { index },
                CompileError::Regex(source) => ClassifierError::InvalidPattern {
                    index,
                    pattern: spec.value.clone(),
                    source,
                },
            })?;
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn classify(&self, name: &str) -> CookieCategory {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return CookieCategory::Unknown;
        }
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(&name))
            .map_or(CookieCategory::Unknown, |rule| rule.category)
    }

    /// Count how many of `names` fall into each category. Categories with
    /// no hits are omitted.
    pub fn summarize<I, S>(&self, names: I) -> BTreeMap<CookieCategory, usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts = BTreeMap::new();
        for name in names {
            *counts.entry(self.classify(name.as_ref())).or_insert(0) += 1;
        }
        counts
    }
}

enum CompileError {
    Empty,
    Regex(regex_lite::Error),
}

fn compile(spec: &RuleSpec) -> Result<ClassificationRule, CompileError> {
    let value = spec.value.trim();
    if value.is_empty() {
        return Err(CompileError::Empty);
    }
    let matcher = match spec.kind {
        MatchKind::Exact => NameMatcher::Exact(value.to_ascii_lowercase()),
        MatchKind::Prefix => NameMatcher::Prefix(value.to_ascii_lowercase()),
        MatchKind::Pattern => NameMatcher::Pattern(
            Regex::new(&format!("(?i){value}")).map_err(CompileError::Regex)?,
        ),
    };
    Ok(ClassificationRule {
        matcher,
        category: spec.category,
    })
}
