//! Canonical evaluator queries and their reply grammar.
//!
//! Queries are single lines of the form `operation(arg1, arg2, ...).`
//! Booleans are written as `true`/`false`, categories as their lowercase
//! token. Replies are one line each:
//!
//! ```text
//! can_set_cookie(marketing, true).        -> true | false
//! requires_consent(analytics, Requires).  -> true | false
//! classify_cookie(session_id, Type).      -> essential | analytics | ... | unknown
//! <anything the evaluator cannot answer>  -> unsupported
//! ```

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::category::CookieCategory;
use crate::error::ConsentError;

/// Reply token the evaluator uses for goals it has no rule for.
pub const UNSUPPORTED_REPLY: &str = "unsupported";

/// Final cookie decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    CanSetCookie,
    RequiresConsent,
    ClassifyCookie,
}

impl QueryKind {
    pub fn operation(self) -> &'static str {
        match self {
            QueryKind::CanSetCookie => "can_set_cookie",
            QueryKind::RequiresConsent => "requires_consent",
            QueryKind::ClassifyCookie => "classify_cookie",
        }
    }
}

/// A decision request for the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    CanSetCookie {
        category: CookieCategory,
        consent_given: bool,
    },
    RequiresConsent {
        category: CookieCategory,
    },
    ClassifyCookie {
        name: String,
    },
}

impl Query {
    pub fn can_set_cookie(category: CookieCategory, consent_given: bool) -> Self {
        Query::CanSetCookie {
            category,
            consent_given,
        }
    }

    pub fn requires_consent(category: CookieCategory) -> Self {
        Query::RequiresConsent { category }
    }

    pub fn classify_cookie(name: impl Into<String>) -> Self {
        Query::ClassifyCookie { name: name.into() }
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            Query::CanSetCookie { .. } => QueryKind::CanSetCookie,
            Query::RequiresConsent { .. } => QueryKind::RequiresConsent,
            Query::ClassifyCookie { .. } => QueryKind::ClassifyCookie,
        }
    }

    /// Canonical wire text, without the trailing newline.
    pub fn to_wire(&self) -> String {
        let op = self.kind().operation();
        match self {
            Query::CanSetCookie {
                category,
                consent_given,
            } => format!("{op}({}, {consent_given}).", category.token()),
            Query::RequiresConsent { category } => {
                format!("{op}({}, Requires).", category.token())
            }
            Query::ClassifyCookie { name } => format!("{op}({}, Type).", atom(name)),
        }
    }

    /// Parse one raw reply line against this query's grammar.
    pub fn parse_reply(&self, raw: &str) -> Result<Reply, ConsentError> {
        let text = raw.trim();
        if text == UNSUPPORTED_REPLY {
            return Err(ConsentError::UnsupportedQuery {
                query: self.to_wire(),
            });
        }
        let parsed = match self.kind() {
            QueryKind::CanSetCookie => boolean(text).map(|allowed| Reply::Decision(allowed.into())),
            QueryKind::RequiresConsent => boolean(text).map(Reply::Requirement),
            QueryKind::ClassifyCookie => CookieCategory::from_token(text).map(Reply::Category),
        };
        parsed.ok_or_else(|| ConsentError::MalformedReply {
            query: self.to_wire(),
            reply: raw.to_string(),
        })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// A parsed evaluator reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Decision(Decision),
    Requirement(bool),
    Category(CookieCategory),
}

fn boolean(text: &str) -> Option<bool> {
    match text {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Render a cookie name as an atom: bare when it already reads as a
/// lowercase identifier, single-quoted otherwise.
fn atom(name: &str) -> String {
    let mut chars = name.chars();
    let bare = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if bare {
        return name.to_string();
    }
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('\'');
    for c in name.chars() {
        match c {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}
