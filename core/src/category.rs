//! Cookie categories and per-user consent records.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::AsRefStr;
use strum_macros::Display;
use strum_macros::EnumIter;
use strum_macros::EnumString;
use strum_macros::IntoStaticStr;

/// Closed set of cookie categories.
///
/// The lowercase name of each variant is also its token on the evaluator
/// wire (`essential`, `analytics`, ...).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CookieCategory {
    Essential,
    Analytics,
    Marketing,
    Performance,
    Unknown,
}

impl CookieCategory {
    /// Wire token for this category.
    pub fn token(self) -> &'static str {
        self.into()
    }

    /// Parse an exact wire token. Unlike `FromStr`, this is case-sensitive.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::iter().find(|category| category.token() == token)
    }

    /// Every category other than `Essential`.
    pub fn non_essential() -> impl Iterator<Item = CookieCategory> {
        Self::iter().filter(|category| *category != CookieCategory::Essential)
    }
}

/// Stored consent flags for one user.
///
/// Essential consent is implicit: it is never stored and always reads as
/// given. Categories missing from the record read as not given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    #[serde(default)]
    flags: BTreeMap<CookieCategory, bool>,
}

impl ConsentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether consent was given for `category`.
    pub fn get(&self, category: CookieCategory) -> bool {
        if category == CookieCategory::Essential {
            return true;
        }
        self.flags.get(&category).copied().unwrap_or(false)
    }

    /// Record a consent flag. Writes for `Essential` are ignored.
    pub fn set(&mut self, category: CookieCategory, given: bool) {
        if category == CookieCategory::Essential {
            return;
        }
        self.flags.insert(category, given);
    }

    /// Apply a batch of updates, ignoring `Essential`.
    pub fn apply(&mut self, updates: &BTreeMap<CookieCategory, bool>) {
        for (category, given) in updates {
            self.set(*category, *given);
        }
    }

    /// All non-essential categories with their effective flag.
    pub fn effective(&self) -> BTreeMap<CookieCategory, bool> {
        CookieCategory::non_essential()
            .map(|category| (category, self.get(category)))
            .collect()
    }
}
