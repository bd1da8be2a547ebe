use crate::category::CookieCategory;

/// Static table of which categories need explicit consent.
///
/// This is the local default. The evaluator stays the authority for
/// `requires_consent` queries; the resolver only uses this table to decide
/// whether a stored-consent lookup is needed at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsentPolicy;

impl ConsentPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn requires_consent(self, category: CookieCategory) -> bool {
        match category {
            CookieCategory::Essential => false,
            CookieCategory::Analytics
            | CookieCategory::Marketing
            | CookieCategory::Performance
            | CookieCategory::Unknown => true,
        }
    }
}
