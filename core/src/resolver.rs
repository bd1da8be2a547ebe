use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::category::ConsentRecord;
use crate::category::CookieCategory;
use crate::classifier::CookieClassifier;
use crate::error::ConsentError;
use crate::error::Result;
use crate::policy::ConsentPolicy;
use crate::query::Decision;
use crate::query::Query;
use crate::query::Reply;
use crate::queue::RequestQueue;
use crate::store::ConsentStore;
use crate::store::StoreError;

/// Default persistence for cookies that needed consent.
pub const DEFAULT_COOKIE_MAX_AGE: Duration = Duration::from_secs(3600);

/// Outcome of [`ConsentResolver::authorize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CookieGrant {
    pub category: CookieCategory,
    pub decision: Decision,
    /// `None` for session cookies and for denied cookies.
    #[serde(with = "max_age_secs")]
    pub max_age: Option<Duration>,
}

/// Top-level decision orchestrator.
///
/// Sources of truth, one per question:
/// - `decide`: the evaluator, except that `Essential` is allowed locally
///   without a store lookup or a round trip;
/// - `requires_consent`: the evaluator;
/// - `classify` and `summarize`: the local [`CookieClassifier`].
pub struct ConsentResolver {
    store: Arc<dyn ConsentStore>,
    queue: RequestQueue,
    policy: ConsentPolicy,
    classifier: CookieClassifier,
    cookie_max_age: Duration,
}

impl ConsentResolver {
    pub fn new(
        store: Arc<dyn ConsentStore>,
        queue: RequestQueue,
        classifier: CookieClassifier,
    ) -> Self {
        Self {
            store,
            queue,
            policy: ConsentPolicy::new(),
            classifier,
            cookie_max_age: DEFAULT_COOKIE_MAX_AGE,
        }
    }

    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn classifier(&self) -> &CookieClassifier {
        &self.classifier
    }

    /// May a cookie of `category` be set for `user_id`?
    ///
    /// A user unknown to the store (or an id the store rejects as blank)
    /// counts as not having consented.
    pub async fn decide(&self, user_id: &str, category: CookieCategory) -> Result<Decision> {
        if !self.policy.requires_consent(category) {
            return Ok(Decision::Allowed);
        }

        let consent_given = match self.store.get_consent(user_id, category).await {
            Ok(Some(given)) => given,
            // A blank id never names a stored user.
            Ok(None) | Err(StoreError::InvalidUserId { .. }) => {
                tracing::warn!("Unknown user {user_id:?}; treating {category} consent as not given");
                false
            }
            Err(err) => return Err(err.into()),
        };

        let query = Query::can_set_cookie(category, consent_given);
        match self.ask(&query).await? {
            Reply::Decision(decision) => {
                tracing::debug!("{category} for user {user_id:?}: {decision:?}");
                Ok(decision)
            }
            other => Err(unexpected(&query, other)),
        }
    }

    /// Whether `category` needs explicit consent, as the evaluator sees it.
    pub async fn requires_consent(&self, category: CookieCategory) -> Result<bool> {
        let query = Query::requires_consent(category);
        match self.ask(&query).await? {
            Reply::Requirement(required) => Ok(required),
            other => Err(unexpected(&query, other)),
        }
    }

    pub fn classify(&self, cookie_name: &str) -> CookieCategory {
        self.classifier.classify(cookie_name)
    }

    pub fn summarize<I, S>(&self, names: I) -> BTreeMap<CookieCategory, usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.classifier.summarize(names)
    }

    /// Decision plus cookie lifetime. Allowed cookies in categories that
    /// need no consent are session cookies; the others get the configured
    /// maximum age.
    pub async fn authorize(&self, user_id: &str, category: CookieCategory) -> Result<CookieGrant> {
        let decision = self.decide(user_id, category).await?;
        let max_age = if decision.is_allowed() && self.requires_consent(category).await? {
            Some(self.cookie_max_age)
        } else {
            None
        };
        Ok(CookieGrant {
            category,
            decision,
            max_age,
        })
    }

    pub async fn update_consent(
        &self,
        user_id: &str,
        updates: &BTreeMap<CookieCategory, bool>,
    ) -> Result<ConsentRecord> {
        let record = self.store.update_consent(user_id, updates).await?;
        tracing::info!("Updated consent for user {user_id:?}");
        Ok(record)
    }

    pub async fn consent_record(&self, user_id: &str) -> Result<Option<ConsentRecord>> {
        Ok(self.store.get_record(user_id).await?)
    }

    async fn ask(&self, query: &Query) -> Result<Reply> {
        self.queue.submit(query.clone()).await
    }
}

impl std::fmt::Debug for ConsentResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentResolver")
            .field("queue", &self.queue)
            .field("classifier_rules", &self.classifier.rule_count())
            .field("cookie_max_age", &self.cookie_max_age)
            .finish_non_exhaustive()
    }
}

fn unexpected(query: &Query, reply: Reply) -> ConsentError {
    ConsentError::MalformedReply {
        query: query.to_wire(),
        reply: format!("{reply:?}"),
    }
}

mod max_age_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }
}
