//! Cookie consent decisions backed by a supervised external rule
//! evaluator.
//!
//! [`ConsentEngine`] wires the pieces together: a [`RuleEvaluatorProcess`]
//! owns the evaluator, a [`RequestQueue`] orders queries into it, and the
//! [`ConsentResolver`] combines the [`CookieClassifier`], the
//! [`ConsentPolicy`] and a [`ConsentStore`] into allow/deny decisions.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod category;
mod classifier;
mod engine;
pub mod error;
pub mod evaluator;
mod policy;
pub mod query;
mod queue;
mod resolver;
pub mod store;

pub use category::ConsentRecord;
pub use category::CookieCategory;
pub use classifier::ClassifierError;
pub use classifier::CookieClassifier;
pub use classifier::MatchKind;
pub use classifier::RuleSpec;
pub use engine::ConsentEngine;
pub use error::ConsentError;
pub use evaluator::EvaluatorConfig;
pub use evaluator::EvaluatorEvent;
pub use evaluator::EvaluatorState;
pub use evaluator::EvaluatorStatus;
pub use evaluator::RuleEvaluatorProcess;
pub use policy::ConsentPolicy;
pub use query::Decision;
pub use query::Query;
pub use query::Reply;
pub use queue::PendingReply;
pub use queue::RequestQueue;
pub use resolver::ConsentResolver;
pub use resolver::CookieGrant;
pub use resolver::DEFAULT_COOKIE_MAX_AGE;
pub use store::ConsentStore;
pub use store::FileConsentStore;
pub use store::InMemoryConsentStore;
pub use store::StoreError;
