use std::sync::Arc;
use std::time::Duration;

use crate::classifier::CookieClassifier;
use crate::error::Result;
use crate::evaluator::EvaluatorStatus;
use crate::evaluator::RuleEvaluatorProcess;
use crate::queue::RequestQueue;
use crate::resolver::ConsentResolver;
use crate::store::ConsentStore;

/// One service instance: the supervised evaluator plus the resolver whose
/// queue drains into it.
///
/// Constructed explicitly and handed to whatever serves callers; there is
/// no global instance.
#[derive(Debug)]
pub struct ConsentEngine {
    evaluator: RuleEvaluatorProcess,
    resolver: ConsentResolver,
}

impl ConsentEngine {
    /// Must be called inside a tokio runtime (the queue spawns its
    /// dispatcher). The evaluator is not started.
    pub fn new(
        evaluator: RuleEvaluatorProcess,
        store: Arc<dyn ConsentStore>,
        classifier: CookieClassifier,
    ) -> Self {
        let queue = RequestQueue::new(&evaluator);
        Self {
            resolver: ConsentResolver::new(store, queue, classifier),
            evaluator,
        }
    }

    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.resolver = self.resolver.with_cookie_max_age(max_age);
        self
    }

    pub fn evaluator(&self) -> &RuleEvaluatorProcess {
        &self.evaluator
    }

    pub fn resolver(&self) -> &ConsentResolver {
        &self.resolver
    }

    pub fn status(&self) -> EvaluatorStatus {
        self.evaluator.status()
    }

    pub async fn start(&self) -> Result<()> {
        self.evaluator.start().await
    }

    /// Start and wait until the evaluator answers queries.
    pub async fn start_and_wait(&self, timeout: Duration) -> Result<()> {
        self.evaluator.start().await?;
        self.evaluator.wait_ready(timeout).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.evaluator.stop().await
    }
}
