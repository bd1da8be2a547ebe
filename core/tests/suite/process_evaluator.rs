#![cfg(unix)]
//! Supervision of a real child process speaking the query protocol.

use std::path::PathBuf;

use consent_core::ConsentEngine;
use consent_core::CookieCategory;
use consent_core::CookieClassifier;
use consent_core::Decision;
use consent_core::EvaluatorConfig;
use consent_core::EvaluatorEvent;
use consent_core::EvaluatorState;
use consent_core::RuleEvaluatorProcess;
use consent_core::evaluator::ReadinessMode;
use core_test_support::WAIT;
use core_test_support::seeded_store;
use core_test_support::wait_for_state;
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn shell_config(args: Vec<String>) -> EvaluatorConfig {
    EvaluatorConfig {
        program: "sh".to_string(),
        args,
        readiness_timeout_ms: 2_000,
        stop_grace_ms: 500,
        ..Default::default()
    }
}

#[tokio::test]
async fn shell_evaluator_answers_decisions() {
    let config = shell_config(vec![fixture("fake_evaluator.sh")]);
    let engine = ConsentEngine::new(
        RuleEvaluatorProcess::from_config(&config),
        seeded_store(),
        CookieClassifier::with_default_rules(),
    );
    engine.start_and_wait(WAIT).await.unwrap();
    assert!(engine.evaluator().pid().await.is_some());

    let resolver = engine.resolver();
    assert_eq!(
        resolver.decide("2", CookieCategory::Marketing).await.unwrap(),
        Decision::Allowed
    );
    assert_eq!(
        resolver.decide("3", CookieCategory::Marketing).await.unwrap(),
        Decision::Denied
    );
    assert!(
        !resolver
            .requires_consent(CookieCategory::Essential)
            .await
            .unwrap()
    );
    assert!(
        resolver
            .requires_consent(CookieCategory::Analytics)
            .await
            .unwrap()
    );

    engine.stop().await.unwrap();
    assert_eq!(engine.evaluator().state(), EvaluatorState::Stopped);
    let err = resolver
        .decide("2", CookieCategory::Analytics)
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "{err}");
}

#[tokio::test]
async fn process_exit_is_reported_with_its_code() {
    let config = EvaluatorConfig {
        readiness: ReadinessMode::Delay,
        readiness_delay_ms: 2_000,
        ..shell_config(vec!["-c".to_string(), "exit 7".to_string()])
    };
    let evaluator = RuleEvaluatorProcess::from_config(&config);
    let mut events = evaluator.subscribe_events();

    evaluator.start().await.unwrap();
    wait_for_state(&evaluator, EvaluatorState::Crashed).await;

    let crashed = tokio::time::timeout(WAIT, async {
        loop {
            if let event @ EvaluatorEvent::Crashed { .. } = events.recv().await.unwrap() {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        crashed,
        EvaluatorEvent::Crashed {
            generation: 1,
            code: Some(7)
        }
    );
}
