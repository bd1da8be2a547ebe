use std::sync::Arc;
use std::time::Duration;

use consent_core::ConsentError;
use consent_core::CookieCategory;
use consent_core::Decision;
use consent_core::EvaluatorEvent;
use consent_core::EvaluatorState;
use consent_core::RuleEvaluatorProcess;
use consent_core::evaluator::Readiness;
use core_test_support::FakeLauncher;
use core_test_support::WAIT;
use core_test_support::fake_engine;
use core_test_support::ready_engine;
use core_test_support::wait_for_state;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn start_reaches_ready_after_the_probe_reply() {
    let launcher = FakeLauncher::new();
    let engine = fake_engine(&launcher);
    assert_eq!(engine.evaluator().state(), EvaluatorState::NotInitialized);
    let mut events = engine.evaluator().subscribe_events();

    engine.start_and_wait(WAIT).await.unwrap();

    assert!(engine.evaluator().is_ready());
    assert_eq!(engine.evaluator().generation(), 1);
    assert_eq!(
        launcher.received(),
        vec!["requires_consent(essential, Requires).".to_string()]
    );
    assert_eq!(
        events.recv().await.unwrap(),
        EvaluatorEvent::Started {
            generation: 1,
            pid: None
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        EvaluatorEvent::Ready { generation: 1 }
    );
}

#[tokio::test]
async fn restart_after_a_crash_opens_a_new_generation() {
    let launcher = FakeLauncher::new();
    let engine = ready_engine(&launcher).await;

    launcher.crash(9);
    wait_for_state(engine.evaluator(), EvaluatorState::Crashed).await;
    assert!(!engine.evaluator().is_ready());

    engine.start_and_wait(WAIT).await.unwrap();
    assert_eq!(engine.evaluator().generation(), 2);
    assert_eq!(launcher.launches(), 2);

    let decision = engine
        .resolver()
        .decide("2", CookieCategory::Marketing)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Allowed);
}

#[tokio::test]
async fn starting_a_running_evaluator_is_rejected() {
    let launcher = FakeLauncher::new();
    let engine = ready_engine(&launcher).await;

    let err = engine.start().await.unwrap_err();
    assert!(
        matches!(
            err,
            ConsentError::InvalidTransition {
                action: "start",
                state: EvaluatorState::Ready
            }
        ),
        "{err}"
    );
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn failed_launch_leaves_the_evaluator_crashed() {
    let launcher = FakeLauncher::new();
    launcher.fail_next_launch();
    let engine = fake_engine(&launcher);

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, ConsentError::Launch { .. }), "{err}");
    assert_eq!(engine.evaluator().state(), EvaluatorState::Crashed);

    engine.start_and_wait(WAIT).await.unwrap();
    assert_eq!(engine.evaluator().generation(), 2);
}

#[tokio::test]
async fn malformed_probe_reply_fails_startup() {
    let launcher = FakeLauncher::new();
    launcher.set_reply("requires_consent(essential, Requires).", "maybe");
    let engine = fake_engine(&launcher);

    engine.start().await.unwrap();
    let err = engine.evaluator().wait_ready(WAIT).await.unwrap_err();
    assert!(err.is_unavailable(), "{err}");
    assert_eq!(engine.evaluator().state(), EvaluatorState::Crashed);
}

#[tokio::test]
async fn delay_readiness_skips_the_probe() {
    let launcher = FakeLauncher::new();
    let evaluator = RuleEvaluatorProcess::new(
        Arc::new(launcher.clone()),
        Readiness::Delay {
            after: Duration::from_millis(20),
        },
    );

    evaluator.start().await.unwrap();
    assert_eq!(evaluator.state(), EvaluatorState::Starting);
    evaluator.wait_ready(WAIT).await.unwrap();
    assert_eq!(launcher.received(), Vec::<String>::new());
    evaluator.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_is_terminal() {
    let launcher = FakeLauncher::new();
    let engine = fake_engine(&launcher);

    engine.stop().await.unwrap();
    assert_eq!(engine.evaluator().state(), EvaluatorState::Stopped);

    let err = engine.start().await.unwrap_err();
    assert!(
        matches!(
            err,
            ConsentError::InvalidTransition {
                state: EvaluatorState::Stopped,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(launcher.launches(), 0);
}
