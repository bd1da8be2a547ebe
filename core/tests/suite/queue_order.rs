use std::time::Duration;

use consent_core::ConsentError;
use consent_core::CookieCategory;
use consent_core::Decision;
use consent_core::EvaluatorEvent;
use consent_core::EvaluatorState;
use consent_core::Query;
use consent_core::Reply;
use core_test_support::FakeLauncher;
use core_test_support::WAIT;
use core_test_support::fake_engine;
use core_test_support::ready_engine;
use core_test_support::wait_for_state;
use pretty_assertions::assert_eq;

fn batch() -> Vec<Query> {
    vec![
        Query::can_set_cookie(CookieCategory::Marketing, true),
        Query::requires_consent(CookieCategory::Analytics),
        Query::can_set_cookie(CookieCategory::Analytics, false),
        Query::requires_consent(CookieCategory::Performance),
        Query::can_set_cookie(CookieCategory::Unknown, true),
    ]
}

#[tokio::test]
async fn requests_submitted_while_starting_are_answered_in_order() {
    let launcher = FakeLauncher::new();
    launcher.hold_replies();
    let engine = fake_engine(&launcher);
    engine.start().await.unwrap();
    assert_eq!(engine.evaluator().state(), EvaluatorState::Starting);

    let queue = engine.resolver().queue();
    let queries = batch();
    let pending: Vec<_> = queries.iter().cloned().map(|q| queue.submit(q)).collect();
    assert_eq!(queue.depth(), queries.len());

    // Only the readiness probe reaches the evaluator while it is starting.
    launcher.wait_received(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.received_queries(), Vec::<String>::new());

    launcher.release_replies();
    let mut replies = Vec::new();
    for reply in pending {
        replies.push(tokio::time::timeout(WAIT, reply).await.unwrap().unwrap());
    }

    assert_eq!(
        replies,
        vec![
            Reply::Decision(Decision::Allowed),
            Reply::Requirement(true),
            Reply::Decision(Decision::Denied),
            Reply::Requirement(true),
            Reply::Decision(Decision::Allowed),
        ]
    );
    let sent: Vec<String> = queries.iter().map(Query::to_wire).collect();
    assert_eq!(launcher.received_queries(), sent);
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn requests_before_start_wait_for_ready() {
    let launcher = FakeLauncher::new();
    let engine = fake_engine(&launcher);
    let pending = engine
        .resolver()
        .queue()
        .submit(Query::can_set_cookie(CookieCategory::Performance, false));

    engine.start().await.unwrap();
    let reply = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(reply, Reply::Decision(Decision::Denied));
}

#[tokio::test]
async fn crash_while_starting_fails_every_queued_request() {
    let launcher = FakeLauncher::new();
    launcher.hold_replies();
    let engine = fake_engine(&launcher);
    let mut events = engine.evaluator().subscribe_events();
    engine.start().await.unwrap();
    launcher.wait_received(1).await;

    let queue = engine.resolver().queue();
    let pending: Vec<_> = batch().into_iter().map(|q| queue.submit(q)).collect();
    launcher.crash(3);

    for reply in pending {
        let err = tokio::time::timeout(WAIT, reply).await.unwrap().unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }
    assert_eq!(engine.evaluator().state(), EvaluatorState::Crashed);
    assert_eq!(queue.depth(), 0);
    assert_eq!(launcher.received_queries(), Vec::<String>::new());

    let crashed = tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if let EvaluatorEvent::Crashed { .. } = event {
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
            code: Some(3)
        }
    );
}

#[tokio::test]
async fn crash_while_ready_fails_the_in_flight_and_queued_requests() {
    let launcher = FakeLauncher::new();
    let engine = ready_engine(&launcher).await;
    launcher.hold_replies();

    let queue = engine.resolver().queue();
    let queries = batch();
    let pending: Vec<_> = queries.iter().cloned().map(|q| queue.submit(q)).collect();

    // Probe plus the first query; the rest stay queued behind it.
    launcher.wait_received(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.received_queries(), vec![queries[0].to_wire()]);

    launcher.crash(4);
    for reply in pending {
        let err = tokio::time::timeout(WAIT, reply).await.unwrap().unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }
    wait_for_state(engine.evaluator(), EvaluatorState::Crashed).await;
    assert_eq!(queue.depth(), 0);
    assert_eq!(launcher.received_queries(), vec![queries[0].to_wire()]);
}

#[tokio::test]
async fn submissions_after_a_crash_fail_immediately() {
    let launcher = FakeLauncher::new();
    let engine = ready_engine(&launcher).await;
    launcher.crash(1);
    wait_for_state(engine.evaluator(), EvaluatorState::Crashed).await;

    let err = tokio::time::timeout(
        WAIT,
        engine
            .resolver()
            .queue()
            .submit(Query::requires_consent(CookieCategory::Marketing)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, ConsentError::EvaluatorUnavailable { .. }), "{err}");
}

#[tokio::test]
async fn stop_fails_in_flight_and_queued_requests() {
    let launcher = FakeLauncher::new();
    let engine = ready_engine(&launcher).await;
    launcher.hold_replies();

    let queue = engine.resolver().queue();
    let pending: Vec<_> = batch().into_iter().take(3).map(|q| queue.submit(q)).collect();
    // Probe plus the first query, which is now in flight.
    launcher.wait_received(2).await;

    engine.stop().await.unwrap();
    for reply in pending {
        let err = tokio::time::timeout(WAIT, reply).await.unwrap().unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }
    assert_eq!(engine.evaluator().state(), EvaluatorState::Stopped);
    assert_eq!(launcher.received_queries().len(), 1);

    engine.stop().await.unwrap();
    assert_eq!(engine.evaluator().state(), EvaluatorState::Stopped);
}

#[tokio::test]
async fn abandoned_reply_is_still_delivered_in_order() {
    let launcher = FakeLauncher::new();
    let engine = ready_engine(&launcher).await;
    launcher.hold_replies();

    let queue = engine.resolver().queue();
    let first = Query::can_set_cookie(CookieCategory::Marketing, false);
    let second = Query::can_set_cookie(CookieCategory::Marketing, true);
    drop(queue.submit(first.clone()));
    let kept = queue.submit(second.clone());

    launcher.release_replies();
    let reply = tokio::time::timeout(WAIT, kept).await.unwrap().unwrap();
    assert_eq!(reply, Reply::Decision(Decision::Allowed));
    assert_eq!(
        launcher.received_queries(),
        vec![first.to_wire(), second.to_wire()]
    );
}
