//! Escalation routing through a running tree.

mod common;

use std::time::Duration;

use serde_json::json;
use tasktree::escalation::{accept_default, always, confidence_floor, unresolved, HopAction};
use tasktree::{
    Choice, EscalationPolicy, EscalationReason, LogLevel, NodeId, OutcomeKind, Request, Status,
};

use common::{id, messages_containing, orchestrator, run_once, Behavior, TestFactory};

#[tokio::test]
async fn test_escalation_climbs_to_root_and_retries() {
    let factory = TestFactory::new()
        .leaf(
            &[0, 1, 0],
            Behavior::Improves {
                low: 0.3,
                high: 0.9,
                units: 4,
            },
        )
        .root_policy(EscalationPolicy::decide_all(always(Choice::RetryWithHigherCost)));
    let outcome = run_once(vec![2, 2, 2], &factory).await;

    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.final_status, Status::Healthy);

    assert_eq!(outcome.escalation_audit.len(), 1);
    let audit = &outcome.escalation_audit[0];
    assert_eq!(audit.origin, id(&[0, 1, 0]));
    assert_eq!(audit.reason, EscalationReason::LowConfidence);
    assert_eq!(audit.decided_by, Some(NodeId::root()));
    assert_eq!(audit.chosen, Choice::RetryWithHigherCost);
    let hops: Vec<_> = audit.hops.iter().map(|h| (h.node.clone(), h.action)).collect();
    assert_eq!(
        hops,
        vec![
            (id(&[0, 1]), HopAction::Forwarded),
            (id(&[0]), HopAction::Forwarded),
            (NodeId::root(), HopAction::Decided),
        ]
    );

    // the branch aggregates the retried result, not the original guess
    let calls = factory.calls_to(&[0, 1, 0]);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].quality_boost, 1.0);
    assert_eq!(calls[1].quality_boost, 2.0);
    let value = outcome.final_value.clone().unwrap();
    assert_eq!(value[0][1][0]["score"], json!(0.9));
    assert_eq!(value[0][1][0]["boost"], json!(2.0));

    // both attempts are paid for: 7 * 5 + 2 * 4
    assert_eq!(outcome.total_cost.units_consumed, 43);

    assert_eq!(messages_containing(&outcome, "forwarded escalation").len(), 2);
    assert_eq!(messages_containing(&outcome, "decided escalation").len(), 1);
    assert!(outcome
        .aggregated_logs
        .iter()
        .filter(|e| e.message.contains("escalation"))
        .all(|e| e.level == LogLevel::Warn));
}

#[tokio::test]
async fn test_unsure_retry_is_accepted() {
    let factory = TestFactory::new()
        .leaf(&[1], Behavior::unsure(0.2, 3))
        .root_policy(EscalationPolicy::decide_all(always(Choice::RetryWithHigherCost)));
    let outcome = run_once(vec![2], &factory).await;

    assert_eq!(outcome.final_status, Status::Healthy);
    assert_eq!(factory.calls_to(&[1]).len(), 2);
    assert_eq!(
        messages_containing(&outcome, "retry still below threshold").len(),
        1
    );
    let audit = &outcome.escalation_audit[0];
    assert_eq!(audit.forwards(), 0);
    assert_eq!(audit.hops.len(), 1);
}

#[tokio::test]
async fn test_flag_for_review_degrades_branch() {
    let factory = TestFactory::new()
        .leaf(&[1, 0], Behavior::unsure(0.4, 5))
        .root_policy(EscalationPolicy::decide_all(always(Choice::FlagForReview)));
    let outcome = run_once(vec![2, 2], &factory).await;

    assert_eq!(outcome.final_status, Status::degraded("child degraded: n1"));
    assert_eq!(factory.calls_to(&[1, 0]).len(), 1);
    // flagged values are kept
    let value = outcome.final_value.unwrap();
    assert_eq!(value[1][0]["score"], json!(0.4));
}

#[tokio::test]
async fn test_local_decision_stops_the_climb() {
    let factory = TestFactory::new()
        .leaf(&[0, 1, 1], Behavior::unsure(0.5, 5))
        .inner_policy(
            &[0, 1],
            EscalationPolicy::local_reasons(vec![EscalationReason::LowConfidence], accept_default()),
        )
        // reaching the root would be a policy gap
        .root_policy(EscalationPolicy::decide_all(unresolved()));
    let outcome = run_once(vec![2, 2, 2], &factory).await;

    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.final_status, Status::Healthy);
    let audit = &outcome.escalation_audit[0];
    assert_eq!(audit.decided_by, Some(id(&[0, 1])));
    assert_eq!(audit.forwards(), 0);
    assert_eq!(audit.chosen, Choice::AcceptDefault);
}

#[tokio::test]
async fn test_confidence_floor_at_root() {
    let factory = TestFactory::new()
        .leaf(&[0], Behavior::unsure(0.3, 5))
        .leaf(&[1], Behavior::unsure(0.6, 5))
        .root_policy(EscalationPolicy::decide_all(confidence_floor(0.5)));
    let outcome = run_once(vec![2], &factory).await;

    assert_eq!(outcome.final_status, Status::degraded("child degraded: n0"));
    let chosen: Vec<_> = outcome
        .escalation_audit
        .iter()
        .map(|a| (a.origin.clone(), a.chosen))
        .collect();
    assert_eq!(
        chosen,
        vec![
            (id(&[0]), Choice::FlagForReview),
            (id(&[1]), Choice::AcceptDefault),
        ]
    );
}

#[tokio::test]
async fn test_root_without_rule_is_fatal() {
    let factory = TestFactory::new()
        .leaf(&[1, 0], Behavior::unsure(0.1, 5))
        .root_policy(EscalationPolicy::decide_all(unresolved()));
    let outcome = run_once(vec![2, 2], &factory).await;

    assert_eq!(outcome.kind, OutcomeKind::PolicyGap);
    assert!(outcome.is_fatal());
    assert!(outcome.final_value.is_none());
    match &outcome.final_status {
        Status::Failed(reason) => assert!(reason.starts_with("policy gap: ")),
        other => panic!("expected failure, got {:?}", other),
    }
    let last = outcome.aggregated_logs.last().unwrap();
    assert_eq!(last.level, LogLevel::Error);
}

#[tokio::test]
async fn test_escalation_terminates_within_depth() {
    for depth in 1..=5usize {
        let factory = TestFactory::new().default_leaf(Behavior::unsure(0.1, 1));
        let outcome = run_once(vec![1; depth], &factory).await;

        assert_eq!(outcome.escalation_audit.len(), 1);
        let audit = &outcome.escalation_audit[0];
        assert_eq!(audit.decided_by, Some(NodeId::root()));
        assert_eq!(audit.hops.len(), depth);
        assert!(audit.forwards() < depth);
    }
}

#[tokio::test(start_paused = true)]
async fn test_hung_retry_keeps_sibling_and_audit() {
    let factory = TestFactory::new()
        .leaf(
            &[0, 0],
            Behavior::HangsWhenBoosted {
                confidence: 0.1,
                units: 3,
            },
        )
        .root_policy(EscalationPolicy::decide_all(always(Choice::RetryWithHigherCost)));
    let outcome = orchestrator(vec![2, 2], &factory)
        .run(Request::single(json!(null), Duration::from_secs(1), 10_000))
        .await;

    assert_eq!(outcome.kind, OutcomeKind::Completed);
    // n0 itself finished in time; only its retried leaf failed
    assert_eq!(outcome.final_status, Status::degraded("child degraded: n0"));
    assert!(
        messages_containing(&outcome, "did not finish before the deadline; cancelled").is_empty()
    );
    assert_eq!(
        messages_containing(&outcome, "retry did not finish before the deadline").len(),
        1
    );

    let value = outcome.final_value.unwrap();
    let n0 = value[0].as_array().unwrap();
    assert_eq!(n0.len(), 1);
    assert_eq!(n0[0]["leaf"], json!("n0.1"));
    assert_eq!(value[1].as_array().unwrap().len(), 2);

    assert_eq!(factory.calls_to(&[0, 0]).len(), 2);
    assert_eq!(outcome.escalation_audit.len(), 1);
    let audit = &outcome.escalation_audit[0];
    assert_eq!(audit.origin, id(&[0, 0]));
    assert_eq!(audit.decided_by, Some(NodeId::root()));
    assert_eq!(audit.chosen, Choice::RetryWithHigherCost);
    assert!(!audit.cancelled_by_timeout);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_pending_at_deadline_takes_default() {
    // the first retry uses up n0's decision window
    let factory = TestFactory::new()
        .leaf(
            &[0, 0],
            Behavior::HangsWhenBoosted {
                confidence: 0.1,
                units: 3,
            },
        )
        .leaf(&[0, 1], Behavior::unsure(0.2, 5))
        .root_policy(EscalationPolicy::decide_all(always(Choice::RetryWithHigherCost)));
    let outcome = orchestrator(vec![2, 2], &factory)
        .run(Request::single(json!(null), Duration::from_secs(1), 10_000))
        .await;

    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.escalation_audit.len(), 2);
    assert_eq!(outcome.escalation_audit[0].chosen, Choice::RetryWithHigherCost);

    let cancelled = &outcome.escalation_audit[1];
    assert_eq!(cancelled.origin, id(&[0, 1]));
    assert!(cancelled.cancelled_by_timeout);
    assert_eq!(cancelled.decided_by, None);
    assert_eq!(cancelled.chosen, Choice::AcceptDefault);
    assert_eq!(
        messages_containing(
            &outcome,
            "escalation from n0.1 cancelled by timeout; using default accept_default"
        )
        .len(),
        1
    );

    // the default keeps the leaf's own result, without a retry
    assert_eq!(factory.calls_to(&[0, 1]).len(), 1);
    let value = outcome.final_value.unwrap();
    assert_eq!(value[0][0]["leaf"], json!("n0.1"));
    assert_eq!(value[0][0]["score"], json!(0.2));
}

#[tokio::test]
async fn test_collaborator_reason_is_routed_by_reason() {
    let factory = TestFactory::new()
        .leaf(&[0, 1], Behavior::Conflicting { units: 2 })
        .leaf(&[1, 0], Behavior::unsure(0.3, 5))
        .inner_policy(
            &[0],
            EscalationPolicy::local_reasons(
                vec![EscalationReason::ConflictingResults],
                always(Choice::FlagForReview),
            ),
        )
        .inner_policy(
            &[1],
            EscalationPolicy::local_reasons(
                vec![EscalationReason::ConflictingResults],
                always(Choice::FlagForReview),
            ),
        );
    let outcome = run_once(vec![2, 2], &factory).await;

    assert_eq!(outcome.final_status, Status::degraded("child degraded: n0"));
    let routed: Vec<_> = outcome
        .escalation_audit
        .iter()
        .map(|a| (a.origin.clone(), a.reason.clone(), a.decided_by.clone(), a.chosen))
        .collect();
    assert_eq!(
        routed,
        vec![
            (
                id(&[0, 1]),
                EscalationReason::ConflictingResults,
                Some(id(&[0])),
                Choice::FlagForReview,
            ),
            (
                id(&[1, 0]),
                EscalationReason::LowConfidence,
                Some(NodeId::root()),
                Choice::AcceptDefault,
            ),
        ]
    );
}
