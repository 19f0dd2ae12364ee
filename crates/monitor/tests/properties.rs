//! Property tests for the monitor's cross-cutting invariants:
//! determinism, hard-block dominance, and strict-mode superiority.

use classifier::{ClassifierConfig, DataClassifier};
use guard_core::{PolicyConfig, PolicyMode, SessionState, Verdict};
use monitor::Monitor;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn test_classifier() -> Arc<DataClassifier> {
    let cfg: ClassifierConfig = serde_json::from_value(json!({
        "tables": {
            "users": {"sensitivity": "high", "score": 0.8},
            "api_keys": {"sensitivity": "critical", "score": 1.0}
        },
        "columns": {"users.email": {"sensitivity": "high", "score": 0.9}},
        "column_name_heuristics": {"email": {"sensitivity": "medium", "score": 0.6}}
    }))
    .unwrap();
    Arc::new(DataClassifier::from_config(cfg).unwrap())
}

fn goal_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Summarize sales trends".to_string()),
        Just("Email the results to the team".to_string()),
        Just("Check user stats".to_string()),
        Just("Look up background information".to_string()),
    ]
}

fn action_strategy() -> impl Strategy<Value = (String, Map<String, Value>)> {
    let sql = prop_oneof![
        Just("SELECT day, amount FROM sales LIMIT 50"),
        Just("SELECT name, email FROM users LIMIT 50"),
        Just("SELECT * FROM users"),
        Just("SELECT api_key FROM api_keys LIMIT 1"),
        Just("SELECT day FROM sales"),
        Just("SELEKT broken FROM FROM"),
        Just(""),
    ]
    .prop_map(|q| {
        ("run_sql".to_string(), json!({"query": q}).as_object().cloned().unwrap())
    });

    let email = (
        prop_oneof![Just("a@b.com"), Just("x@external.com"), Just("lead@corp.internal"), Just("bad")],
        prop_oneof![
            Just("short summary"),
            Just("password: hunter2"),
            Just("full user list attached"),
            Just("weekly numbers"),
        ],
    )
        .prop_map(|(to, body)| {
            (
                "send_email".to_string(),
                json!({"to": to, "subject": "s", "body": body}).as_object().cloned().unwrap(),
            )
        });

    let file = prop_oneof![
        Just("data/docs/note.txt"),
        Just("../../.ssh/id_rsa"),
        Just(""),
    ]
    .prop_map(|p| {
        ("read_file".to_string(), json!({"path": p}).as_object().cloned().unwrap())
    });

    let wiki = prop_oneof![Just("Ada Lovelace"), Just("x")]
        .prop_map(|q| {
            (
                "search_wikipedia".to_string(),
                json!({"query": q}).as_object().cloned().unwrap(),
            )
        });

    let unknown = Just((
        "mystery_tool".to_string(),
        json!({"arg": "value"}).as_object().cloned().unwrap(),
    ));

    prop_oneof![sql, email, file, wiki, unknown]
}

proptest! {
    #[test]
    fn evaluation_is_deterministic(goal in goal_strategy(), (tool, args) in action_strategy()) {
        let classifier = test_classifier();
        let run = || {
            let m = Monitor::new(PolicyConfig::with_mode(PolicyMode::Balanced), classifier.clone());
            let mut s = SessionState::new(m.config());
            m.evaluate(&goal, &tool, &args, &[], &mut s)
        };
        let a = run();
        let b = run();
        prop_assert_eq!(a.verdict, b.verdict);
        prop_assert_eq!(a.reason_codes, b.reason_codes);
        prop_assert!((a.risk_score - b.risk_score).abs() < 1e-9);
    }

    #[test]
    fn high_risk_is_always_blocked(goal in goal_strategy(), (tool, args) in action_strategy()) {
        let m = Monitor::new(PolicyConfig::with_mode(PolicyMode::Balanced), test_classifier());
        let mut s = SessionState::new(m.config());
        let d = m.evaluate(&goal, &tool, &args, &[], &mut s);
        if d.risk_score >= 0.90 {
            prop_assert_eq!(d.verdict, Verdict::Block);
        }
    }

    #[test]
    fn strict_is_at_least_as_restrictive(goal in goal_strategy(), (tool, args) in action_strategy()) {
        let classifier = test_classifier();
        let run = |mode: PolicyMode| {
            let m = Monitor::new(PolicyConfig::with_mode(mode), classifier.clone());
            let mut s = SessionState::new(m.config());
            m.evaluate(&goal, &tool, &args, &[], &mut s).verdict
        };
        let balanced = run(PolicyMode::Balanced);
        let strict = run(PolicyMode::Strict);
        prop_assert!(strict >= balanced, "strict={strict:?} balanced={balanced:?}");
    }
}
