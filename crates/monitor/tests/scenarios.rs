//! End-to-end decision scenarios driven through the monitor, simulating
//! execution between steps the way the orchestrator does: the classified
//! flag flips only after a step actually executed.

use classifier::{ClassifierConfig, DataClassifier};
use guard_core::{
    HistoryStep, PolicyConfig, PolicyMode, ReasonCode, SessionState, Verdict,
};
use monitor::Monitor;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn test_classifier() -> Arc<DataClassifier> {
    let cfg: ClassifierConfig = serde_json::from_value(json!({
        "tables": {
            "users": {"sensitivity": "high", "score": 0.8, "tags": ["pii"]},
            "api_keys": {"sensitivity": "critical", "score": 1.0, "tags": ["secrets"]}
        },
        "columns": {
            "users.email": {"sensitivity": "high", "score": 0.9, "tags": ["pii"]},
            "api_keys.api_key": {"sensitivity": "critical", "score": 1.0, "tags": ["secrets"]}
        },
        "column_name_heuristics": {
            "email": {"sensitivity": "medium", "score": 0.6, "tags": ["pii"]},
            "password": {"sensitivity": "high", "score": 0.9, "tags": ["secrets"]}
        }
    }))
    .unwrap();
    Arc::new(DataClassifier::from_config(cfg).unwrap())
}

#[derive(Clone, Copy, PartialEq)]
enum Approval {
    StopOnAsk,
    AutoApprove,
}

/// Replay an action list through the monitor, simulating execution for
/// multi-step state. Returns the per-step verdicts and the final codes.
fn replay(
    mode: PolicyMode,
    approval: Approval,
    goal: &str,
    actions: &[(&str, Value)],
) -> (Vec<Verdict>, Vec<ReasonCode>) {
    let monitor = Monitor::new(PolicyConfig::with_mode(mode), test_classifier());
    let mut session = SessionState::new(monitor.config());
    let mut history: Vec<HistoryStep> = Vec::new();
    let mut verdicts = Vec::new();
    let mut final_codes = Vec::new();

    for (tool, args_value) in actions {
        let args: Map<String, Value> = args_value.as_object().cloned().unwrap_or_default();
        let d = monitor.evaluate(goal, tool, &args, &history, &mut session);
        verdicts.push(d.verdict);
        final_codes = d.reason_codes.clone();

        let executed = match d.verdict {
            Verdict::Allow => true,
            Verdict::Ask => approval == Approval::AutoApprove,
            Verdict::Block => false,
        };

        history.push(HistoryStep {
            tool: (*tool).to_string(),
            args,
            decision: d.verdict,
            risk_score: d.risk_score,
            reason_codes: d.reason_codes.clone(),
            monitor_meta: d.metadata.clone(),
            tool_meta: Map::new(),
        });

        if executed
            && *tool == "run_sql"
            && d.metadata.get("classified_hit") == Some(&json!(true))
        {
            session.classified_accessed = true;
        }

        match d.verdict {
            Verdict::Block => break,
            Verdict::Ask if approval == Approval::StopOnAsk => break,
            _ => {}
        }
    }

    (verdicts, final_codes)
}

#[test]
fn bounded_sales_query_allows() {
    let (verdicts, _) = replay(
        PolicyMode::Balanced,
        Approval::StopOnAsk,
        "Summarize sales trends",
        &[("run_sql", json!({"query": "SELECT day, amount FROM sales LIMIT 50"}))],
    );
    assert_eq!(verdicts, vec![Verdict::Allow]);
}

#[test]
fn classified_columns_ask() {
    let (verdicts, codes) = replay(
        PolicyMode::Balanced,
        Approval::StopOnAsk,
        "Summarize sales trends",
        &[("run_sql", json!({"query": "SELECT name, email FROM users LIMIT 50"}))],
    );
    assert_eq!(verdicts, vec![Verdict::Ask]);
    assert_eq!(codes, vec![ReasonCode::SqlClassifiedAsk]);
}

#[test]
fn traversal_read_blocks() {
    let (verdicts, codes) = replay(
        PolicyMode::Balanced,
        Approval::StopOnAsk,
        "Read a document",
        &[("read_file", json!({"path": "../../.ssh/id_rsa"}))],
    );
    assert_eq!(verdicts, vec![Verdict::Block]);
    assert!(codes.contains(&ReasonCode::FileOutsideAllowedDir));
}

#[test]
fn secret_bearing_email_blocks() {
    let (verdicts, codes) = replay(
        PolicyMode::Balanced,
        Approval::StopOnAsk,
        "Email the results",
        &[(
            "send_email",
            json!({"to": "a@b.com", "subject": "x", "body": "Here is the API key: sk-test-SECRET"}),
        )],
    );
    assert_eq!(verdicts, vec![Verdict::Block]);
    assert_eq!(codes, vec![ReasonCode::EmailContainsSecrets]);
}

#[test]
fn classified_read_then_egress_balanced_auto() {
    let (verdicts, codes) = replay(
        PolicyMode::Balanced,
        Approval::AutoApprove,
        "Email the results",
        &[
            ("run_sql", json!({"query": "SELECT email FROM users LIMIT 10"})),
            ("send_email", json!({"to": "x@external.com", "subject": "s", "body": "summary"})),
        ],
    );
    assert_eq!(verdicts, vec![Verdict::Ask, Verdict::Ask]);
    assert_eq!(codes, vec![ReasonCode::EgressAfterClassifiedAsk]);
}

#[test]
fn classified_read_then_egress_strict_blocks_at_the_read() {
    let (verdicts, codes) = replay(
        PolicyMode::Strict,
        Approval::AutoApprove,
        "Email the results",
        &[
            ("run_sql", json!({"query": "SELECT email FROM users LIMIT 10"})),
            ("send_email", json!({"to": "x@external.com", "subject": "s", "body": "summary"})),
        ],
    );
    assert_eq!(verdicts[0], Verdict::Block);
    assert_eq!(codes, vec![ReasonCode::SqlClassifiedBlockStrict]);
}

#[test]
fn strict_egress_blocks_when_classified_flag_already_set() {
    // Session where the classified read happened under an earlier approval.
    let monitor = Monitor::new(PolicyConfig::with_mode(PolicyMode::Strict), test_classifier());
    let mut session = SessionState::new(monitor.config());
    session.classified_accessed = true;
    let args: Map<String, Value> =
        json!({"to": "x@external.com", "subject": "s", "body": "summary"})
            .as_object()
            .cloned()
            .unwrap();
    let d = monitor.evaluate("Email the results", "send_email", &args, &[], &mut session);
    assert_eq!(d.verdict, Verdict::Block);
    assert_eq!(d.reason_codes, vec![ReasonCode::EgressAfterClassifiedBlock]);
}

#[test]
fn unknown_tool_asks() {
    let (verdicts, codes) = replay(
        PolicyMode::Balanced,
        Approval::StopOnAsk,
        "Do the thing",
        &[("delete_universe", json!({}))],
    );
    assert_eq!(verdicts, vec![Verdict::Ask]);
    assert_eq!(codes, vec![ReasonCode::UnknownTool]);
}

#[test]
fn blocked_classified_read_does_not_poison_session() {
    // Under STOP_ON_ASK the classified read never executes, so a later
    // (separately approved) clean email is not marked as classified egress.
    let monitor = Monitor::new(PolicyConfig::with_mode(PolicyMode::Balanced), test_classifier());
    let mut session = SessionState::new(monitor.config());
    let mut history: Vec<HistoryStep> = Vec::new();

    let sql_args: Map<String, Value> =
        json!({"query": "SELECT email FROM users LIMIT 10"}).as_object().cloned().unwrap();
    let d = monitor.evaluate("Email the results", "run_sql", &sql_args, &history, &mut session);
    assert_eq!(d.verdict, Verdict::Ask);
    // Not approved: no execution, flag stays down.
    history.push(HistoryStep {
        tool: "run_sql".into(),
        args: sql_args,
        decision: d.verdict,
        risk_score: d.risk_score,
        reason_codes: d.reason_codes.clone(),
        monitor_meta: d.metadata.clone(),
        tool_meta: Map::new(),
    });
    assert!(!session.classified_accessed);

    let email_args: Map<String, Value> =
        json!({"to": "a@b.com", "subject": "s", "body": "summary"}).as_object().cloned().unwrap();
    let d = monitor.evaluate("Email the results", "send_email", &email_args, &history, &mut session);
    assert_ne!(d.reason_codes, vec![ReasonCode::EgressAfterClassifiedAsk]);
}

#[test]
fn taint_marker_suppresses_internal_shortcut() {
    let monitor = Monitor::new(PolicyConfig::with_mode(PolicyMode::Balanced), test_classifier());
    let mut session = SessionState::new(monitor.config());

    // Tainted wiki lookup enters history with its provenance.
    let wiki_args: Map<String, Value> =
        json!({"query": "quantum computing"}).as_object().cloned().unwrap();
    let d = monitor.evaluate(
        "Research quantum computing and email notes to the team",
        "search_wikipedia",
        &wiki_args,
        &[],
        &mut session,
    );
    assert_eq!(d.verdict, Verdict::Allow);
    let history = vec![HistoryStep {
        tool: "search_wikipedia".into(),
        args: wiki_args,
        decision: d.verdict,
        risk_score: d.risk_score,
        reason_codes: d.reason_codes.clone(),
        monitor_meta: d.metadata.clone(),
        tool_meta: Map::new(),
    }];

    // Internal recipient, but the body quotes the tainted query: ASK.
    let referencing: Map<String, Value> = json!({
        "to": "team@corp.internal",
        "subject": "notes",
        "body": "Summary of quantum computing findings"
    })
    .as_object()
    .cloned()
    .unwrap();
    let d = monitor.evaluate(
        "Research quantum computing and email notes to the team",
        "send_email",
        &referencing,
        &history,
        &mut session,
    );
    assert_eq!(d.verdict, Verdict::Ask);
    assert_eq!(d.reason_codes, vec![ReasonCode::EmailTaintedContent]);

    // Same recipient, content that does not reference the marker: ALLOW.
    let clean: Map<String, Value> = json!({
        "to": "team@corp.internal",
        "subject": "status",
        "body": "Weekly status attached"
    })
    .as_object()
    .cloned()
    .unwrap();
    let d = monitor.evaluate(
        "Research topics and email notes to the team",
        "send_email",
        &clean,
        &history,
        &mut session,
    );
    assert_eq!(d.verdict, Verdict::Allow);
    assert_eq!(d.reason_codes, vec![ReasonCode::EmailAllowedInternalSafe]);
}
