//! Enforcement-path integration tests with mock tools and approval
//! channels. Tools here are test doubles for the external collaborators;
//! the contract under test is the orchestrator's.

use async_trait::async_trait;
use classifier::{ClassifierConfig, DataClassifier};
use guard_core::{ApprovedBy, PolicyConfig, PolicyMode, Provenance, ReasonCode, Source, Verdict};
use monitor::Monitor;
use orchestrator::{
    ApprovalChannel, ApprovalMode, ApprovalRequest, Orchestrator, OrchestratorError, Tool,
    ToolOutcome,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_classifier() -> Arc<DataClassifier> {
    let cfg: ClassifierConfig = serde_json::from_value(json!({
        "tables": {"users": {"sensitivity": "high", "score": 0.8, "tags": ["pii"]}},
        "columns": {"users.email": {"sensitivity": "high", "score": 0.9}},
        "column_name_heuristics": {"email": {"sensitivity": "medium", "score": 0.6}}
    }))
    .unwrap();
    Arc::new(DataClassifier::from_config(cfg).unwrap())
}

fn monitor(mode: PolicyMode) -> Monitor {
    Monitor::new(PolicyConfig::with_mode(mode), test_classifier())
}

fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

/// Mock SQL executor: returns canned rows with db provenance and records
/// whether monitor-only fields leaked through.
struct MockSql {
    saw_monitor_fields: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for MockSql {
    async fn call(&self, call_args: Map<String, Value>) -> ToolOutcome {
        if call_args.contains_key("tainted") || call_args.contains_key("taint_sources") {
            self.saw_monitor_fields.store(true, Ordering::SeqCst);
        }
        let mut meta = Map::new();
        meta.insert("provenance".into(), Provenance::clean(Source::Db).to_value());
        ToolOutcome {
            ok: true,
            result: json!([{"email": "ada@example.org", "api_key": "sk-live-0123456789abcd"}]),
            error: None,
            meta,
        }
    }
}

struct MockEmail;

#[async_trait]
impl Tool for MockEmail {
    async fn call(&self, _args: Map<String, Value>) -> ToolOutcome {
        let mut meta = Map::new();
        meta.insert("provenance".into(), Provenance::clean(Source::Egress).to_value());
        ToolOutcome { ok: true, result: json!({"logged": true}), error: None, meta }
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    async fn call(&self, _args: Map<String, Value>) -> ToolOutcome {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let mut meta = Map::new();
        meta.insert("provenance".into(), Provenance::clean(Source::Db).to_value());
        ToolOutcome { ok: true, result: json!("late"), error: None, meta }
    }
}

struct FixedApproval(bool);

#[async_trait]
impl ApprovalChannel for FixedApproval {
    async fn request_approval(&self, _request: ApprovalRequest) -> bool {
        self.0
    }
}

fn sql_session(mode: PolicyMode, approval: ApprovalMode) -> Orchestrator {
    Orchestrator::new("Email the results", monitor(mode))
        .with_tool(
            "run_sql",
            Arc::new(MockSql { saw_monitor_fields: Arc::new(AtomicBool::new(false)) }),
        )
        .with_tool("send_email", Arc::new(MockEmail))
        .with_approval_mode(approval)
}

#[tokio::test]
async fn allow_executes_and_records() {
    let mut orch = Orchestrator::new("Summarize sales trends", monitor(PolicyMode::Balanced))
        .with_tool(
            "run_sql",
            Arc::new(MockSql { saw_monitor_fields: Arc::new(AtomicBool::new(false)) }),
        );
    orch.run(vec![(
        "run_sql".into(),
        args(json!({"query": "SELECT day, amount FROM sales LIMIT 50"})),
    )])
    .await
    .unwrap();

    let rec = &orch.history()[0];
    assert_eq!(rec.decision, Verdict::Allow);
    assert_eq!(rec.tool_ok, Some(true));
    assert!(rec.monitor_meta.contains_key("args_hash"));
}

#[tokio::test]
async fn block_terminates_and_refuses_further_actions() {
    let mut orch = Orchestrator::new("Check user stats", monitor(PolicyMode::Balanced))
        .with_tool(
            "run_sql",
            Arc::new(MockSql { saw_monitor_fields: Arc::new(AtomicBool::new(false)) }),
        );
    let err = orch
        .run(vec![
            ("run_sql".into(), args(json!({"query": "SELECT * FROM users"}))),
            ("run_sql".into(), args(json!({"query": "SELECT day FROM sales LIMIT 5"}))),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PolicyBlocked { step: 1, .. }));

    // Only the blocked step is recorded, with no execution.
    assert_eq!(orch.history().len(), 1);
    assert_eq!(orch.history()[0].tool_ok, None);
    assert!(orch.session().terminated);

    // Terminated sessions refuse everything and history stays unchanged.
    let err = orch
        .run(vec![("run_sql".into(), args(json!({"query": "SELECT 1"})))])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Terminated(_)));
    assert_eq!(orch.history().len(), 1);
}

#[tokio::test]
async fn auto_confirm_rewrites_ask_and_sets_classified_flag() {
    let mut orch = sql_session(PolicyMode::Balanced, ApprovalMode::AutoConfirm);
    orch.run(vec![(
        "run_sql".into(),
        args(json!({"query": "SELECT email FROM users LIMIT 10"})),
    )])
    .await
    .unwrap();

    let rec = &orch.history()[0];
    assert_eq!(rec.decision, Verdict::Allow);
    assert_eq!(rec.approved, Some(true));
    assert_eq!(rec.approved_by, Some(ApprovedBy::AutoConfirm));
    assert!(orch.session().classified_accessed);
    assert_eq!(orch.session().classified_sources.len(), 1);
    assert_eq!(orch.session().classified_sources[0].step, 1);

    // The follow-up egress is now the controlled action. Auto-confirm
    // approves the ASK, but the record carries the classified-egress code.
    orch.run(vec![(
        "send_email".into(),
        args(json!({"to": "x@external.com", "subject": "s", "body": "summary"})),
    )])
    .await
    .unwrap();
    let rec = orch.history().last().unwrap();
    assert!(rec.reason_codes.contains(&ReasonCode::EgressAfterClassifiedAsk));
}

#[tokio::test]
async fn non_interactive_ask_terminates_safely() {
    let mut orch = sql_session(PolicyMode::Balanced, ApprovalMode::NonInteractive);
    let err = orch
        .run(vec![(
            "run_sql".into(),
            args(json!({"query": "SELECT email FROM users LIMIT 10"})),
        )])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ApprovalUnavailable { step: 1 }));

    let rec = &orch.history()[0];
    assert_eq!(rec.decision, Verdict::Ask);
    assert_eq!(rec.approved, Some(false));
    assert_eq!(rec.approved_by, Some(ApprovedBy::NonInteractive));
    assert_eq!(rec.tool_ok, None);
    assert!(!orch.session().classified_accessed);
}

#[tokio::test]
async fn human_denial_becomes_block() {
    let mut orch = sql_session(PolicyMode::Balanced, ApprovalMode::Interactive)
        .with_approval(Arc::new(FixedApproval(false)));
    let err = orch
        .run(vec![(
            "run_sql".into(),
            args(json!({"query": "SELECT email FROM users LIMIT 10"})),
        )])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::HumanDenied { step: 1 }));

    let rec = &orch.history()[0];
    assert_eq!(rec.decision, Verdict::Block);
    assert_eq!(rec.approved, Some(false));
    assert_eq!(rec.approved_by, Some(ApprovedBy::Human));
    assert!(rec.reason_codes.contains(&ReasonCode::HumanDenied));
    assert!(!orch.session().classified_accessed);
}

#[tokio::test]
async fn human_approval_executes_and_rewrites_to_allow() {
    let mut orch = sql_session(PolicyMode::Balanced, ApprovalMode::Interactive)
        .with_approval(Arc::new(FixedApproval(true)));
    orch.run(vec![(
        "run_sql".into(),
        args(json!({"query": "SELECT email FROM users LIMIT 10"})),
    )])
    .await
    .unwrap();

    let rec = &orch.history()[0];
    assert_eq!(rec.decision, Verdict::Allow);
    assert_eq!(rec.approved_by, Some(ApprovedBy::Human));
    assert!(rec.reason.ends_with("(Approved by human)"));
    assert_eq!(rec.tool_ok, Some(true));
    assert!(orch.session().classified_accessed);
}

#[tokio::test]
async fn unknown_tool_blocks_before_execution() {
    let mut orch = Orchestrator::new("anything", monitor(PolicyMode::Balanced));
    let err = orch
        .run(vec![("delete_universe".into(), Map::new())])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PolicyBlocked { step: 1, .. }));
    let rec = &orch.history()[0];
    assert_eq!(rec.decision, Verdict::Block);
    assert!(rec.reason_codes.contains(&ReasonCode::UnknownTool));
}

#[tokio::test]
async fn monitor_only_fields_are_stripped() {
    let saw = Arc::new(AtomicBool::new(false));
    let mut orch = Orchestrator::new("Summarize sales trends", monitor(PolicyMode::Balanced))
        .with_tool("run_sql", Arc::new(MockSql { saw_monitor_fields: saw.clone() }));
    orch.run(vec![(
        "run_sql".into(),
        args(json!({
            "query": "SELECT day FROM sales LIMIT 5",
            "tainted": false,
            "taint_sources": []
        })),
    )])
    .await
    .unwrap();
    assert!(!saw.load(Ordering::SeqCst));
    // The original args, monitor fields included, stay in the record.
    assert!(orch.history()[0].args.contains_key("tainted"));
}

#[tokio::test]
async fn results_are_redacted_before_entering_history() {
    let mut orch = sql_session(PolicyMode::Balanced, ApprovalMode::AutoConfirm);
    orch.run(vec![(
        "run_sql".into(),
        args(json!({"query": "SELECT email FROM users LIMIT 10"})),
    )])
    .await
    .unwrap();

    let stored = serde_json::to_string(orch.history()[0].tool_result.as_ref().unwrap()).unwrap();
    assert!(!stored.contains("sk-live-0123456789abcd"));
    // Classified reason codes escalate to the strict profile, so the
    // address is scrubbed too.
    assert!(!stored.contains("ada@example.org"));
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_failure_and_keeps_flag_down() {
    let mut orch = Orchestrator::new("Summarize sales trends", monitor(PolicyMode::Balanced))
        .with_tool("run_sql", Arc::new(SlowTool))
        .with_approval_mode(ApprovalMode::AutoConfirm)
        .with_step_timeout(Duration::from_millis(100));
    orch.run(vec![(
        "run_sql".into(),
        args(json!({"query": "SELECT email FROM users LIMIT 10"})),
    )])
    .await
    .unwrap();

    let rec = &orch.history()[0];
    assert_eq!(rec.tool_ok, Some(false));
    assert_eq!(rec.tool_error.as_deref(), Some("tool execution timed out"));
    assert!(!orch.session().classified_accessed);
}

#[tokio::test]
async fn run_log_is_written_and_verifiable() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::new("Summarize sales trends", monitor(PolicyMode::Balanced))
        .with_tool(
            "run_sql",
            Arc::new(MockSql { saw_monitor_fields: Arc::new(AtomicBool::new(false)) }),
        )
        .with_run_log_dir(dir.path());
    orch.run(vec![(
        "run_sql".into(),
        args(json!({"query": "SELECT day, amount FROM sales LIMIT 50"})),
    )])
    .await
    .unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let path = entries[0].as_ref().unwrap().path();
    let doc = run_log::read_document(&path).unwrap();
    assert_eq!(doc.schema, run_log::SCHEMA_VERSION);
    assert_eq!(doc.goal, "Summarize sales trends");
    assert_eq!(doc.policy_mode, "balanced");
    assert_eq!(doc.summary.steps, 1);
    run_log::verify_chain(&doc).unwrap();
}
