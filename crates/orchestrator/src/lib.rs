//! Verdict enforcement state machine.
//!
//! The orchestrator owns the session: it validates each proposed action,
//! asks the monitor for a verdict, enforces it (ALLOW executes, ASK
//! suspends for approval, BLOCK terminates), strips monitor-only argument
//! fields before any tool sees them, redacts tool results before they
//! re-enter history, and flips the classified-access flag only after a
//! classified read actually executed. Blocked or denied reads must not
//! poison the session.

#![deny(unsafe_code)]

use async_trait::async_trait;
use guard_core::{
    ApprovedBy, ClassifiedSource, Decision, HistoryStep, ReasonCode, SessionState, StepRecord,
    Verdict,
};
use monitor::Monitor;
use redaction::Profile;
use run_log::RunLogWriter;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info_span, warn};

/// Argument fields the monitor consumes but tools must never see.
const MONITOR_ONLY_FIELDS: &[&str] = &["tainted", "taint_sources"];

/// Result of one tool execution. `meta` must carry a `provenance` entry.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Whether the tool succeeded.
    pub ok: bool,
    /// Tool result payload (redacted before it is stored).
    pub result: Value,
    /// Error description when `ok` is false.
    pub error: Option<String>,
    /// Tool metadata, provenance included.
    pub meta: Map<String, Value>,
}

/// An executable capability. Implementations live outside this crate;
/// the orchestrator only consumes the contract.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Execute with sanitized arguments.
    async fn call(&self, args: Map<String, Value>) -> ToolOutcome;
}

/// Everything a human needs to judge an ASK.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Step index being decided.
    pub step: usize,
    /// Session goal.
    pub goal: String,
    /// Proposed tool.
    pub tool: String,
    /// Proposed arguments.
    pub args: Map<String, Value>,
    /// Monitor risk score.
    pub risk_score: f64,
    /// Monitor reason text.
    pub reason: String,
}

/// Human-approval collaborator. A timeout inside the implementation
/// maps to denial.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Present the request and wait for a yes/no.
    async fn request_approval(&self, request: ApprovalRequest) -> bool;
}

/// How ASK verdicts are resolved for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Prompt the approval channel; denial terminates.
    Interactive,
    /// Never prompt; ASK terminates the session safely.
    NonInteractive,
    /// Treat ASK as approved (debugging and batch evaluation).
    AutoConfirm,
}

/// Terminal session errors. The monitor never raises; only enforcement does.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A rule fired a BLOCK verdict.
    #[error("policy blocked step {step}: {reason}")]
    PolicyBlocked {
        /// Step that was blocked.
        step: usize,
        /// Monitor reason text.
        reason: String,
    },
    /// A human denied an ASK.
    #[error("approval denied at step {step}")]
    HumanDenied {
        /// Step that was denied.
        step: usize,
    },
    /// ASK raised in a non-interactive session.
    #[error("approval required at step {step} but session is non-interactive")]
    ApprovalUnavailable {
        /// Step that required approval.
        step: usize,
    },
    /// The session already terminated; no further actions are accepted.
    #[error("session terminated: {0}")]
    Terminated(String),
    /// Run log persistence failed.
    #[error(transparent)]
    RunLog(#[from] run_log::RunLogError),
}

/// Session orchestrator. Exclusively owns the session state and history.
pub struct Orchestrator {
    goal: String,
    monitor: Monitor,
    tools: HashMap<String, Arc<dyn Tool>>,
    approval: Option<Arc<dyn ApprovalChannel>>,
    approval_mode: ApprovalMode,
    step_timeout: Option<Duration>,
    run_log_dir: Option<PathBuf>,
    session: SessionState,
    history: Vec<StepRecord>,
}

impl Orchestrator {
    /// New session for `goal`, enforced by `monitor`.
    #[must_use]
    pub fn new(goal: impl Into<String>, monitor: Monitor) -> Self {
        let session = SessionState::new(monitor.config());
        Self {
            goal: goal.into(),
            monitor,
            tools: HashMap::new(),
            approval: None,
            approval_mode: ApprovalMode::NonInteractive,
            step_timeout: None,
            run_log_dir: None,
            session,
            history: Vec::new(),
        }
    }

    /// Register an executable tool.
    #[must_use]
    pub fn with_tool(mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(name.into(), tool);
        self
    }

    /// Attach the human-approval collaborator and go interactive.
    #[must_use]
    pub fn with_approval(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval = Some(channel);
        self.approval_mode = ApprovalMode::Interactive;
        self
    }

    /// Override the approval mode.
    #[must_use]
    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    /// Bound each tool execution; a timeout counts as tool failure.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Persist a run document into `dir` when the run finishes.
    #[must_use]
    pub fn with_run_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_log_dir = Some(dir.into());
        self
    }

    /// Recorded history so far.
    #[must_use]
    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    /// Current session state.
    #[must_use]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Execute a proposed action sequence.
    ///
    /// Stops at the first terminal condition (BLOCK, denial, or ASK in a
    /// non-interactive session). The run log is written either way; the
    /// terminal error is returned after the log lands.
    pub async fn run(
        &mut self,
        actions: Vec<(String, Map<String, Value>)>,
    ) -> Result<(), OrchestratorError> {
        let result = self.run_inner(actions).await;
        if let Err(e) = self.write_log() {
            warn!(error = %e, "failed to persist run log");
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    async fn run_inner(
        &mut self,
        actions: Vec<(String, Map<String, Value>)>,
    ) -> Result<(), OrchestratorError> {
        for (tool, args) in actions {
            self.step(&tool, args).await?;
        }
        Ok(())
    }

    fn write_log(&self) -> Result<(), OrchestratorError> {
        if let Some(dir) = &self.run_log_dir {
            let writer = RunLogWriter::new(dir.clone());
            writer.write(
                &self.goal,
                self.monitor.config().policy_mode.as_str(),
                &self.session,
                &self.history,
            )?;
        }
        Ok(())
    }

    fn projected_history(&self) -> Vec<HistoryStep> {
        self.history.iter().map(HistoryStep::from).collect()
    }

    fn record_from_decision(
        &self,
        step: usize,
        tool: &str,
        args: Map<String, Value>,
        decision: &Decision,
    ) -> StepRecord {
        StepRecord {
            step,
            goal: self.goal.clone(),
            tool: tool.to_string(),
            args,
            decision: decision.verdict,
            reason: decision.reason.clone(),
            risk_score: decision.risk_score,
            reason_codes: decision.reason_codes.clone(),
            approved: None,
            approved_by: None,
            tool_ok: None,
            tool_result: None,
            tool_error: None,
            tool_meta: Map::new(),
            monitor_meta: decision.metadata.clone(),
        }
    }

    async fn step(
        &mut self,
        tool: &str,
        args: Map<String, Value>,
    ) -> Result<(), OrchestratorError> {
        if self.session.terminated {
            let reason = self
                .session
                .termination_reason
                .clone()
                .unwrap_or_else(|| "terminated".to_string());
            return Err(OrchestratorError::Terminated(reason));
        }

        let step = self.history.len() + 1;
        let _span = info_span!("guard.orchestrate.step", step = step, tool = tool).entered();

        // Tool validation comes before any policy work: an unregistered
        // name has nothing to execute and nothing to approve.
        if tool.is_empty() || !self.tools.contains_key(tool) {
            let reason = format!("Unknown or unregistered tool '{tool}'.");
            let decision =
                Decision::block(reason.clone(), 0.9, vec![ReasonCode::UnknownTool]);
            let record = self.record_from_decision(step, tool, args, &decision);
            self.history.push(record);
            self.session.terminate(format!("blocked: {reason}"));
            return Err(OrchestratorError::PolicyBlocked { step, reason });
        }

        let projected = self.projected_history();
        let decision =
            self.monitor.evaluate(&self.goal, tool, &args, &projected, &mut self.session);
        let mut record = self.record_from_decision(step, tool, args.clone(), &decision);

        match decision.verdict {
            Verdict::Block => {
                self.history.push(record);
                self.session.terminate(format!("blocked: {}", decision.reason));
                return Err(OrchestratorError::PolicyBlocked {
                    step,
                    reason: decision.reason,
                });
            }
            Verdict::Ask => match self.approval_mode {
                ApprovalMode::Interactive => {
                    let approved = match &self.approval {
                        Some(channel) => {
                            channel
                                .request_approval(ApprovalRequest {
                                    step,
                                    goal: self.goal.clone(),
                                    tool: tool.to_string(),
                                    args: args.clone(),
                                    risk_score: decision.risk_score,
                                    reason: decision.reason.clone(),
                                })
                                .await
                        }
                        None => false,
                    };
                    record.approved = Some(approved);
                    record.approved_by = Some(ApprovedBy::Human);
                    if approved {
                        record.decision = Verdict::Allow;
                        record.reason = format!("{} (Approved by human)", record.reason);
                    } else {
                        record.decision = Verdict::Block;
                        record.reason_codes.push(ReasonCode::HumanDenied);
                        self.history.push(record);
                        self.session.terminate("approval denied");
                        return Err(OrchestratorError::HumanDenied { step });
                    }
                }
                ApprovalMode::NonInteractive => {
                    record.approved = Some(false);
                    record.approved_by = Some(ApprovedBy::NonInteractive);
                    self.history.push(record);
                    self.session.terminate("approval required but unavailable");
                    return Err(OrchestratorError::ApprovalUnavailable { step });
                }
                ApprovalMode::AutoConfirm => {
                    record.approved = Some(true);
                    record.approved_by = Some(ApprovedBy::AutoConfirm);
                    record.decision = Verdict::Allow;
                }
            },
            Verdict::Allow => {}
        }

        // Execute. Monitor-only fields never reach the tool.
        let mut exec_args = args;
        for field in MONITOR_ONLY_FIELDS {
            exec_args.remove(*field);
        }
        let tool_impl = self.tools.get(tool).cloned().expect("validated above");
        let outcome = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, tool_impl.call(exec_args)).await {
                Ok(outcome) => outcome,
                Err(_) => ToolOutcome {
                    ok: false,
                    result: Value::Null,
                    error: Some("tool execution timed out".to_string()),
                    meta: Map::new(),
                },
            },
            None => tool_impl.call(exec_args).await,
        };

        let profile = Profile::for_mode(self.monitor.config().policy_mode)
            .escalated_for(&record.reason_codes);
        let (redacted, stats) = redaction::redact_value(&outcome.result, profile);
        record.tool_ok = Some(outcome.ok);
        record.tool_result = Some(redacted);
        record.tool_error = outcome.error;
        record.tool_meta = outcome.meta;
        record
            .monitor_meta
            .insert("redaction".to_string(), serde_json::to_value(stats)?);

        // Classified-access bookkeeping happens only after a successful
        // execution; a blocked, denied, or failed read leaves the session
        // untouched.
        if outcome.ok
            && tool == "run_sql"
            && record.monitor_meta.get("classified_hit").and_then(Value::as_bool)
                == Some(true)
        {
            let signals = record.monitor_meta.get("signals");
            let strings = |key: &str| -> Vec<String> {
                signals
                    .and_then(|s| s.get(key))
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|v| match v {
                                Value::String(s) => s.clone(),
                                // Column pairs serialize as [table, column];
                                // store them as "table.column" or bare.
                                Value::Array(pair) if pair.len() == 2 => {
                                    let t = pair[0].as_str().unwrap_or_default();
                                    let c = pair[1].as_str().unwrap_or_default();
                                    if t.is_empty() {
                                        c.to_string()
                                    } else {
                                        format!("{t}.{c}")
                                    }
                                }
                                other => other.to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let classified_keys = record
                .monitor_meta
                .get("classified_keys")
                .and_then(Value::as_array)
                .map(|items| {
                    items.iter().filter_map(|v| v.as_str().map(String::from)).collect()
                })
                .unwrap_or_default();
            self.session.mark_classified(ClassifiedSource {
                tool: tool.to_string(),
                tables: strings("tables"),
                columns: strings("columns"),
                classified_keys,
                step,
            });
        }

        self.history.push(record);
        Ok(())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::RunLog(run_log::RunLogError::Serde(e))
    }
}
