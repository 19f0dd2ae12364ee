//! Policy decision engine and monitor facade.
//!
//! The monitor mediates every tool invocation an agent proposes. Per-tool
//! handlers produce a base [`Decision`]; the facade then applies, in fixed
//! order: repetition escalation, audit metadata defaults, risk-budget
//! accounting, and the high-risk hard-block override. The monitor never
//! errors on the decision path — every condition resolves to a decision —
//! and it is deterministic for identical inputs.
//!
//! Observability and audit:
//! - Every decision increments a low-cardinality counter keyed
//!   `{tool, verdict}`.
//! - An optional [`DecisionObserver`] can be installed to observe
//!   decisions in-process.
//! - A process-global [`AuditSink`] captures audit records for later
//!   inspection in tests.

#![deny(unsafe_code)]

use classifier::DataClassifier;
use guard_core::{
    Decision, HistoryStep, PolicyConfig, Provenance, ReasonCode, SessionState, Source, Verdict,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::{debug, info_span};

mod email;
mod file;
pub mod intent;
mod sql;
pub mod taint;

/// Tools the monitor has dedicated handlers or priors for.
pub const KNOWN_TOOLS: &[&str] =
    &["run_sql", "send_email", "read_file", "search_docs", "search_wikipedia"];

/// History entries inspected for repetition escalation.
pub const REPETITION_WINDOW: usize = 6;
/// Prior BLOCKs within the window that force a block.
pub const REPETITION_BLOCK_COUNT: usize = 2;
/// Prior ASKs within the window that raise risk.
pub const REPETITION_ASK_COUNT: usize = 3;
/// Intent drift at or above which the default handler asks.
pub const DRIFT_ASK_THRESHOLD: f64 = 0.85;

/// Observer invoked for each decision emitted by the monitor.
///
/// Implementations must be cheap and non-blocking; no I/O on the decision
/// path. Intended for tests and in-process metrics.
pub trait DecisionObserver: Send + Sync {
    /// Called once per evaluation with the final decision.
    fn on_decision(&self, tool: &str, decision: &Decision);
}

static OBSERVER: OnceLock<RwLock<Option<Arc<dyn DecisionObserver>>>> = OnceLock::new();

/// Install or clear the global decision observer.
pub fn set_observer(observer: Option<Box<dyn DecisionObserver>>) {
    let cell = OBSERVER.get_or_init(|| RwLock::new(None));
    let mut w = cell.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    *w = observer.map(Arc::from);
}

/// In-process decision counters keyed `{tool, verdict}`.
#[derive(Default)]
pub struct DecisionMetrics {
    inner: Mutex<HashMap<String, u64>>,
}

impl DecisionMetrics {
    /// Current count for a `{tool, verdict}` pair.
    pub fn decision_counter(&self, tool: &str, verdict: Verdict) -> u64 {
        let key = format!("{tool}:{}", verdict.as_str());
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    fn inc(&self, tool: &str, verdict: Verdict) {
        let mut g = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *g.entry(format!("{tool}:{}", verdict.as_str())).or_insert(0) += 1;
    }
}

static METRICS: OnceLock<DecisionMetrics> = OnceLock::new();

/// Access the global decision metrics registry.
pub fn decision_metrics() -> &'static DecisionMetrics {
    METRICS.get_or_init(DecisionMetrics::default)
}

/// Audit record for a single decision.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRecord {
    /// Tool evaluated.
    pub tool: String,
    /// Final verdict.
    pub verdict: Verdict,
    /// Final risk score.
    pub risk_score: f64,
    /// Final reason codes.
    pub reason_codes: Vec<ReasonCode>,
    /// Stable hash of the canonical arguments.
    pub args_hash: String,
}

/// Handle for draining captured audit records. Cheap to clone; thread-safe.
#[derive(Clone, Default)]
pub struct AuditSink {
    inner: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditSink {
    /// Drain and return all captured records.
    pub fn drain(&self) -> Vec<AuditRecord> {
        let mut g = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *g)
    }
}

static AUDIT: OnceLock<AuditSink> = OnceLock::new();

/// Install (or retrieve) the process-global audit sink.
pub fn install_audit_sink() -> AuditSink {
    AUDIT.get_or_init(AuditSink::default).clone()
}

fn notify(tool: &str, decision: &Decision) {
    decision_metrics().inc(tool, decision.verdict);
    if let Some(lock) = OBSERVER.get() {
        if let Ok(r) = lock.read() {
            if let Some(obs) = r.as_ref() {
                obs.on_decision(tool, decision);
            }
        }
    }
    if let Some(sink) = AUDIT.get() {
        let mut g = sink.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        g.push(AuditRecord {
            tool: tool.to_string(),
            verdict: decision.verdict,
            risk_score: decision.risk_score,
            reason_codes: decision.reason_codes.clone(),
            args_hash: decision
                .metadata
                .get("args_hash")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
}

/// Rebuild a JSON value with object keys sorted, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical JSON text of an argument map (stable key order).
#[must_use]
pub fn canonical_args(args: &Map<String, Value>) -> String {
    canonicalize(&Value::Object(args.clone())).to_string()
}

/// Stable 16-hex-char hash of the canonical arguments.
#[must_use]
pub fn args_hash(args: &Map<String, Value>) -> String {
    let digest = Sha256::digest(canonical_args(args).as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// The monitor facade: per-tool policy handlers plus session-wide
/// augmentations. Stateless apart from the immutable config and the
/// shared read-only classifier; all mutable state is the caller's
/// [`SessionState`].
pub struct Monitor {
    config: PolicyConfig,
    classifier: Arc<DataClassifier>,
    budget: budget::Manager,
}

impl Monitor {
    /// Build a monitor for one session configuration.
    #[must_use]
    pub fn new(config: PolicyConfig, classifier: Arc<DataClassifier>) -> Self {
        let budget = budget::Manager::new(budget::BudgetConfig {
            initial: config.initial_risk_budget,
            ask_below: config.risk_budget_ask_threshold,
            block_below: config.risk_budget_block_threshold,
        });
        Self { config, classifier, budget }
    }

    /// The session configuration this monitor enforces.
    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// True when `tool` has a dedicated handler or prior.
    #[must_use]
    pub fn is_known_tool(tool: &str) -> bool {
        KNOWN_TOOLS.contains(&tool)
    }

    /// Evaluate a proposed tool call. Never errors; always returns a
    /// decision. Deducts from the session risk budget on ALLOW.
    pub fn evaluate(
        &self,
        goal: &str,
        tool: &str,
        args: &Map<String, Value>,
        history: &[HistoryStep],
        session: &mut SessionState,
    ) -> Decision {
        let _span = info_span!(
            "guard.policy.check",
            tool = tool,
            mode = self.config.policy_mode.as_str()
        )
        .entered();

        let tainted_input = args.get("tainted").and_then(Value::as_bool).unwrap_or(false)
            || taint::infer_from_history(history, self.config.taint_history_window);

        let base = match tool {
            "run_sql" => {
                sql::evaluate(&self.config, &self.classifier, goal, args, tainted_input)
            }
            "send_email" => email::evaluate(&self.config, goal, args, history, session),
            "read_file" => file::evaluate(&self.config, args),
            "search_wikipedia" => Self::evaluate_wiki(args),
            t if Self::is_known_tool(t) => Self::evaluate_default(goal, t, args),
            _ => Self::evaluate_unknown(tool),
        };

        let decision = self.augment(base, goal, tool, args, history, session);
        debug!(
            tool = tool,
            verdict = decision.verdict.as_str(),
            risk = decision.risk_score,
            "decision"
        );
        notify(tool, &decision);
        decision
    }

    fn evaluate_wiki(args: &Map<String, Value>) -> Decision {
        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        let significant = query.chars().filter(|c| !c.is_whitespace()).count();
        let mut d = if significant < 3 {
            Decision::ask(
                "Lookup query is too vague to assess.",
                0.4,
                vec![ReasonCode::WikiQueryVague],
            )
        } else {
            Decision::allow(
                "External lookup allowed; output is treated as tainted.",
                0.2,
                vec![ReasonCode::WikiAllowedTainted],
            )
        };
        let mut prov = Provenance::tainted(Source::Web);
        prov.extra.insert("channel".into(), json!("wikipedia"));
        d.insert_meta("provenance", prov.to_value());
        d
    }

    fn evaluate_unknown(tool: &str) -> Decision {
        let mut d = Decision::ask(
            format!("Unknown tool '{tool}'. Confirm before execution."),
            0.6,
            vec![ReasonCode::UnknownTool],
        );
        d.insert_meta("provenance", Provenance::tainted(Source::Unknown).to_value());
        d
    }

    fn evaluate_default(goal: &str, tool: &str, args: &Map<String, Value>) -> Decision {
        let similarity = intent::intent_similarity(goal, tool, args);
        let drift = 1.0 - similarity;
        let mut d = if drift >= DRIFT_ASK_THRESHOLD {
            Decision::ask(
                format!(
                    "Possible intent drift (similarity={similarity:.2}). Confirm this action matches the goal."
                ),
                (0.4 + drift * 0.4).min(1.0),
                vec![ReasonCode::IntentDriftAsk],
            )
        } else {
            Decision::allow(
                "Action is consistent with the declared goal.",
                0.1,
                vec![ReasonCode::DefaultAllow],
            )
        };
        d.insert_meta("provenance", Provenance::clean(Source::Internal).to_value());
        d.insert_meta("intent_similarity", json!(similarity));
        d
    }

    /// Facade augmentations, applied in fixed order: repetition
    /// escalation, audit defaults, risk budget, hard-block override.
    fn augment(
        &self,
        mut d: Decision,
        goal: &str,
        tool: &str,
        args: &Map<String, Value>,
        history: &[HistoryStep],
        session: &mut SessionState,
    ) -> Decision {
        // 1. Repetition escalation over the recent same-tool window.
        let mut prior_blocks = 0usize;
        let mut prior_asks = 0usize;
        for step in history.iter().rev().take(REPETITION_WINDOW) {
            if step.tool == tool {
                match step.decision {
                    Verdict::Block => prior_blocks += 1,
                    Verdict::Ask => prior_asks += 1,
                    Verdict::Allow => {}
                }
            }
        }
        if prior_blocks >= REPETITION_BLOCK_COUNT && d.verdict != Verdict::Allow {
            d.verdict = Verdict::Block;
            d.push_code(ReasonCode::RepeatedBlocks);
            d.raise_risk(0.95);
            d.reason = format!("{} Repeated blocked attempts for this tool.", d.reason);
        } else if prior_asks >= REPETITION_ASK_COUNT && d.verdict == Verdict::Ask {
            d.push_code(ReasonCode::RepeatedAsks);
            d.raise_risk(0.75);
        }

        // 2. Audit defaults.
        d.insert_meta("tool", json!(tool));
        d.insert_meta("args_hash", json!(args_hash(args)));
        d.insert_meta("args_preview", json!(preview(&canonical_args(args), 200)));
        d.insert_meta("goal_preview", json!(preview(goal, 120)));

        // 3. Risk budget: deduct on ALLOW only, then assess the balance.
        let _span =
            info_span!("guard.budget.check", tool = tool, risk = d.risk_score).entered();
        if d.verdict == Verdict::Allow {
            self.budget.charge(&mut session.risk_budget, d.risk_score);
        }
        let remaining = session.risk_budget;
        match self.budget.state(remaining) {
            budget::BudgetState::Exhausted => {
                d.verdict = Verdict::Block;
                d.push_code(ReasonCode::RiskBudgetExhausted);
                d.raise_risk(0.95);
                d.reason = format!("{} Session risk budget exhausted.", d.reason);
            }
            budget::BudgetState::LowEscalate if d.verdict == Verdict::Allow => {
                d.verdict = Verdict::Ask;
                d.push_code(ReasonCode::RiskBudgetLowEscalate);
                d.reason = format!("{} Session risk budget is low.", d.reason);
            }
            _ => {}
        }
        d.insert_meta("risk_budget", json!(remaining));

        // 4. High-risk hard-block override: the final safety net.
        if d.risk_score >= self.config.high_risk_block && d.verdict != Verdict::Block {
            d.verdict = Verdict::Block;
            d.push_code(ReasonCode::HighRiskHardBlock);
        }

        d
    }
}
