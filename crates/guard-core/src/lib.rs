//! Core primitives and shared types for the runtime agent guard.
//!
//! Everything that crosses a crate boundary lives here: the three-verdict
//! decision model, the stable reason-code vocabulary, provenance metadata,
//! per-session mutable state, policy configuration, and the step records
//! that make up a session history. The decision engine, orchestrator and
//! log writer all speak these types; none of them owns the vocabulary.

#![deny(unsafe_code)]

/// Version of the guard core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod verdict {
    //! The three-verdict decision model.

    use serde::{Deserialize, Serialize};

    /// Verdict emitted by the monitor for a proposed tool call.
    ///
    /// Ordered by restrictiveness: `Allow < Ask < Block`. The strict-mode
    /// superiority property is stated against this total order.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub enum Verdict {
        /// Execute the tool without intervention.
        #[serde(rename = "ALLOW")]
        Allow,
        /// Suspend and require human approval before execution.
        #[serde(rename = "ASK")]
        Ask,
        /// Refuse execution and terminate the session.
        #[serde(rename = "BLOCK")]
        Block,
    }

    impl Verdict {
        /// Stable wire name (`ALLOW` | `ASK` | `BLOCK`).
        #[must_use]
        pub fn as_str(self) -> &'static str {
            match self {
                Verdict::Allow => "ALLOW",
                Verdict::Ask => "ASK",
                Verdict::Block => "BLOCK",
            }
        }
    }

    impl std::fmt::Display for Verdict {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

}

pub mod reason {
    //! Stable reason-code vocabulary.
    //!
    //! Reason codes are the log schema's primary compatibility surface:
    //! adding or renaming a code is a breaking change to
    //! `runtime_agent_guard.v1`. The whole set is defined in this one
    //! module; nothing else mints codes.

    use serde::{Deserialize, Serialize};

    /// Machine-readable tag attached to a decision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    #[allow(missing_docs)]
    pub enum ReasonCode {
        // SQL decision table
        SqlClassifiedBlockStrict,
        SqlCriticalClassified,
        SqlClassifiedAsk,
        SqlMissingLimit,
        SqlParseUncertain,
        SqlLow,
        SqlMissingQuery,
        // Email decision table
        EmailInvalidRecipient,
        EmailContainsSecrets,
        EmailExfilPattern,
        EgressAfterClassifiedBlock,
        EgressAfterClassifiedAsk,
        EmailNotInGoal,
        EmailDomainNotAllowed,
        EmailAllowedAllowlist,
        EmailAllowedInternalSafe,
        EmailTaintedContent,
        EmailEgressConfirmDefault,
        // File access
        FileMissingPath,
        InvalidPath,
        FileOutsideAllowedDir,
        FileAllowed,
        // Untrusted external lookup
        WikiQueryVague,
        WikiAllowedTainted,
        // Facade
        UnknownTool,
        IntentDriftAsk,
        DefaultAllow,
        RepeatedBlocks,
        RepeatedAsks,
        RiskBudgetExhausted,
        RiskBudgetLowEscalate,
        HighRiskHardBlock,
        // Orchestrator
        HumanDenied,
    }

    impl ReasonCode {
        /// Stable wire name, e.g. `SQL_CLASSIFIED_ASK`.
        #[must_use]
        pub fn as_str(self) -> &'static str {
            match self {
                ReasonCode::SqlClassifiedBlockStrict => "SQL_CLASSIFIED_BLOCK_STRICT",
                ReasonCode::SqlCriticalClassified => "SQL_CRITICAL_CLASSIFIED",
                ReasonCode::SqlClassifiedAsk => "SQL_CLASSIFIED_ASK",
                ReasonCode::SqlMissingLimit => "SQL_MISSING_LIMIT",
                ReasonCode::SqlParseUncertain => "SQL_PARSE_UNCERTAIN",
                ReasonCode::SqlLow => "SQL_LOW",
                ReasonCode::SqlMissingQuery => "SQL_MISSING_QUERY",
                ReasonCode::EmailInvalidRecipient => "EMAIL_INVALID_RECIPIENT",
                ReasonCode::EmailContainsSecrets => "EMAIL_CONTAINS_SECRETS",
                ReasonCode::EmailExfilPattern => "EMAIL_EXFIL_PATTERN",
                ReasonCode::EgressAfterClassifiedBlock => "EGRESS_AFTER_CLASSIFIED_BLOCK",
                ReasonCode::EgressAfterClassifiedAsk => "EGRESS_AFTER_CLASSIFIED_ASK",
                ReasonCode::EmailNotInGoal => "EMAIL_NOT_IN_GOAL",
                ReasonCode::EmailDomainNotAllowed => "EMAIL_DOMAIN_NOT_ALLOWED",
                ReasonCode::EmailAllowedAllowlist => "EMAIL_ALLOWED_ALLOWLIST",
                ReasonCode::EmailAllowedInternalSafe => "EMAIL_ALLOWED_INTERNAL_SAFE",
                ReasonCode::EmailTaintedContent => "EMAIL_TAINTED_CONTENT",
                ReasonCode::EmailEgressConfirmDefault => "EMAIL_EGRESS_CONFIRM_DEFAULT",
                ReasonCode::FileMissingPath => "FILE_MISSING_PATH",
                ReasonCode::InvalidPath => "INVALID_PATH",
                ReasonCode::FileOutsideAllowedDir => "FILE_OUTSIDE_ALLOWED_DIR",
                ReasonCode::FileAllowed => "FILE_ALLOWED",
                ReasonCode::WikiQueryVague => "WIKI_QUERY_VAGUE",
                ReasonCode::WikiAllowedTainted => "WIKI_ALLOWED_TAINTED",
                ReasonCode::UnknownTool => "UNKNOWN_TOOL",
                ReasonCode::IntentDriftAsk => "INTENT_DRIFT_ASK",
                ReasonCode::DefaultAllow => "DEFAULT_ALLOW",
                ReasonCode::RepeatedBlocks => "REPEATED_BLOCKS",
                ReasonCode::RepeatedAsks => "REPEATED_ASKS",
                ReasonCode::RiskBudgetExhausted => "RISK_BUDGET_EXHAUSTED",
                ReasonCode::RiskBudgetLowEscalate => "RISK_BUDGET_LOW_ESCALATE",
                ReasonCode::HighRiskHardBlock => "HIGH_RISK_HARD_BLOCK",
                ReasonCode::HumanDenied => "HUMAN_DENIED",
            }
        }

        /// True for the codes that mark classified data access or
        /// classified egress. Redaction escalates on these.
        #[must_use]
        pub fn indicates_classified(self) -> bool {
            matches!(
                self,
                ReasonCode::SqlClassifiedBlockStrict
                    | ReasonCode::SqlClassifiedAsk
                    | ReasonCode::SqlCriticalClassified
                    | ReasonCode::EgressAfterClassifiedBlock
                    | ReasonCode::EgressAfterClassifiedAsk
            )
        }
    }

    impl std::fmt::Display for ReasonCode {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// True when any code in `codes` marks classified access.
    #[must_use]
    pub fn any_classified(codes: &[ReasonCode]) -> bool {
        codes.iter().any(|c| c.indicates_classified())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn serde_matches_as_str() {
            for code in [
                ReasonCode::SqlClassifiedAsk,
                ReasonCode::EgressAfterClassifiedBlock,
                ReasonCode::EmailEgressConfirmDefault,
                ReasonCode::FileOutsideAllowedDir,
                ReasonCode::HighRiskHardBlock,
            ] {
                let json = serde_json::to_string(&code).unwrap();
                assert_eq!(json, format!("\"{}\"", code.as_str()));
            }
        }

        #[test]
        fn classified_codes() {
            assert!(ReasonCode::SqlCriticalClassified.indicates_classified());
            assert!(ReasonCode::EgressAfterClassifiedAsk.indicates_classified());
            assert!(!ReasonCode::SqlMissingLimit.indicates_classified());
        }
    }
}

pub mod decision {
    //! Decision records produced by the policy engine.

    use crate::reason::ReasonCode;
    use crate::verdict::Verdict;
    use serde::Serialize;
    use serde_json::{Map, Value};

    /// Clamp a risk score into `[0, 1]`.
    #[must_use]
    pub fn clip01(x: f64) -> f64 {
        x.clamp(0.0, 1.0)
    }

    /// Immutable outcome of one monitor evaluation.
    ///
    /// Produced by the policy engine, augmented by the facade, consumed
    /// once by the orchestrator. `risk_score` is always clamped; the
    /// `reason_codes` list preserves the order rules fired in.
    #[derive(Debug, Clone, Serialize)]
    pub struct Decision {
        /// Enforcement verdict.
        pub verdict: Verdict,
        /// Human-readable explanation of the top rule.
        pub reason: String,
        /// Aggregate risk in `[0, 1]`.
        pub risk_score: f64,
        /// Stable machine-readable tags, order-preserving.
        pub reason_codes: Vec<ReasonCode>,
        /// Structured audit metadata (tool, args hash, provenance, signals).
        pub metadata: Map<String, Value>,
    }

    impl Decision {
        /// Build a decision with a clamped risk score.
        #[must_use]
        pub fn new(
            verdict: Verdict,
            reason: impl Into<String>,
            risk_score: f64,
            reason_codes: Vec<ReasonCode>,
        ) -> Self {
            Self {
                verdict,
                reason: reason.into(),
                risk_score: clip01(risk_score),
                reason_codes,
                metadata: Map::new(),
            }
        }

        /// ALLOW with the given reason, risk and codes.
        #[must_use]
        pub fn allow(reason: impl Into<String>, risk: f64, codes: Vec<ReasonCode>) -> Self {
            Self::new(Verdict::Allow, reason, risk, codes)
        }

        /// ASK with the given reason, risk and codes.
        #[must_use]
        pub fn ask(reason: impl Into<String>, risk: f64, codes: Vec<ReasonCode>) -> Self {
            Self::new(Verdict::Ask, reason, risk, codes)
        }

        /// BLOCK with the given reason, risk and codes.
        #[must_use]
        pub fn block(reason: impl Into<String>, risk: f64, codes: Vec<ReasonCode>) -> Self {
            Self::new(Verdict::Block, reason, risk, codes)
        }

        /// Attach one metadata entry.
        pub fn insert_meta(&mut self, key: &str, value: Value) {
            self.metadata.insert(key.to_string(), value);
        }

        /// Raise the risk score to at least `floor` (still clamped).
        pub fn raise_risk(&mut self, floor: f64) {
            self.risk_score = clip01(self.risk_score.max(floor));
        }

        /// Append a code unless already present.
        pub fn push_code(&mut self, code: ReasonCode) {
            if !self.reason_codes.contains(&code) {
                self.reason_codes.push(code);
            }
        }
    }

}

pub mod provenance {
    //! Origin metadata attached by tools and carried through history.

    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    /// Where a tool result came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Source {
        /// Local filesystem read.
        File,
        /// Database query.
        Db,
        /// External web lookup (always tainted).
        Web,
        /// Outbound egress channel.
        Egress,
        /// Internal computation.
        Internal,
        /// Unrecognized tool (always tainted).
        Unknown,
    }

    /// Structured origin record. Every tool meta carries one.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Provenance {
        /// Origin class.
        pub source: Source,
        /// True when the content derives from an untrusted source.
        pub tainted: bool,
        /// Tool-specific extras (`resolved_path`, `channel`, ...).
        #[serde(flatten)]
        pub extra: Map<String, Value>,
    }

    impl Provenance {
        /// Untainted provenance for `source`.
        #[must_use]
        pub fn clean(source: Source) -> Self {
            Self { source, tainted: false, extra: Map::new() }
        }

        /// Tainted provenance for `source`.
        #[must_use]
        pub fn tainted(source: Source) -> Self {
            Self { source, tainted: true, extra: Map::new() }
        }

        /// Serialize to a JSON value for embedding in metadata maps.
        #[must_use]
        pub fn to_value(&self) -> Value {
            serde_json::to_value(self).unwrap_or(Value::Null)
        }
    }

}

pub mod config {
    //! Per-session policy configuration. Immutable after session start.

    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    /// Risk score at or above which a decision is always BLOCK.
    pub const DEFAULT_HIGH_RISK_BLOCK: f64 = 0.90;
    /// Base-score threshold for ASK on SQL.
    pub const DEFAULT_ASK_THRESHOLD: f64 = 0.60;
    /// History window for taint inference.
    pub const DEFAULT_TAINT_HISTORY_WINDOW: usize = 8;
    /// Opening risk budget per session.
    pub const DEFAULT_RISK_BUDGET: f64 = 3.0;
    /// Remaining budget below which ALLOW escalates to ASK.
    pub const DEFAULT_BUDGET_ASK_BELOW: f64 = 0.2;
    /// Remaining budget below which the session is hard-blocked.
    pub const DEFAULT_BUDGET_BLOCK_BELOW: f64 = -0.5;

    /// Policy strictness profile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum PolicyMode {
        /// Classified reads ASK; classified egress ASK.
        Balanced,
        /// Classified reads BLOCK; classified egress BLOCK.
        Strict,
    }

    impl PolicyMode {
        /// Stable lowercase name.
        #[must_use]
        pub fn as_str(self) -> &'static str {
            match self {
                PolicyMode::Balanced => "balanced",
                PolicyMode::Strict => "strict",
            }
        }
    }

    impl std::fmt::Display for PolicyMode {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Session-wide policy knobs.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PolicyConfig {
        /// Strictness profile.
        pub policy_mode: PolicyMode,
        /// Hard-block risk threshold.
        pub high_risk_block: f64,
        /// ASK risk threshold for SQL.
        pub ask_threshold: f64,
        /// Recipient domains considered inside the trust boundary.
        pub internal_email_domains: Vec<String>,
        /// Optional explicit recipient-domain allowlist.
        pub email_domain_allowlist: Option<Vec<String>>,
        /// Steps of history scanned for taint.
        pub taint_history_window: usize,
        /// Base directory file reads must stay inside.
        pub allowed_docs_base: PathBuf,
        /// Opening risk budget.
        pub initial_risk_budget: f64,
        /// Remaining-budget threshold for ASK escalation.
        pub risk_budget_ask_threshold: f64,
        /// Remaining-budget threshold for forced BLOCK.
        pub risk_budget_block_threshold: f64,
    }

    impl PolicyConfig {
        /// Defaults for the given mode.
        #[must_use]
        pub fn with_mode(mode: PolicyMode) -> Self {
            Self {
                policy_mode: mode,
                high_risk_block: DEFAULT_HIGH_RISK_BLOCK,
                ask_threshold: DEFAULT_ASK_THRESHOLD,
                internal_email_domains: vec!["corp.internal".to_string()],
                email_domain_allowlist: None,
                taint_history_window: DEFAULT_TAINT_HISTORY_WINDOW,
                allowed_docs_base: PathBuf::from("data/docs"),
                initial_risk_budget: DEFAULT_RISK_BUDGET,
                risk_budget_ask_threshold: DEFAULT_BUDGET_ASK_BELOW,
                risk_budget_block_threshold: DEFAULT_BUDGET_BLOCK_BELOW,
            }
        }

        /// True when running in strict mode.
        #[must_use]
        pub fn is_strict(&self) -> bool {
            self.policy_mode == PolicyMode::Strict
        }
    }

    impl Default for PolicyConfig {
        fn default() -> Self {
            Self::with_mode(PolicyMode::Balanced)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_thresholds() {
            let cfg = PolicyConfig::default();
            assert_eq!(cfg.policy_mode, PolicyMode::Balanced);
            assert!((cfg.high_risk_block - 0.90).abs() < 1e-12);
            assert!((cfg.ask_threshold - 0.60).abs() < 1e-12);
            assert_eq!(cfg.taint_history_window, 8);
        }
    }
}

pub mod session {
    //! Mutable per-session state, owned exclusively by the orchestrator.

    use crate::config::PolicyConfig;
    use serde::{Deserialize, Serialize};

    /// One classified read recorded against the session.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ClassifiedSource {
        /// Tool that performed the read.
        pub tool: String,
        /// Tables referenced by the query.
        pub tables: Vec<String>,
        /// Columns referenced by the query (`table.column` or bare).
        pub columns: Vec<String>,
        /// Registry keys that classified.
        pub classified_keys: Vec<String>,
        /// 1-based step index of the read.
        pub step: usize,
    }

    /// Session-wide mutable state.
    ///
    /// `classified_accessed` is monotone: it transitions false→true at
    /// most once and is never reset. `terminated` is sticky.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionState {
        /// Remaining risk budget; ALLOW decisions deduct from it.
        pub risk_budget: f64,
        /// True once a classified read has successfully executed.
        pub classified_accessed: bool,
        /// Provenance of every classified read.
        pub classified_sources: Vec<ClassifiedSource>,
        /// True once the session refuses further actions.
        pub terminated: bool,
        /// Why the session terminated, when it did.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub termination_reason: Option<String>,
    }

    impl SessionState {
        /// Fresh state funded with the configured opening budget.
        #[must_use]
        pub fn new(cfg: &PolicyConfig) -> Self {
            Self {
                risk_budget: cfg.initial_risk_budget,
                classified_accessed: false,
                classified_sources: Vec::new(),
                terminated: false,
                termination_reason: None,
            }
        }

        /// Record a successful classified read. Monotone.
        pub fn mark_classified(&mut self, source: ClassifiedSource) {
            self.classified_accessed = true;
            self.classified_sources.push(source);
        }

        /// Mark the session terminated. The first reason wins.
        pub fn terminate(&mut self, reason: impl Into<String>) {
            if !self.terminated {
                self.terminated = true;
                self.termination_reason = Some(reason.into());
            }
        }
    }

    impl Default for SessionState {
        fn default() -> Self {
            Self::new(&PolicyConfig::default())
        }
    }

}

pub mod record {
    //! Step records and the monitor-consumable history projection.

    use crate::provenance::Provenance;
    use crate::reason::ReasonCode;
    use crate::verdict::Verdict;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    /// Who approved an ASK, when anyone did.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ApprovedBy {
        /// A human operator answered the prompt.
        Human,
        /// The session ran with auto-confirm enabled.
        AutoConfirm,
        /// Non-interactive session; ASK resolved to denial.
        NonInteractive,
    }

    /// One fully-resolved step of a session. Appended once; immutable after.
    ///
    /// Field order here is the serialized order in the run log. Do not
    /// reorder without bumping the log schema.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StepRecord {
        /// 1-based step index.
        pub step: usize,
        /// Session goal at evaluation time.
        pub goal: String,
        /// Tool name as proposed.
        pub tool: String,
        /// Proposed arguments (monitor-only fields included).
        pub args: Map<String, Value>,
        /// Final verdict after any approval rewrite.
        pub decision: Verdict,
        /// Human-readable reason.
        pub reason: String,
        /// Risk score in `[0, 1]`.
        pub risk_score: f64,
        /// Order-preserving reason codes.
        pub reason_codes: Vec<ReasonCode>,
        /// Whether an ASK was approved (absent when no ASK was raised).
        pub approved: Option<bool>,
        /// Approval channel, when an ASK was resolved.
        pub approved_by: Option<ApprovedBy>,
        /// Tool execution outcome; `None` when the tool never ran.
        pub tool_ok: Option<bool>,
        /// Redacted tool result.
        pub tool_result: Option<Value>,
        /// Tool error string, when execution failed.
        pub tool_error: Option<String>,
        /// Tool-attached metadata (provenance included).
        pub tool_meta: Map<String, Value>,
        /// Monitor audit metadata.
        pub monitor_meta: Map<String, Value>,
    }

    /// The slice of a step the monitor is allowed to see.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HistoryStep {
        /// Tool name.
        pub tool: String,
        /// Proposed arguments.
        pub args: Map<String, Value>,
        /// Verdict recorded for the step.
        pub decision: Verdict,
        /// Risk score recorded for the step.
        pub risk_score: f64,
        /// Reason codes recorded for the step.
        pub reason_codes: Vec<ReasonCode>,
        /// Monitor audit metadata (carries provenance).
        pub monitor_meta: Map<String, Value>,
        /// Tool-attached metadata (carries provenance).
        pub tool_meta: Map<String, Value>,
    }

    impl HistoryStep {
        /// Provenance recorded for this step, preferring the tool's own
        /// metadata over the monitor's copy.
        #[must_use]
        pub fn provenance(&self) -> Option<Provenance> {
            for meta in [&self.tool_meta, &self.monitor_meta] {
                if let Some(v) = meta.get("provenance") {
                    if let Ok(p) = serde_json::from_value::<Provenance>(v.clone()) {
                        return Some(p);
                    }
                }
            }
            None
        }

        /// True iff the step's provenance is tainted.
        #[must_use]
        pub fn tainted(&self) -> bool {
            self.provenance().is_some_and(|p| p.tainted)
        }
    }

    impl From<&StepRecord> for HistoryStep {
        fn from(r: &StepRecord) -> Self {
            Self {
                tool: r.tool.clone(),
                args: r.args.clone(),
                decision: r.decision,
                risk_score: r.risk_score,
                reason_codes: r.reason_codes.clone(),
                monitor_meta: r.monitor_meta.clone(),
                tool_meta: r.tool_meta.clone(),
            }
        }
    }

}

pub use config::{PolicyConfig, PolicyMode};
pub use decision::{clip01, Decision};
pub use provenance::{Provenance, Source};
pub use reason::ReasonCode;
pub use record::{ApprovedBy, HistoryStep, StepRecord};
pub use session::{ClassifiedSource, SessionState};
pub use verdict::Verdict;
