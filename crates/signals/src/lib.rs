//! Risk signal aggregation.
//!
//! [`RiskSignals`] collects everything one evaluation learned about a
//! proposed call — extracted entities, classifier hits, shape flags, taint —
//! and folds it into a single deterministic `base_score` with an ordered
//! reason list. The weighting is a documented constant table, not learned.

#![deny(unsafe_code)]

use classifier::{ClassificationHit, DataClassifier};
use serde::Serialize;

pub mod sql;

pub use sql::{extract_sql_entities, SqlEntities};

/// Weight of any sensitivity hit.
pub const W_SENSITIVITY: f64 = 0.70;
/// Weight of the bulk-extraction indicator.
pub const W_BULK: f64 = 0.35;
/// Weight of a missing LIMIT clause.
pub const W_NO_LIMIT: f64 = 0.30;
/// Weight of tainted input.
pub const W_TAINT: f64 = 0.45;
/// Weight applied to the tool prior.
pub const W_TOOL_PRIOR: f64 = 0.20;
/// Weight applied to the operation prior.
pub const W_OP_PRIOR: f64 = 0.15;

/// Prior for tools with no entry in the table below.
pub const UNKNOWN_TOOL_PRIOR: f64 = 0.15;

/// Static per-tool risk priors.
pub const TOOL_PRIORS: &[(&str, f64)] = &[
    ("send_email", 0.40),
    ("run_sql", 0.25),
    ("read_file", 0.10),
    ("search_docs", 0.05),
    ("search_wikipedia", 0.05),
];

/// Prior risk for a tool name.
#[must_use]
pub fn tool_prior(tool: &str) -> f64 {
    TOOL_PRIORS
        .iter()
        .find(|(name, _)| *name == tool)
        .map_or(UNKNOWN_TOOL_PRIOR, |(_, p)| *p)
}

/// Coarse operation class of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Local read (files, docs).
    Read,
    /// Database query.
    Query,
    /// Outbound egress.
    Send,
    /// Search over local or external corpora.
    Search,
    /// Unrecognized tool.
    Unknown,
}

impl Operation {
    /// Prior risk of the operation class.
    #[must_use]
    pub fn prior(self) -> f64 {
        match self {
            Operation::Send => 0.30,
            Operation::Query => 0.15,
            Operation::Read | Operation::Search => 0.05,
            Operation::Unknown => 0.10,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Query => "query",
            Operation::Send => "send",
            Operation::Search => "search",
            Operation::Unknown => "unknown",
        }
    }

    /// Operation class for a known tool name.
    #[must_use]
    pub fn for_tool(tool: &str) -> Self {
        match tool {
            "run_sql" => Operation::Query,
            "send_email" => Operation::Send,
            "read_file" => Operation::Read,
            "search_docs" | "search_wikipedia" => Operation::Search,
            _ => Operation::Unknown,
        }
    }
}

fn clip01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// Everything one evaluation learned about a proposed call.
///
/// Built per evaluation, finalized once, then discarded. `base_score` and
/// `reasons` are deterministic functions of the other fields.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSignals {
    /// Tool under evaluation.
    pub tool_name: String,
    /// Operation class.
    pub operation: Operation,
    /// Declared session goal.
    pub goal: String,
    /// Referenced tables.
    pub tables: Vec<String>,
    /// Referenced `(table_or_empty, column)` pairs.
    pub columns: Vec<(String, String)>,
    /// Classifier hits for the referenced entities.
    pub sensitivity_hits: Vec<ClassificationHit>,
    /// Bulk-extraction shape detected.
    pub bulk_indicator: bool,
    /// `SELECT` without `LIMIT`.
    pub missing_limit: bool,
    /// Input carries taint.
    pub tainted_input: bool,
    /// Aggregate score; valid after [`RiskSignals::finalize`].
    pub base_score: f64,
    /// Ordered textual reasons; valid after [`RiskSignals::finalize`].
    pub reasons: Vec<String>,
}

impl RiskSignals {
    /// Empty signals for a tool/operation/goal triple.
    #[must_use]
    pub fn new(tool_name: impl Into<String>, operation: Operation, goal: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            operation,
            goal: goal.into(),
            tables: Vec::new(),
            columns: Vec::new(),
            sensitivity_hits: Vec::new(),
            bulk_indicator: false,
            missing_limit: false,
            tainted_input: false,
            base_score: 0.0,
            reasons: Vec::new(),
        }
    }

    /// True when any hit counts as classified.
    #[must_use]
    pub fn any_classified(&self) -> bool {
        self.sensitivity_hits.iter().any(ClassificationHit::is_classified)
    }

    /// Canonical keys of the classified hits, in hit order.
    #[must_use]
    pub fn classified_keys(&self) -> Vec<String> {
        self.sensitivity_hits
            .iter()
            .filter(|h| h.is_classified())
            .map(|h| h.key.clone())
            .collect()
    }

    /// Fold the collected signals into `base_score` and `reasons`.
    ///
    /// The reason order is part of the contract: sensitivity, bulk,
    /// missing LIMIT, taint, tool prior, operation prior. Downstream
    /// consumers render the first entry as the top reason.
    pub fn finalize(&mut self) {
        let x_sens = flag(!self.sensitivity_hits.is_empty());
        let x_bulk = flag(self.bulk_indicator);
        let x_nolimit = flag(self.missing_limit);
        let x_taint = flag(self.tainted_input);

        let t_prior = tool_prior(&self.tool_name);
        let op_prior = self.operation.prior();

        let severe = clip01(
            W_SENSITIVITY * x_sens + W_BULK * x_bulk + W_NO_LIMIT * x_nolimit + W_TAINT * x_taint,
        );
        self.base_score = clip01(severe + W_TOOL_PRIOR * t_prior + W_OP_PRIOR * op_prior);

        let mut reasons = Vec::new();
        if x_sens > 0.0 {
            reasons.push("Sensitive data detected (classification hits).".to_string());
        }
        if x_bulk > 0.0 {
            reasons.push("Bulk extraction indicator detected.".to_string());
        }
        if x_nolimit > 0.0 {
            reasons.push("Query missing LIMIT (potential bulk access).".to_string());
        }
        if x_taint > 0.0 {
            reasons.push("Tainted input / possible prompt injection.".to_string());
        }
        if t_prior >= 0.35 {
            reasons.push(format!("High-risk tool prior: {}.", self.tool_name));
        }
        if self.operation == Operation::Send {
            reasons.push("High-risk operation: send.".to_string());
        }
        self.reasons = reasons;
    }
}

/// Classify extracted entities against the registry.
///
/// Tables are matched directly. Qualified columns match the
/// `table.column` registry; unqualified columns fall back to the bare
/// column-name heuristics. Hit order follows input order (tables first).
#[must_use]
pub fn classify_sql_entities(
    classifier: &DataClassifier,
    tables: &[String],
    columns: &[(String, String)],
) -> Vec<ClassificationHit> {
    let mut hits = Vec::new();
    for table in tables {
        if let Some(hit) = classifier.classify_table(table) {
            hits.push(hit);
        }
    }
    for (table, column) in columns {
        if let Some(hit) = classifier.classify_column(table, column) {
            hits.push(hit);
        } else if table.is_empty() {
            if let Some(hit) = classifier.classify_column_name(column) {
                hits.push(hit);
            }
        }
    }
    hits
}
