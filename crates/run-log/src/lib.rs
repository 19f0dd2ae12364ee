//! Tamper-evident session run log.
//!
//! One JSON document per run under the `runtime_agent_guard.v1` schema:
//! goal, policy mode, final session state, summary aggregates and the full
//! step list, serialized with stable field order. Steps are folded into a
//! SHA-256 hash chain whose head is stored alongside them — editing any
//! step invalidates every digest after it.

#![deny(unsafe_code)]

use chrono::{SecondsFormat, Utc};
use guard_core::{SessionState, StepRecord, Verdict};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Log schema identifier. Bumped on any breaking change to the step
/// shape or the reason-code vocabulary.
pub const SCHEMA_VERSION: &str = "runtime_agent_guard.v1";

/// Hash-chain algorithm identifier stored in the document.
pub const CHAIN_ALGO: &str = "sha256-chain";

/// Errors from writing or verifying a run log.
#[derive(Debug, Error)]
pub enum RunLogError {
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    /// Document failed structural validation.
    #[error("invalid: {0}")]
    Invalid(String),
}

/// Run-level aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total steps recorded.
    pub steps: usize,
    /// Maximum risk score across steps, rounded to 3 decimals.
    pub max_risk: f64,
    /// True when any step was blocked.
    pub blocked: bool,
    /// Count of ASK verdicts.
    pub asks: usize,
    /// Count of ALLOW verdicts.
    pub allows: usize,
    /// Count of approved ASKs.
    pub approvals: usize,
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Aggregate a history into run-level statistics.
#[must_use]
pub fn summarize(history: &[StepRecord]) -> RunSummary {
    let max_risk = history.iter().map(|s| s.risk_score).fold(0.0_f64, f64::max);
    RunSummary {
        steps: history.len(),
        max_risk: round3(max_risk),
        blocked: history.iter().any(|s| s.decision == Verdict::Block),
        asks: history.iter().filter(|s| s.decision == Verdict::Ask).count(),
        allows: history.iter().filter(|s| s.decision == Verdict::Allow).count(),
        approvals: history.iter().filter(|s| s.approved == Some(true)).count(),
    }
}

/// Integrity section: per-step digests plus the chain head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integrity {
    /// Digest algorithm identifier.
    pub algo: String,
    /// Hex digest per step, in order.
    pub step_digests: Vec<String>,
    /// Hex digest of the whole chain.
    pub head: String,
}

/// The persisted run document. Field order is the serialized order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    /// Schema identifier.
    pub schema: String,
    /// Run identifier (also the file stem).
    pub run_id: String,
    /// ISO-8601 UTC timestamp with `Z` suffix.
    pub timestamp_utc: String,
    /// Session goal.
    pub goal: String,
    /// Policy mode the session ran under.
    pub policy_mode: String,
    /// Final session state.
    pub session_state: SessionState,
    /// Run-level aggregates.
    pub summary: RunSummary,
    /// Hash chain over the serialized steps.
    pub integrity: Integrity,
    /// Full step records in order.
    pub steps: Vec<StepRecord>,
}

fn chain_over(steps: &[StepRecord]) -> Result<Integrity, RunLogError> {
    let mut prev: Vec<u8> = Sha256::digest(SCHEMA_VERSION.as_bytes()).to_vec();
    let mut digests = Vec::with_capacity(steps.len());
    for step in steps {
        let encoded = serde_json::to_vec(step)?;
        let mut hasher = Sha256::new();
        hasher.update(&prev);
        hasher.update(&encoded);
        prev = hasher.finalize().to_vec();
        digests.push(hex::encode(&prev));
    }
    Ok(Integrity {
        algo: CHAIN_ALGO.to_string(),
        head: digests.last().cloned().unwrap_or_else(|| hex::encode(&prev)),
        step_digests: digests,
    })
}

/// Recompute the chain of a document and compare against its integrity
/// section. Returns `Ok(())` only when every digest matches.
pub fn verify_chain(doc: &RunDocument) -> Result<(), RunLogError> {
    if doc.integrity.algo != CHAIN_ALGO {
        return Err(RunLogError::Invalid(format!(
            "unsupported chain algo '{}'",
            doc.integrity.algo
        )));
    }
    let fresh = chain_over(&doc.steps)?;
    if fresh.step_digests != doc.integrity.step_digests || fresh.head != doc.integrity.head {
        return Err(RunLogError::Invalid("hash chain mismatch".into()));
    }
    Ok(())
}

/// Writes one pretty-printed JSON document per run into a directory.
#[derive(Debug, Clone)]
pub struct RunLogWriter {
    dir: PathBuf,
}

impl RunLogWriter {
    /// Create a writer rooted at `dir` (created on demand).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist a run. Returns the path written.
    pub fn write(
        &self,
        goal: &str,
        policy_mode: &str,
        session_state: &SessionState,
        history: &[StepRecord],
    ) -> Result<PathBuf, RunLogError> {
        std::fs::create_dir_all(&self.dir)?;
        let now = Utc::now();
        let run_id = format!("run_{}", now.format("%Y%m%d_%H%M%S_%3f"));
        let doc = RunDocument {
            schema: SCHEMA_VERSION.to_string(),
            run_id: run_id.clone(),
            timestamp_utc: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            goal: goal.to_string(),
            policy_mode: policy_mode.to_string(),
            session_state: session_state.clone(),
            summary: summarize(history),
            integrity: chain_over(history)?,
            steps: history.to_vec(),
        };
        let path = self.dir.join(format!("{run_id}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
        Ok(path)
    }
}

/// Read a run document back from disk.
pub fn read_document(path: impl AsRef<Path>) -> Result<RunDocument, RunLogError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
