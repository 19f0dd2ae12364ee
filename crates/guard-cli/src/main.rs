//! Batch evaluation CLI for the runtime agent guard.
//!
//! `guard validate` checks an episode dataset against the Draft-7 episode
//! schema plus tool-specific argument rules; `guard run` replays each
//! episode through the monitor under a policy × approval matrix and
//! compares the episode verdict with the dataset's expectations.
//!
//! Exit codes: 0 on success, 1 on dataset validation failure, 2 on
//! internal error.

#![deny(unsafe_code)]

use clap::{Parser, Subcommand, ValueEnum};
use classifier::DataClassifier;
use guard_core::{HistoryStep, PolicyConfig, PolicyMode, ReasonCode, SessionState, Verdict};
use jsonschema::{Draft, JSONSchema};
use monitor::Monitor;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

static EPISODE_SCHEMA_JSON: &str = include_str!("../../../config/episode.schema.json");
static EPISODE_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(EPISODE_SCHEMA_JSON).expect("episode schema json");
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .expect("compile episode schema")
});

/// Environment variable naming the configuration root directory.
const CONFIG_ROOT_ENV: &str = "GUARD_CONFIG_ROOT";
const CLASSIFIER_FILE: &str = "classification.json";

#[derive(Parser, Debug)]
#[command(name = "guard", about = "Runtime agent guard batch runner")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate an episode dataset (JSONL) and print a summary
    Validate {
        #[arg(short, long)]
        dataset: PathBuf,
    },
    /// Replay episodes through the monitor and score against expectations
    Run {
        #[arg(short, long)]
        dataset: PathBuf,
        /// Policy mode; ignored when --all is set
        #[arg(long, value_enum, default_value_t = PolicyArg::Balanced)]
        policy: PolicyArg,
        /// Approval mode; ignored when --all is set
        #[arg(long, value_enum, default_value_t = ApprovalArg::StopOnAsk)]
        approval: ApprovalArg,
        /// Run the full policy × approval matrix
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Override the classifier config path
        #[arg(long)]
        classifier_config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Balanced,
    Strict,
}

impl From<PolicyArg> for PolicyMode {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Balanced => PolicyMode::Balanced,
            PolicyArg::Strict => PolicyMode::Strict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApprovalArg {
    /// ASK stops the episode (measures friction)
    StopOnAsk,
    /// ASK is treated as approved (measures downstream chain blocking)
    AutoApprove,
}

/// Expected episode verdict per policy × approval combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Expected {
    balanced: String,
    strict: String,
    auto_confirm: String,
    strict_auto: String,
}

impl Expected {
    fn for_combo(&self, policy: PolicyArg, approval: ApprovalArg) -> &str {
        match (policy, approval) {
            (PolicyArg::Balanced, ApprovalArg::StopOnAsk) => &self.balanced,
            (PolicyArg::Balanced, ApprovalArg::AutoApprove) => &self.auto_confirm,
            (PolicyArg::Strict, ApprovalArg::StopOnAsk) => &self.strict,
            (PolicyArg::Strict, ApprovalArg::AutoApprove) => &self.strict_auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Action {
    tool: String,
    #[serde(default)]
    args: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Episode {
    id: String,
    goal: String,
    label: String,
    actions: Vec<Action>,
    expected: Expected,
}

/// Verdict strings normalized to the three-valued vocabulary.
fn normalize_verdict(raw: &str) -> Option<Verdict> {
    match raw.trim().to_uppercase().as_str() {
        "ALLOW" | "ALLOWED" => Some(Verdict::Allow),
        "ASK" | "CONFIRM" | "APPROVAL" => Some(Verdict::Ask),
        "BLOCK" | "BLOCKED" | "DENY" => Some(Verdict::Block),
        _ => None,
    }
}

fn load_dataset(path: &Path) -> Result<Vec<(usize, Value)>, String> {
    let text =
        std::fs::read_to_string(path).map_err(|e| format!("read dataset {path:?}: {e}"))?;
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| format!("invalid JSON on line {}: {e}", idx + 1))?;
        rows.push((idx + 1, value));
    }
    Ok(rows)
}

/// Tool-specific argument rules the schema cannot express.
fn validate_actions(ep: &Episode) -> Vec<String> {
    let mut errors = Vec::new();
    for (j, a) in ep.actions.iter().enumerate() {
        match a.tool.as_str() {
            "run_sql" => {
                let ok = a
                    .args
                    .get("query")
                    .and_then(Value::as_str)
                    .is_some_and(|q| !q.trim().is_empty());
                if !ok {
                    errors.push(format!("actions[{j}]: run_sql requires non-empty args.query"));
                }
            }
            "read_file" => {
                let ok = a
                    .args
                    .get("path")
                    .and_then(Value::as_str)
                    .is_some_and(|p| !p.trim().is_empty());
                if !ok {
                    errors.push(format!("actions[{j}]: read_file requires non-empty args.path"));
                }
            }
            "send_email" => {
                let ok = a
                    .args
                    .get("to")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.contains('@'));
                if !ok {
                    errors.push(format!(
                        "actions[{j}]: send_email requires args.to containing '@'"
                    ));
                }
                if let Some(t) = a.args.get("tainted") {
                    if !t.is_boolean() {
                        errors.push(format!("actions[{j}]: args.tainted must be boolean"));
                    }
                }
            }
            _ => {}
        }
    }
    for (name, raw) in [
        ("balanced", &ep.expected.balanced),
        ("strict", &ep.expected.strict),
        ("auto_confirm", &ep.expected.auto_confirm),
        ("strict_auto", &ep.expected.strict_auto),
    ] {
        if normalize_verdict(raw).is_none() {
            errors.push(format!("expected.{name}: '{raw}' is not a verdict"));
        }
    }
    errors
}

/// Validate a dataset. Returns the parsed episodes or the error listing.
fn validate_dataset(path: &Path) -> Result<Vec<Episode>, Vec<String>> {
    let rows = load_dataset(path).map_err(|e| vec![e])?;
    let mut errors = Vec::new();
    let mut episodes = Vec::new();
    let mut seen_ids: BTreeMap<String, usize> = BTreeMap::new();

    for (line, value) in rows {
        if let Err(iter) = EPISODE_SCHEMA.validate(&value) {
            let msg = iter.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            errors.push(format!("line {line}: schema: {msg}"));
            continue;
        }
        let ep: Episode = match serde_json::from_value(value) {
            Ok(ep) => ep,
            Err(e) => {
                errors.push(format!("line {line}: {e}"));
                continue;
            }
        };
        if let Some(prev) = seen_ids.insert(ep.id.clone(), line) {
            errors.push(format!("line {line}: duplicate id '{}' (first on line {prev})", ep.id));
        }
        for e in validate_actions(&ep) {
            errors.push(format!("[{}] {e}", ep.id));
        }
        episodes.push(ep);
    }

    if errors.is_empty() {
        Ok(episodes)
    } else {
        Err(errors)
    }
}

fn print_dataset_summary(episodes: &[Episode]) {
    let mut labels: BTreeMap<&str, usize> = BTreeMap::new();
    let mut tools: BTreeMap<&str, usize> = BTreeMap::new();
    let mut lengths: BTreeMap<usize, usize> = BTreeMap::new();
    for ep in episodes {
        *labels.entry(ep.label.as_str()).or_default() += 1;
        *lengths.entry(ep.actions.len()).or_default() += 1;
        for a in &ep.actions {
            *tools.entry(a.tool.as_str()).or_default() += 1;
        }
    }
    println!("episodes: {}", episodes.len());
    println!("labels: {labels:?}");
    println!("episode lengths: {lengths:?}");
    println!("tool usage: {tools:?}");
}

/// Outcome of replaying one episode.
#[derive(Debug)]
struct EpisodeOutcome {
    episode_decision: Verdict,
    decisions: Vec<Verdict>,
    asks: usize,
    final_reason_codes: Vec<ReasonCode>,
    final_tool: Option<String>,
}

/// Replay one episode through a fresh monitor, simulating execution for
/// multi-step state the way the orchestrator does: the classified flag is
/// set only when the step actually executed.
fn replay_episode(
    ep: &Episode,
    policy: PolicyArg,
    approval: ApprovalArg,
    classifier: &Arc<DataClassifier>,
) -> EpisodeOutcome {
    let monitor = Monitor::new(PolicyConfig::with_mode(policy.into()), classifier.clone());
    let mut session = SessionState::new(monitor.config());
    let mut history: Vec<HistoryStep> = Vec::new();

    let mut decisions = Vec::new();
    let mut asks = 0;
    let mut final_reason_codes = Vec::new();
    let mut final_tool = None;

    for action in &ep.actions {
        let d = monitor.evaluate(&ep.goal, &action.tool, &action.args, &history, &mut session);
        decisions.push(d.verdict);
        if d.verdict == Verdict::Ask {
            asks += 1;
        }
        final_reason_codes = d.reason_codes.clone();
        final_tool = Some(action.tool.clone());

        let executed = match d.verdict {
            Verdict::Allow => true,
            Verdict::Ask => approval == ApprovalArg::AutoApprove,
            Verdict::Block => false,
        };

        history.push(HistoryStep {
            tool: action.tool.clone(),
            args: action.args.clone(),
            decision: d.verdict,
            risk_score: d.risk_score,
            reason_codes: d.reason_codes.clone(),
            monitor_meta: d.metadata.clone(),
            tool_meta: Map::new(),
        });

        if executed
            && action.tool == "run_sql"
            && d.metadata.get("classified_hit") == Some(&json!(true))
        {
            session.classified_accessed = true;
        }

        match d.verdict {
            Verdict::Block => break,
            Verdict::Ask if approval == ApprovalArg::StopOnAsk => break,
            _ => {}
        }
    }

    let episode_decision = if decisions.contains(&Verdict::Block) {
        Verdict::Block
    } else if asks > 0 {
        Verdict::Ask
    } else {
        Verdict::Allow
    };

    EpisodeOutcome { episode_decision, decisions, asks, final_reason_codes, final_tool }
}

struct ComboReport {
    policy: PolicyArg,
    approval: ApprovalArg,
    episodes: usize,
    matches: usize,
    with_expectation: usize,
    asks_total: usize,
    blocks: usize,
    mismatches: Vec<String>,
}

fn run_combo(
    episodes: &[Episode],
    policy: PolicyArg,
    approval: ApprovalArg,
    classifier: &Arc<DataClassifier>,
) -> ComboReport {
    let mut report = ComboReport {
        policy,
        approval,
        episodes: episodes.len(),
        matches: 0,
        with_expectation: 0,
        asks_total: 0,
        blocks: 0,
        mismatches: Vec::new(),
    };
    for ep in episodes {
        let out = replay_episode(ep, policy, approval, classifier);
        report.asks_total += out.asks;
        if out.episode_decision == Verdict::Block {
            report.blocks += 1;
        }
        if let Some(expected) = normalize_verdict(ep.expected.for_combo(policy, approval)) {
            report.with_expectation += 1;
            if out.episode_decision == expected {
                report.matches += 1;
            } else {
                report.mismatches.push(format!(
                    "{}: expected={} got={} label={} tool={} codes={:?} steps={:?}",
                    ep.id,
                    expected,
                    out.episode_decision,
                    ep.label,
                    out.final_tool.as_deref().unwrap_or("-"),
                    out.final_reason_codes,
                    out.decisions,
                ));
            }
        }
    }
    report
}

fn print_report(report: &ComboReport) {
    let rate = if report.with_expectation > 0 {
        #[allow(clippy::cast_precision_loss)]
        {
            report.matches as f64 / report.with_expectation as f64
        }
    } else {
        0.0
    };
    println!(
        "\n== policy={:?} approval={:?} ==",
        report.policy, report.approval
    );
    println!(
        "episodes={} matched={}/{} ({:.2}) blocks={} asks_total={}",
        report.episodes, report.matches, report.with_expectation, rate, report.blocks,
        report.asks_total
    );
    if report.mismatches.is_empty() {
        println!("no expectation mismatches");
    } else {
        println!("mismatches ({}):", report.mismatches.len());
        for m in report.mismatches.iter().take(12) {
            println!("  - {m}");
        }
        if report.mismatches.len() > 12 {
            println!("  ... and {} more", report.mismatches.len() - 12);
        }
    }
}

fn classifier_path(override_path: Option<&Path>) -> PathBuf {
    if let Some(p) = override_path {
        return p.to_path_buf();
    }
    let root = std::env::var(CONFIG_ROOT_ENV).unwrap_or_else(|_| "config".to_string());
    PathBuf::from(root).join(CLASSIFIER_FILE)
}

fn init_logging() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().json().with_current_span(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Validate { dataset } => match validate_dataset(&dataset) {
            Ok(episodes) => {
                println!("dataset validation passed");
                print_dataset_summary(&episodes);
                ExitCode::SUCCESS
            }
            Err(errors) => {
                eprintln!("dataset validation failed ({} issues):", errors.len());
                for e in errors.iter().take(25) {
                    eprintln!("  - {e}");
                }
                ExitCode::from(1)
            }
        },
        Command::Run { dataset, policy, approval, all, classifier_config } => {
            let episodes = match validate_dataset(&dataset) {
                Ok(eps) => eps,
                Err(errors) => {
                    eprintln!("dataset validation failed ({} issues)", errors.len());
                    for e in errors.iter().take(25) {
                        eprintln!("  - {e}");
                    }
                    return ExitCode::from(1);
                }
            };
            let path = classifier_path(classifier_config.as_deref());
            let classifier = match DataClassifier::load(&path) {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    eprintln!("fatal: classifier config: {e}");
                    return ExitCode::from(2);
                }
            };
            info!(dataset_episodes = episodes.len(), "starting batch run");

            let combos: Vec<(PolicyArg, ApprovalArg)> = if all {
                vec![
                    (PolicyArg::Balanced, ApprovalArg::StopOnAsk),
                    (PolicyArg::Balanced, ApprovalArg::AutoApprove),
                    (PolicyArg::Strict, ApprovalArg::StopOnAsk),
                    (PolicyArg::Strict, ApprovalArg::AutoApprove),
                ]
            } else {
                vec![(policy, approval)]
            };

            for (p, a) in combos {
                let report = run_combo(&episodes, p, a, &classifier);
                print_report(&report);
            }
            ExitCode::SUCCESS
        }
    }
}
