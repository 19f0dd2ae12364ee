//! SQL decision table.
//!
//! Rows are evaluated strictly in order: strict-mode classified block,
//! critical score block, ASK threshold / missing LIMIT, parse uncertainty,
//! low-risk allow. A statement the parser rejects can never reach ALLOW.

use classifier::DataClassifier;
use guard_core::{Decision, PolicyConfig, Provenance, ReasonCode, Source};
use serde_json::{json, Map, Value};
use signals::{classify_sql_entities, extract_sql_entities, Operation, RiskSignals};

/// Risk attached to an empty or unparseable query.
const PARSE_UNCERTAIN_RISK: f64 = 0.6;
const MISSING_QUERY_RISK: f64 = 0.4;

fn attach_metadata(d: &mut Decision, sig: &RiskSignals, classified_keys: &[String]) {
    d.insert_meta(
        "signals",
        json!({
            "tables": sig.tables,
            "columns": sig.columns,
            "missing_limit": sig.missing_limit,
            "bulk_indicator": sig.bulk_indicator,
            "base_score": sig.base_score,
        }),
    );
    d.insert_meta("classified_hit", json!(!classified_keys.is_empty()));
    d.insert_meta("classified_keys", json!(classified_keys));
    d.insert_meta("provenance", Provenance::clean(Source::Db).to_value());
}

/// Evaluate a proposed `run_sql` call.
pub(crate) fn evaluate(
    cfg: &PolicyConfig,
    classifier: &DataClassifier,
    goal: &str,
    args: &Map<String, Value>,
    tainted_input: bool,
) -> Decision {
    let query = args.get("query").and_then(Value::as_str).unwrap_or("");
    if query.trim().is_empty() {
        let mut d = Decision::ask(
            "SQL query is empty; nothing to assess.",
            MISSING_QUERY_RISK,
            vec![ReasonCode::SqlMissingQuery],
        );
        d.insert_meta("provenance", Provenance::clean(Source::Db).to_value());
        return d;
    }

    let entities = extract_sql_entities(query);
    let mut sig = RiskSignals::new("run_sql", Operation::Query, goal);
    sig.tables = entities.tables.iter().cloned().collect();
    sig.columns = entities.columns.iter().cloned().collect();
    sig.sensitivity_hits = classify_sql_entities(classifier, &sig.tables, &sig.columns);
    sig.missing_limit = entities.missing_limit;
    sig.bulk_indicator = entities.bulk_indicator;
    sig.tainted_input = tainted_input;
    sig.finalize();

    let mut classified_keys: Vec<String> = Vec::new();
    for key in sig.classified_keys() {
        if !classified_keys.contains(&key) {
            classified_keys.push(key);
        }
    }
    let any_classified = !classified_keys.is_empty();
    let top_reason = sig
        .reasons
        .first()
        .cloned()
        .unwrap_or_else(|| "No sensitive tables or columns detected.".to_string());

    let mut d = if cfg.is_strict() && any_classified {
        Decision::block(
            format!("Classified data access blocked under strict policy: {top_reason}"),
            sig.base_score.max(0.9),
            vec![ReasonCode::SqlClassifiedBlockStrict],
        )
    } else if sig.base_score >= cfg.high_risk_block {
        Decision::block(
            format!("Critical-risk query blocked: {top_reason}"),
            sig.base_score,
            vec![ReasonCode::SqlCriticalClassified],
        )
    } else if sig.base_score >= cfg.ask_threshold || sig.missing_limit {
        let mut codes = Vec::new();
        if !sig.sensitivity_hits.is_empty() {
            codes.push(ReasonCode::SqlClassifiedAsk);
        }
        if sig.missing_limit {
            codes.push(ReasonCode::SqlMissingLimit);
        }
        if !entities.parsed_ok {
            codes.push(ReasonCode::SqlParseUncertain);
        }
        if codes.is_empty() {
            codes.push(ReasonCode::SqlClassifiedAsk);
        }
        Decision::ask(
            format!("Query requires confirmation: {top_reason}"),
            sig.base_score.max(cfg.ask_threshold),
            codes,
        )
    } else if !entities.parsed_ok {
        Decision::ask(
            "Could not parse SQL reliably; confirm intent.",
            PARSE_UNCERTAIN_RISK,
            vec![ReasonCode::SqlParseUncertain],
        )
    } else {
        Decision::allow(
            "Query references no sensitive entities and is bounded.",
            sig.base_score,
            vec![ReasonCode::SqlLow],
        )
    };

    attach_metadata(&mut d, &sig, &classified_keys);
    d
}
