//! Intent similarity: Jaccard overlap between goal tokens and a
//! tool-specific projection of the arguments.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").expect("token regex"));

/// Lowercased alphanumeric tokens of length >= 3.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|t| t.len() >= 3)
        .collect()
}

/// Jaccard similarity of two token sets; empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    #[allow(clippy::cast_precision_loss)]
    {
        inter as f64 / union as f64
    }
}

fn truncate(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tool-specific argument projection used for similarity scoring.
///
/// Truncation limits keep a long body or query from drowning the goal
/// tokens; the generic projection takes the first six key=value pairs in
/// key order.
pub fn project_args(tool: &str, args: &Map<String, Value>) -> String {
    match tool {
        "read_file" => format!("path={}", truncate(arg_str(args, "path"), 150)),
        "run_sql" => format!("query={}", truncate(arg_str(args, "query"), 120)),
        "send_email" => format!(
            "to={} subject={} body={}",
            truncate(arg_str(args, "to"), 80),
            truncate(arg_str(args, "subject"), 120),
            truncate(arg_str(args, "body"), 160),
        ),
        "search_wikipedia" => format!("query={}", truncate(arg_str(args, "query"), 120)),
        _ => {
            let mut keys: Vec<&String> = args.keys().collect();
            keys.sort();
            keys.iter()
                .take(6)
                .map(|k| format!("{}={}", k, truncate(&value_text(&args[k.as_str()]), 120)))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

/// Similarity in `[0, 1]` between the goal and the projected arguments.
pub fn intent_similarity(goal: &str, tool: &str, args: &Map<String, Value>) -> f64 {
    let g = tokenize(goal);
    let a = tokenize(&project_args(tool, args));
    jaccard(&g, &a)
}
