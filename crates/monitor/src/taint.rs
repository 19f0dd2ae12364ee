//! Taint inference over bounded session history.
//!
//! A step is tainted iff its recorded provenance says so. Inference only
//! looks back `window` steps — long sessions must not accumulate
//! unbounded taint, and evaluation stays O(window).

use guard_core::HistoryStep;
use serde_json::Value;

/// True when any of the last `window` steps carries tainted provenance.
pub fn infer_from_history(history: &[HistoryStep], window: usize) -> bool {
    history.iter().rev().take(window).any(HistoryStep::tainted)
}

/// Marker strings extracted from tainted steps in the window.
///
/// Markers are what downstream content can textually reference: the query
/// string of an external lookup, plus any `taint_markers` a tool attached
/// to its metadata. Lowercased, length >= 3, deduplicated in history order
/// (oldest first).
pub fn markers_from_history(history: &[HistoryStep], window: usize) -> Vec<String> {
    let mut markers: Vec<String> = Vec::new();
    let start = history.len().saturating_sub(window);
    for step in &history[start..] {
        if !step.tainted() {
            continue;
        }
        let mut push = |s: &str| {
            let m = s.trim().to_lowercase();
            if m.len() >= 3 && !markers.contains(&m) {
                markers.push(m);
            }
        };
        if let Some(q) = step.args.get("query").and_then(Value::as_str) {
            push(q);
        }
        for meta in [&step.tool_meta, &step.monitor_meta] {
            if let Some(list) = meta.get("taint_markers").and_then(Value::as_array) {
                for v in list {
                    if let Some(s) = v.as_str() {
                        push(s);
                    }
                }
            }
        }
    }
    markers
}

/// True when `content` textually incorporates any marker.
pub fn content_uses_markers(content: &str, markers: &[String]) -> bool {
    let lower = content.to_lowercase();
    markers.iter().any(|m| lower.contains(m.as_str()))
}
