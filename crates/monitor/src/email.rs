//! Email (egress) decision rules.
//!
//! The rule order is the contract. Content blocks (secrets, exfiltration
//! phrases) come before everything so an obvious leak can never be talked
//! past by a plausible goal; the classified-egress invariant comes before
//! the safe-internal shortcut because data already read under a classified
//! marker dominates recipient trust.

use crate::taint;
use guard_core::{
    Decision, HistoryStep, PolicyConfig, Provenance, ReasonCode, SessionState, Source,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

/// Keywords that mark credential-bearing content.
const CREDENTIAL_KEYWORDS: &[&str] = &[
    "password",
    "api key",
    "apikey",
    "secret",
    "token",
    "private key",
    "ssh",
    "credential",
];

/// Phrases that mark bulk exfiltration intent.
const EXFIL_PHRASES: &[&str] = &[
    "all users",
    "dump",
    "export",
    "send everything",
    "entire database",
    "full list",
    "full user list",
];

/// Goal terms that legitimize outbound email.
const EMAIL_INTENT_TERMS: &[&str] =
    &["email", "send", "mail", "message", "share", "forward", "notify", "report"];

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bgh[pousr]_[A-Za-z0-9]{36}\b",
        r"\bsk-[A-Za-z0-9_-]{8,}\b",
        r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b",
        r"(?s)-----BEGIN (?:RSA |EC |OPENSSH )?PRIVATE KEY-----",
        r"\b[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("secret pattern"))
    .collect()
});

fn domain_of(recipient: &str) -> Option<String> {
    recipient.rsplit_once('@').map(|(_, d)| d.trim().to_lowercase())
}

/// Evaluate a proposed `send_email` call. Rules fire strictly in order.
#[allow(clippy::too_many_lines)]
pub(crate) fn evaluate(
    cfg: &PolicyConfig,
    goal: &str,
    args: &Map<String, Value>,
    history: &[HistoryStep],
    session: &SessionState,
) -> Decision {
    let to = args.get("to").and_then(Value::as_str).unwrap_or("");
    let subject = args.get("subject").and_then(Value::as_str).unwrap_or("");
    let body = args.get("body").and_then(Value::as_str).unwrap_or("");

    let goal_l = goal.to_lowercase();
    let content = format!("{} {}", subject.to_lowercase(), body.to_lowercase());

    let tainted_direct = args.get("tainted").and_then(Value::as_bool).unwrap_or(false);
    let tainted_history = taint::infer_from_history(history, cfg.taint_history_window);
    let tainted = tainted_direct || tainted_history;
    let markers = taint::markers_from_history(history, cfg.taint_history_window);
    let uses_taint = taint::content_uses_markers(&content, &markers);

    let finish = |mut d: Decision| {
        let mut prov = Provenance::clean(Source::Egress);
        prov.tainted = tainted;
        d.insert_meta("provenance", prov.to_value());
        if let Some(domain) = domain_of(to) {
            d.insert_meta("recipient_domain", json!(domain));
        }
        d.insert_meta("uses_taint", json!(uses_taint));
        d
    };

    // 1. Malformed recipient.
    let Some(domain) = domain_of(to) else {
        return finish(Decision::ask(
            "Recipient address is missing or malformed.",
            0.5,
            vec![ReasonCode::EmailInvalidRecipient],
        ));
    };

    // 2. Credential-bearing content.
    let keyword_hit = CREDENTIAL_KEYWORDS.iter().any(|k| content.contains(k));
    let pattern_hit = SECRET_PATTERNS.iter().any(|re| re.is_match(&content));
    if keyword_hit || pattern_hit {
        return finish(Decision::block(
            "Outbound content contains credential-like material.",
            1.0,
            vec![ReasonCode::EmailContainsSecrets],
        ));
    }

    // 3. Bulk exfiltration phrasing.
    if EXFIL_PHRASES.iter().any(|p| content.contains(p)) {
        return finish(Decision::block(
            "Outbound content matches a bulk-exfiltration pattern.",
            1.0,
            vec![ReasonCode::EmailExfilPattern],
        ));
    }

    // 4. Classified data was read earlier in this session.
    if session.classified_accessed {
        if cfg.is_strict() {
            return finish(Decision::block(
                "Egress after classified data access is blocked under strict policy.",
                0.95,
                vec![ReasonCode::EgressAfterClassifiedBlock],
            ));
        }
        return finish(Decision::ask(
            "Classified data was accessed earlier; outbound email needs approval.",
            0.85,
            vec![ReasonCode::EgressAfterClassifiedAsk],
        ));
    }

    // 5. Goal never asked for email.
    if !EMAIL_INTENT_TERMS.iter().any(|t| goal_l.contains(t)) {
        return finish(Decision::ask(
            "Sending email was not clearly requested in the goal.",
            0.6,
            vec![ReasonCode::EmailNotInGoal],
        ));
    }

    // 6/7. Explicit recipient-domain allowlist, when configured.
    if let Some(allowlist) = &cfg.email_domain_allowlist {
        if !allowlist.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            return finish(Decision::ask(
                format!("Recipient domain '{domain}' is not on the allowlist."),
                0.6,
                vec![ReasonCode::EmailDomainNotAllowed],
            ));
        }
        return finish(Decision::allow(
            "Recipient domain is allowlisted and content is clean.",
            0.2,
            vec![ReasonCode::EmailAllowedAllowlist],
        ));
    }

    // 8. Safe-internal shortcut: trusted domain, and any taint present is
    //    not textually referenced by the outgoing content.
    let internal = cfg.internal_email_domains.iter().any(|d| d.eq_ignore_ascii_case(&domain));
    if internal && !(tainted && uses_taint) {
        return finish(Decision::allow(
            "Internal recipient and content does not reference tainted input.",
            0.2,
            vec![ReasonCode::EmailAllowedInternalSafe],
        ));
    }

    // 9. Tainted input, direct or inferred from recent history.
    if tainted {
        return finish(Decision::ask(
            "Content may derive from untrusted input; confirm before sending.",
            0.65,
            vec![ReasonCode::EmailTaintedContent],
        ));
    }

    // 10. Default egress control.
    finish(Decision::ask(
        "Outbound email requires confirmation.",
        0.6,
        vec![ReasonCode::EmailEgressConfirmDefault],
    ))
}
