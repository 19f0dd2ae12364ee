//! File-access policy: reads must resolve inside the allowed docs base.
//!
//! Containment is checked after canonicalization. For paths that do not
//! exist yet, canonicalization falls back to a lexical normalization that
//! expands `.` and `..`, so traversal attempts are judged on the resolved
//! shape, not the literal string.

use guard_core::{Decision, PolicyConfig, Provenance, ReasonCode, Source};
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};

/// Expand `.` and `..` without touching the filesystem.
///
/// For absolute paths, `..` at the root clamps (mirrors what a kernel
/// resolution would do). For relative paths a leading `..` survives, which
/// can never sit inside an absolute base.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    out
}

/// Canonicalize if the path exists, otherwise normalize lexically.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    match std::fs::canonicalize(&absolute) {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(normalize_lexically(&absolute)),
        Err(e) => Err(e),
    }
}

/// Evaluate a proposed `read_file` call.
pub(crate) fn evaluate(cfg: &PolicyConfig, args: &Map<String, Value>) -> Decision {
    let path_str = args.get("path").and_then(Value::as_str).unwrap_or("");
    if path_str.trim().is_empty() {
        let mut d = Decision::ask(
            "File path is missing.",
            0.4,
            vec![ReasonCode::FileMissingPath],
        );
        d.insert_meta("provenance", Provenance::clean(Source::File).to_value());
        return d;
    }

    if path_str.contains('\0') {
        let mut d = Decision::block(
            "File path could not be resolved.",
            0.9,
            vec![ReasonCode::InvalidPath],
        );
        d.insert_meta("provenance", Provenance::clean(Source::File).to_value());
        return d;
    }

    let base = match resolve(&cfg.allowed_docs_base) {
        Ok(p) => p,
        Err(e) => {
            let mut d = Decision::block(
                format!("Allowed docs base could not be resolved: {e}"),
                0.9,
                vec![ReasonCode::InvalidPath],
            );
            d.insert_meta("provenance", Provenance::clean(Source::File).to_value());
            return d;
        }
    };

    let resolved = match resolve(Path::new(path_str)) {
        Ok(p) => p,
        Err(e) => {
            let mut d = Decision::block(
                format!("File path could not be resolved: {e}"),
                0.9,
                vec![ReasonCode::InvalidPath],
            );
            d.insert_meta("provenance", Provenance::clean(Source::File).to_value());
            return d;
        }
    };

    let mut prov = Provenance::clean(Source::File);
    prov.extra.insert("resolved_path".into(), json!(resolved.to_string_lossy()));

    if !resolved.starts_with(&base) {
        let mut d = Decision::block(
            "File access outside the allowed docs directory.",
            1.0,
            vec![ReasonCode::FileOutsideAllowedDir],
        );
        d.insert_meta("provenance", prov.to_value());
        return d;
    }

    let mut d = Decision::allow(
        "Reading from the allowed docs directory.",
        0.1,
        vec![ReasonCode::FileAllowed],
    );
    d.insert_meta("provenance", prov.to_value());
    d
}
