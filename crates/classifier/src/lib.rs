//! Config-driven data sensitivity registry.
//!
//! Maps tables, `table.column` pairs and bare column names to a sensitivity
//! tier, a numeric score and a tag set. The registry only answers lookups;
//! it never decides verdicts. Config load failures are fatal at startup
//! (deny-on-misconfiguration belongs to the caller, not here).
//!
//! `reload` is atomic: the replacement registry is built and validated in
//! full before a single write-lock swap, so concurrent readers observe
//! either the old or the new mapping, never a mix.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Errors raised while loading or validating a classification config.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Config file could not be read.
    #[error("read config {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Config file is not valid JSON for the expected shape.
    #[error("parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
    /// Config content failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sensitivity tier of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Routine data.
    Low,
    /// Internal data; handle with care.
    Medium,
    /// Classified: personal or otherwise protected data.
    High,
    /// Classified: secrets whose exposure is unrecoverable.
    Critical,
}

/// Which registry answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitKind {
    /// Full table match.
    Table,
    /// Qualified `table.column` match.
    Column,
    /// Bare column-name heuristic match.
    ColumnName,
}

/// A single classification lookup result. `key` is lowercase canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationHit {
    /// Registry that matched.
    pub kind: HitKind,
    /// Canonical lowercase key (`users`, `users.email`, `email`).
    pub key: String,
    /// Sensitivity tier.
    pub sensitivity: Sensitivity,
    /// Numeric score in `[0, 1]`.
    pub score: f64,
    /// Free-form tags from the config.
    pub tags: Vec<String>,
}

impl ClassificationHit {
    /// True when this entity counts as classified: tier `high`/`critical`
    /// or score at or above 0.8.
    #[must_use]
    pub fn is_classified(&self) -> bool {
        matches!(self.sensitivity, Sensitivity::High | Sensitivity::Critical) || self.score >= 0.8
    }
}

/// One entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Sensitivity tier; defaults to low.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: Sensitivity,
    /// Numeric score; defaults to 0.
    #[serde(default)]
    pub score: f64,
    /// Tags; defaults to empty.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_sensitivity() -> Sensitivity {
    Sensitivity::Low
}

/// On-disk config shape: three key-to-entry maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Table name → entry.
    #[serde(default)]
    pub tables: HashMap<String, EntryConfig>,
    /// `table.column` → entry.
    #[serde(default)]
    pub columns: HashMap<String, EntryConfig>,
    /// Bare column name → entry (heuristic fallback).
    #[serde(default)]
    pub column_name_heuristics: HashMap<String, EntryConfig>,
}

/// Compiled, lowercased lookup tables. Swapped wholesale on reload.
#[derive(Debug, Default)]
struct Registry {
    tables: HashMap<String, EntryConfig>,
    columns: HashMap<String, EntryConfig>,
    column_names: HashMap<String, EntryConfig>,
}

impl Registry {
    fn compile(cfg: ClassifierConfig) -> Result<Self, ClassifierError> {
        let lower = |m: HashMap<String, EntryConfig>, what: &str| {
            let mut out = HashMap::with_capacity(m.len());
            for (k, v) in m {
                if !(0.0..=1.0).contains(&v.score) {
                    return Err(ClassifierError::Invalid(format!(
                        "{what} entry '{k}' has score {} outside [0,1]",
                        v.score
                    )));
                }
                let key = k.trim().to_lowercase();
                if key.is_empty() {
                    return Err(ClassifierError::Invalid(format!("{what} entry has empty key")));
                }
                out.insert(key, v);
            }
            Ok(out)
        };
        Ok(Self {
            tables: lower(cfg.tables, "tables")?,
            columns: lower(cfg.columns, "columns")?,
            column_names: lower(cfg.column_name_heuristics, "column_name_heuristics")?,
        })
    }
}

/// Process-wide sensitivity registry. Read-mostly; `reload` swaps atomically.
#[derive(Debug)]
pub struct DataClassifier {
    path: Option<PathBuf>,
    inner: RwLock<Registry>,
}

impl DataClassifier {
    /// Load from a JSON config file. Errors are fatal to the caller.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref().to_path_buf();
        let registry = Self::read_registry(&path)?;
        Ok(Self { path: Some(path), inner: RwLock::new(registry) })
    }

    /// Build from an in-memory config (tests and embedding callers).
    pub fn from_config(cfg: ClassifierConfig) -> Result<Self, ClassifierError> {
        Ok(Self { path: None, inner: RwLock::new(Registry::compile(cfg)?) })
    }

    fn read_registry(path: &Path) -> Result<Registry, ClassifierError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ClassifierError::Io { path: path.to_path_buf(), source })?;
        let cfg: ClassifierConfig = serde_json::from_str(&text)
            .map_err(|source| ClassifierError::Parse { path: path.to_path_buf(), source })?;
        Registry::compile(cfg)
    }

    /// Re-read the config file and swap the registry in one step.
    ///
    /// On any error the old registry stays in place untouched.
    pub fn reload(&self) -> Result<(), ClassifierError> {
        let Some(path) = &self.path else {
            return Err(ClassifierError::Invalid(
                "classifier was built from memory; nothing to reload".into(),
            ));
        };
        let fresh = Self::read_registry(path)?;
        let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = fresh;
        Ok(())
    }

    fn hit(kind: HitKind, key: String, entry: &EntryConfig) -> ClassificationHit {
        ClassificationHit {
            kind,
            key,
            sensitivity: entry.sensitivity,
            score: entry.score,
            tags: entry.tags.clone(),
        }
    }

    /// Case-insensitive table lookup.
    #[must_use]
    pub fn classify_table(&self, table: &str) -> Option<ClassificationHit> {
        if table.is_empty() {
            return None;
        }
        let key = table.to_lowercase();
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.tables.get(&key).map(|e| Self::hit(HitKind::Table, key.clone(), e))
    }

    /// Qualified `table.column` lookup; `table` may be empty (unresolved).
    #[must_use]
    pub fn classify_column(&self, table: &str, column: &str) -> Option<ClassificationHit> {
        if column.is_empty() {
            return None;
        }
        let key = format!("{}.{}", table.to_lowercase(), column.to_lowercase());
        let key = key.trim_matches('.').to_string();
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.columns.get(&key).map(|e| Self::hit(HitKind::Column, key.clone(), e))
    }

    /// Heuristic fallback on a bare column name.
    #[must_use]
    pub fn classify_column_name(&self, column: &str) -> Option<ClassificationHit> {
        if column.is_empty() {
            return None;
        }
        let key = column.to_lowercase();
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.column_names.get(&key).map(|e| Self::hit(HitKind::ColumnName, key.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> ClassifierConfig {
        serde_json::from_value(serde_json::json!({
            "tables": {
                "users": {"sensitivity": "high", "score": 0.8, "tags": ["pii"]},
                "api_keys": {"sensitivity": "critical", "score": 1.0, "tags": ["secrets"]}
            },
            "columns": {
                "users.email": {"sensitivity": "high", "score": 0.9, "tags": ["pii"]}
            },
            "column_name_heuristics": {
                "email": {"sensitivity": "medium", "score": 0.6, "tags": ["pii"]},
                "password": {"sensitivity": "high", "score": 0.9, "tags": ["secrets"]}
            }
        }))
        .unwrap()
    }

    #[test]
    fn lookups_are_case_insensitive_and_canonical() {
        let c = DataClassifier::from_config(sample_config()).unwrap();
        let hit = c.classify_table("Users").unwrap();
        assert_eq!(hit.key, "users");
        assert_eq!(hit.kind, HitKind::Table);
        assert!(hit.is_classified());

        let hit = c.classify_column("USERS", "Email").unwrap();
        assert_eq!(hit.key, "users.email");
        assert_eq!(hit.kind, HitKind::Column);

        let hit = c.classify_column_name("PASSWORD").unwrap();
        assert_eq!(hit.key, "password");
        assert_eq!(hit.kind, HitKind::ColumnName);
    }

    #[test]
    fn unresolved_table_falls_back_to_bare_key() {
        let c = DataClassifier::from_config(sample_config()).unwrap();
        assert!(c.classify_column("", "email").is_none());
        assert!(c.classify_column_name("email").is_some());
    }

    #[test]
    fn medium_low_entries_are_not_classified() {
        let c = DataClassifier::from_config(sample_config()).unwrap();
        let hit = c.classify_column_name("email").unwrap();
        assert!(!hit.is_classified());
    }

    #[test]
    fn score_out_of_range_is_fatal() {
        let cfg: ClassifierConfig = serde_json::from_value(serde_json::json!({
            "tables": {"users": {"sensitivity": "low", "score": 1.5}}
        }))
        .unwrap();
        assert!(matches!(
            DataClassifier::from_config(cfg),
            Err(ClassifierError::Invalid(_))
        ));
    }

    #[test]
    fn reload_swaps_registry() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{}", serde_json::json!({"tables": {"users": {"score": 0.2}}})).unwrap();
        let c = DataClassifier::load(f.path()).unwrap();
        assert!(!c.classify_table("users").unwrap().is_classified());

        std::fs::write(
            f.path(),
            serde_json::json!({"tables": {"users": {"sensitivity": "high", "score": 0.8}}})
                .to_string(),
        )
        .unwrap();
        c.reload().unwrap();
        assert!(c.classify_table("users").unwrap().is_classified());
    }

    #[test]
    fn failed_reload_keeps_old_registry() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{}", serde_json::json!({"tables": {"users": {"score": 0.2}}})).unwrap();
        let c = DataClassifier::load(f.path()).unwrap();
        std::fs::write(f.path(), "{ not json").unwrap();
        assert!(c.reload().is_err());
        assert!(c.classify_table("users").is_some());
    }
}
