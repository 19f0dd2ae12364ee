//! SQL entity extraction.
//!
//! Parses a statement with the generic dialect and walks the AST for
//! referenced tables and columns. The missing-LIMIT and bulk checks run on
//! the normalized text, independent of parse success, so a statement the
//! parser rejects still surfaces its bulk shape.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{visit_expressions, visit_relations, Expr, ObjectName};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\blimit\b\s+\d+").expect("limit regex"));
static SELECT_STAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bselect\s+\*\s+from\b").expect("select-star regex"));

/// Entities and shape flags extracted from one SQL string.
///
/// Sets are ordered (`BTreeSet`) so downstream metadata serializes
/// deterministically. Column pairs are `(table_or_alias, column)`; the
/// table component is empty when the reference is unqualified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlEntities {
    /// Referenced tables, schema qualifiers stripped, lowercased.
    pub tables: BTreeSet<String>,
    /// Referenced columns with their table alias when present.
    pub columns: BTreeSet<(String, String)>,
    /// False when the parser rejected the statement.
    pub parsed_ok: bool,
    /// `SELECT` statement with no `LIMIT` clause.
    pub missing_limit: bool,
    /// Missing LIMIT, or `SELECT * FROM ...` without LIMIT.
    pub bulk_indicator: bool,
}

fn rightmost_segment(name: &ObjectName) -> Option<String> {
    name.0.last().map(|ident| ident.value.to_lowercase())
}

/// Extract tables, columns and shape flags from `sql`.
#[must_use]
pub fn extract_sql_entities(sql: &str) -> SqlEntities {
    let normalized = sql.trim().to_lowercase();
    let has_limit = LIMIT_RE.is_match(&normalized);
    let missing_limit = normalized.starts_with("select") && !has_limit;
    let select_star = SELECT_STAR_RE.is_match(&normalized) && !has_limit;

    let mut out = SqlEntities {
        missing_limit,
        bulk_indicator: missing_limit || select_star,
        ..SqlEntities::default()
    };

    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(stmts) if !stmts.is_empty() => stmts,
        _ => return out,
    };
    out.parsed_ok = true;

    for stmt in &statements {
        visit_relations(stmt, |name: &ObjectName| {
            if let Some(table) = rightmost_segment(name) {
                out.tables.insert(table);
            }
            ControlFlow::<()>::Continue(())
        });
        visit_expressions(stmt, |expr: &Expr| {
            match expr {
                Expr::Identifier(ident) => {
                    out.columns.insert((String::new(), ident.value.to_lowercase()));
                }
                Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                    let column = parts[parts.len() - 1].value.to_lowercase();
                    let table = parts[parts.len() - 2].value.to_lowercase();
                    out.columns.insert((table, column));
                }
                _ => {}
            }
            ControlFlow::<()>::Continue(())
        });
    }

    if select_star {
        out.columns.insert((String::new(), "*".to_string()));
    }

    out
}
