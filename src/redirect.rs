//! Redirect rules: derivation, persistence, and reverse-proxy rendering.
//!
//! The `redirects` table is the single source of truth. Both proxy dialects
//! are pure renderings of [`RedirectStore::all`] and can be regenerated at
//! any time with `wprl render`.
//!
//! # Uniqueness
//!
//! Rules are keyed on `from_path`. Inserting a rule whose `from_path` already
//! exists is not an error: the stored rule is left untouched and the insert
//! is counted as a duplicate. The first-seen target wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::classify::Classifier;
use crate::models::{FetchResult, RedirectRule};

/// Derive one rule per successful fetch whose original reference can be
/// reduced to a path on the managed origin. Everything else is dropped.
pub fn build_rules(
    results: &[FetchResult],
    classifier: &Classifier,
    status_code: u16,
) -> Vec<RedirectRule> {
    results
        .iter()
        .filter(|r| r.outcome.is_success())
        .filter_map(|r| {
            let from_path = classifier.managed_path(&r.original)?;
            if from_path == r.new_url {
                return None;
            }
            Some(RedirectRule {
                from_path,
                to_path: r.new_url.clone(),
                status_code,
                content_id: r.content_id.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Table-like store of redirect rules keyed on `from_path`.
#[async_trait]
pub trait RedirectStore: Send + Sync {
    /// Insert unless `from_path` exists. Returns `true` when a row was added.
    async fn insert_if_absent(&self, rule: &RedirectRule) -> Result<bool>;

    /// Every stored rule, in insertion order.
    async fn all(&self) -> Result<Vec<RedirectRule>>;

    async fn lookup(&self, from_path: &str) -> Result<Option<RedirectRule>>;

    async fn insert_all(&self, rules: &[RedirectRule]) -> Result<PersistSummary> {
        let mut summary = PersistSummary::default();
        for rule in rules {
            if self.insert_if_absent(rule).await? {
                summary.inserted += 1;
            } else {
                summary.duplicates += 1;
            }
        }
        Ok(summary)
    }
}

pub async fn persist(store: &dyn RedirectStore, rules: &[RedirectRule]) -> Result<PersistSummary> {
    store.insert_all(rules).await
}

pub struct SqliteRedirectStore {
    pool: SqlitePool,
}

impl SqliteRedirectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM redirects")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

const INSERT_SQL: &str = r#"
    INSERT INTO redirects (from_path, to_path, status_code, content_id, created_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(from_path) DO NOTHING
"#;

#[async_trait]
impl RedirectStore for SqliteRedirectStore {
    async fn insert_if_absent(&self, rule: &RedirectRule) -> Result<bool> {
        let result = sqlx::query(INSERT_SQL)
            .bind(&rule.from_path)
            .bind(&rule.to_path)
            .bind(rule.status_code as i64)
            .bind(&rule.content_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_all(&self, rules: &[RedirectRule]) -> Result<PersistSummary> {
        let now = chrono::Utc::now().timestamp();
        let mut summary = PersistSummary::default();
        let mut tx = self.pool.begin().await?;

        for rule in rules {
            let result = sqlx::query(INSERT_SQL)
                .bind(&rule.from_path)
                .bind(&rule.to_path)
                .bind(rule.status_code as i64)
                .bind(&rule.content_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                summary.inserted += 1;
            } else {
                debug!(from = %rule.from_path, "redirect exists, skipped");
                summary.duplicates += 1;
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn all(&self) -> Result<Vec<RedirectRule>> {
        let rows = sqlx::query(
            "SELECT from_path, to_path, status_code, content_id FROM redirects ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_rule).collect()
    }

    async fn lookup(&self, from_path: &str) -> Result<Option<RedirectRule>> {
        let row = sqlx::query(
            "SELECT from_path, to_path, status_code, content_id FROM redirects WHERE from_path = ?",
        )
        .bind(from_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_rule).transpose()
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<RedirectRule> {
    let from_path: String = row.try_get("from_path")?;
    let code: i64 = row.try_get("status_code")?;
    let status_code = u16::try_from(code)
        .with_context(|| format!("Invalid status code {} stored for {}", code, from_path))?;
    Ok(RedirectRule {
        to_path: row.try_get("to_path")?,
        status_code,
        content_id: row
            .try_get::<Option<String>, _>("content_id")?
            .unwrap_or_default(),
        from_path,
    })
}

// ============ Proxy config rendering ============

const HEADER: &str = "# Legacy image redirects\n# Generated by wprl from the redirects table; regenerate with `wprl render`\n\n";

/// nginx exact-match `location` blocks.
///
/// nginx matches the decoded URI without its query string, so the query is
/// dropped and the path decoded; when two rules collapse to the same
/// location the first one is kept.
pub fn render_nginx(rules: &[RedirectRule]) -> String {
    let mut out = String::from(HEADER);
    let mut seen = HashSet::new();
    for rule in rules {
        let location = match_path(&rule.from_path);
        if !renderable(&location, rule) {
            continue;
        }
        if !seen.insert(location.clone()) {
            continue;
        }
        out.push_str(&format!(
            "location = {} {{\n    return {} {};\n}}\n\n",
            quote(&location),
            rule.status_code,
            quote(&rule.to_path)
        ));
    }
    out
}

/// Apache `mod_alias` directives, one per line.
pub fn render_htaccess(rules: &[RedirectRule]) -> String {
    let mut out = String::from(HEADER);
    let mut seen = HashSet::new();
    for rule in rules {
        let path = match_path(&rule.from_path);
        if !renderable(&path, rule) {
            continue;
        }
        if !seen.insert(path.clone()) {
            continue;
        }
        out.push_str(&format!(
            "Redirect {} {} {}\n",
            rule.status_code,
            quote(&path),
            quote(&rule.to_path)
        ));
    }
    out
}

/// Query-less, decoded form of `from_path`. Paths whose decoding yields
/// control characters stay encoded.
fn match_path(from_path: &str) -> String {
    let path = from_path.split('?').next().unwrap_or(from_path);
    match percent_decode_str(path).decode_utf8() {
        Ok(decoded) if !decoded.chars().any(char::is_control) => decoded.into_owned(),
        _ => path.to_string(),
    }
}

/// A raw control character would end the directive early.
fn renderable(match_path: &str, rule: &RedirectRule) -> bool {
    let ok = !match_path
        .chars()
        .chain(rule.to_path.chars())
        .any(char::is_control);
    if !ok {
        warn!(from = ?rule.from_path, to = ?rule.to_path, "control character in redirect, not rendered");
    }
    ok
}

fn quote(s: &str) -> String {
    let needs_quotes = s
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '#'));
    if needs_quotes {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}
