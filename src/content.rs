//! Content source: the published rows of the content system.
//!
//! The schema is owned elsewhere. [`SqliteContentStore`] reads only the
//! columns named in `[content]` and writes back only the body and scalar
//! reference fields of rows that actually changed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::config::ContentConfig;
use crate::models::ContentUnit;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Name of the body field, used to attribute body references.
    fn body_field(&self) -> &str;

    /// Every unit in the published/eligible state.
    async fn published(&self) -> Result<Vec<ContentUnit>>;

    /// Persist the body and scalar fields of `unit`.
    async fn update(&self, unit: &ContentUnit) -> Result<()>;
}

pub struct SqliteContentStore {
    pool: SqlitePool,
    config: ContentConfig,
}

impl SqliteContentStore {
    /// `config` identifiers must already be validated by `load_config`.
    pub fn new(pool: SqlitePool, config: ContentConfig) -> Self {
        Self { pool, config }
    }

    fn select_sql(&self) -> String {
        let c = &self.config;
        let mut columns = vec![
            format!("CAST(\"{}\" AS TEXT) AS unit_id", c.id_column),
            format!("\"{}\"", c.body_column),
        ];
        columns.extend(c.scalar_fields.iter().map(|f| format!("\"{}\"", f)));
        format!(
            "SELECT {} FROM \"{}\" WHERE \"{}\" = ? ORDER BY \"{}\"",
            columns.join(", "),
            c.table,
            c.status_column,
            c.id_column
        )
    }

    fn update_sql(&self) -> String {
        let c = &self.config;
        let mut assignments = vec![format!("\"{}\" = ?", c.body_column)];
        assignments.extend(c.scalar_fields.iter().map(|f| format!("\"{}\" = ?", f)));
        format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?",
            c.table,
            assignments.join(", "),
            c.id_column
        )
    }
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    fn body_field(&self) -> &str {
        &self.config.body_column
    }

    async fn published(&self) -> Result<Vec<ContentUnit>> {
        let rows = sqlx::query(&self.select_sql())
            .bind(&self.config.published_value)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to read content table '{}'", self.config.table))?;

        let mut units = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut fields = BTreeMap::new();
            for (i, name) in self.config.scalar_fields.iter().enumerate() {
                let value: Option<String> = row.try_get(i + 2)?;
                fields.insert(name.clone(), value);
            }
            units.push(ContentUnit {
                id: row.try_get("unit_id")?,
                body: row.try_get(1)?,
                fields,
            });
        }
        Ok(units)
    }

    async fn update(&self, unit: &ContentUnit) -> Result<()> {
        let sql = self.update_sql();
        let mut query = sqlx::query(&sql).bind(&unit.body);
        for name in &self.config.scalar_fields {
            query = query.bind(unit.fields.get(name).cloned().flatten());
        }
        query
            .bind(&unit.id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update content unit {}", unit.id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seeded(tmp: &TempDir) -> SqlitePool {
        let pool = crate::db::open(&tmp.path().join("c.sqlite")).await.unwrap();
        sqlx::query(
            "CREATE TABLE articles (id INTEGER PRIMARY KEY, content TEXT, featured_image TEXT, status TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        for (id, body, image, status) in [
            (1, Some("<img src=\"/uploads/a.jpg\">"), Some("/uploads/f.jpg"), "published"),
            (2, None, None, "published"),
            (3, Some("draft body"), None, "draft"),
        ] {
            sqlx::query("INSERT INTO articles VALUES (?, ?, ?, ?)")
                .bind(id)
                .bind(body)
                .bind(image)
                .bind(status)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn reads_only_published_rows() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteContentStore::new(seeded(&tmp).await, ContentConfig::default());

        let units = store.published().await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "1");
        assert_eq!(
            units[0].fields.get("featured_image"),
            Some(&Some("/uploads/f.jpg".to_string()))
        );
        assert_eq!(units[1].body, None);
        assert_eq!(store.body_field(), "content");
    }

    #[tokio::test]
    async fn update_writes_body_and_fields() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteContentStore::new(seeded(&tmp).await, ContentConfig::default());

        let mut unit = store.published().await.unwrap().remove(0);
        unit.body = Some("<img src=\"/images/2023/01/a.jpg\">".into());
        unit.fields
            .insert("featured_image".into(), Some("/images/2023/01/f.jpg".into()));
        store.update(&unit).await.unwrap();

        let reread = store.published().await.unwrap().remove(0);
        assert_eq!(reread, unit);
    }
}
