//! Scene-name exception table.
//!
//! Release groups sometimes name a show differently from its canonical
//! listing. This table maps those alternate names to tvdb ids; lookups go
//! through the simplified form so punctuation and case never matter.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneNameRow {
    pub exception_id: i64,
    pub tvdb_id: u32,
    pub show_name: String,
    pub simplified_name: String,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for SceneNameRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        let tvdb_id: i64 = row.try_get("tvdb_id")?;
        Ok(Self {
            exception_id: row.try_get("exception_id")?,
            tvdb_id: tvdb_id as u32,
            show_name: row.try_get("show_name")?,
            simplified_name: row.try_get("simplified_name")?,
        })
    }
}

pub struct SceneNamesRepository {
    pool: SqlitePool,
}

impl SceneNamesRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Alternate names registered for a show.
    pub async fn names_for(&self, tvdb_id: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT show_name FROM scene_names WHERE tvdb_id = ?1 ORDER BY exception_id",
        )
        .bind(tvdb_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("show_name").ok())
            .collect())
    }

    /// Resolve a simplified show name to a tvdb id, if any exception
    /// matches.
    pub async fn tvdb_id_for_simplified(&self, simplified: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            "SELECT tvdb_id FROM scene_names WHERE simplified_name = ?1 LIMIT 1",
        )
        .bind(simplified)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.try_get::<i64, _>("tvdb_id").ok().map(|v| v as u32)))
    }

    /// Replace the whole table with a freshly fetched exception set.
    /// Returns true when the stored contents actually changed, so callers
    /// know whether to invalidate parse caches.
    pub async fn replace_all(&self, entries: &[(u32, String, String)]) -> Result<bool> {
        let existing = sqlx::query(
            "SELECT tvdb_id, show_name FROM scene_names ORDER BY tvdb_id, show_name",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut old: Vec<(u32, String)> = existing
            .into_iter()
            .filter_map(|row| {
                let id: i64 = row.try_get("tvdb_id").ok()?;
                let name: String = row.try_get("show_name").ok()?;
                Some((id as u32, name))
            })
            .collect();
        let mut new: Vec<(u32, String)> = entries
            .iter()
            .map(|(id, name, _)| (*id, name.clone()))
            .collect();
        old.sort();
        new.sort();
        if old == new {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM scene_names").execute(&mut *tx).await?;
        for (tvdb_id, show_name, simplified) in entries {
            sqlx::query(
                r#"
                INSERT INTO scene_names (tvdb_id, show_name, simplified_name)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(*tvdb_id as i64)
            .bind(show_name)
            .bind(simplified)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn lookup_by_simplified_name() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.scene_names();

        let entries = vec![
            (73255, "House M.D.".to_string(), "housemd".to_string()),
            (73255, "House".to_string(), "house".to_string()),
            (80379, "BBT".to_string(), "bbt".to_string()),
        ];
        assert!(repo.replace_all(&entries).await.unwrap());

        assert_eq!(
            repo.tvdb_id_for_simplified("housemd").await.unwrap(),
            Some(73255)
        );
        assert_eq!(repo.tvdb_id_for_simplified("nothere").await.unwrap(), None);
        assert_eq!(
            repo.names_for(73255).await.unwrap(),
            vec!["House M.D.".to_string(), "House".to_string()]
        );
    }

    #[tokio::test]
    async fn replace_all_reports_change() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.scene_names();

        let entries = vec![(73255, "House".to_string(), "house".to_string())];
        assert!(repo.replace_all(&entries).await.unwrap());
        // Identical fetch: no change reported.
        assert!(!repo.replace_all(&entries).await.unwrap());

        let updated = vec![(73255, "House M.D.".to_string(), "housemd".to_string())];
        assert!(repo.replace_all(&updated).await.unwrap());
        assert_eq!(repo.tvdb_id_for_simplified("house").await.unwrap(), None);
    }
}
