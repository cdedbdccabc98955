//! Per-show follow flag and wanted-quality mask.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::release::quality::Quality;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowSettingsRow {
    pub tvdb_id: u32,
    pub followed: bool,
    pub wanted_quality: Quality,
}

impl ShowSettingsRow {
    /// Row used when a show has never been configured.
    pub fn unconfigured(tvdb_id: u32) -> Self {
        Self {
            tvdb_id,
            followed: false,
            wanted_quality: Quality::SD,
        }
    }
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for ShowSettingsRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        let tvdb_id: i64 = row.try_get("tvdb_id")?;
        let follow: i64 = row.try_get("follow")?;
        let wanted: i64 = row.try_get("wanted_quality")?;
        Ok(Self {
            tvdb_id: tvdb_id as u32,
            followed: follow != 0,
            wanted_quality: Quality(wanted as u32),
        })
    }
}

pub struct ShowSettingsRepository {
    pool: SqlitePool,
}

impl ShowSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tvdb_id: u32) -> Result<Option<ShowSettingsRow>> {
        let row = sqlx::query_as::<_, ShowSettingsRow>(
            "SELECT tvdb_id, follow, wanted_quality FROM show_settings WHERE tvdb_id = ?1",
        )
        .bind(tvdb_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn set_followed(&self, tvdb_id: u32, followed: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO show_settings (tvdb_id, follow, wanted_quality)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (tvdb_id) DO UPDATE SET follow = ?2
            "#,
        )
        .bind(tvdb_id as i64)
        .bind(followed as i64)
        .bind(Quality::SD.0 as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_wanted_quality(&self, tvdb_id: u32, wanted: Quality) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO show_settings (tvdb_id, follow, wanted_quality)
            VALUES (?1, 0, ?2)
            ON CONFLICT (tvdb_id) DO UPDATE SET wanted_quality = ?2
            "#,
        )
        .bind(tvdb_id as i64)
        .bind(wanted.0 as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ids of every followed show.
    pub async fn followed_ids(&self) -> Result<Vec<u32>> {
        let rows = sqlx::query("SELECT tvdb_id FROM show_settings WHERE follow != 0")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<i64, _>("tvdb_id").ok())
            .map(|id| id as u32)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn follow_and_quality_upserts() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.show_settings();

        assert_eq!(repo.get(73255).await.unwrap(), None);

        repo.set_followed(73255, true).await.unwrap();
        let row = repo.get(73255).await.unwrap().unwrap();
        assert!(row.followed);
        assert_eq!(row.wanted_quality, Quality::SD);

        repo.set_wanted_quality(73255, Quality::HD720P).await.unwrap();
        let row = repo.get(73255).await.unwrap().unwrap();
        assert!(row.followed);
        assert_eq!(row.wanted_quality, Quality::HD720P);

        repo.set_followed(73255, false).await.unwrap();
        let row = repo.get(73255).await.unwrap().unwrap();
        assert!(!row.followed);
        // Unfollowing must not clobber the configured quality.
        assert_eq!(row.wanted_quality, Quality::HD720P);

        repo.set_followed(1234, true).await.unwrap();
        assert_eq!(repo.followed_ids().await.unwrap(), vec![1234]);
    }
}
