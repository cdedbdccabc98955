//! Scene-to-tvdb episode numbering map (xem).
//!
//! Stores every known correspondence between a show's scene numbering and
//! its tvdb numbering. An empty result for a show means "no mapping", which
//! callers treat as identity.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XemEntry {
    pub tvdb_season: u32,
    pub tvdb_episode: u32,
    pub scene_season: u32,
    pub scene_episode: u32,
}

pub struct NumberingRepository {
    pool: SqlitePool,
}

impl NumberingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Tvdb episodes a scene (season, episode) maps to. Empty when the show
    /// has no mapping at all.
    pub async fn to_tvdb(
        &self,
        tvdb_id: u32,
        scene_season: u32,
        scene_episode: u32,
    ) -> Result<Vec<(u32, u32)>> {
        let rows = sqlx::query(
            r#"
            SELECT tvdb_season, tvdb_episode FROM xem_num
            WHERE tvdb_id = ?1 AND scene_season = ?2 AND scene_episode = ?3
            ORDER BY tvdb_season ASC, tvdb_episode ASC
            "#,
        )
        .bind(tvdb_id as i64)
        .bind(scene_season as i64)
        .bind(scene_episode as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let s: i64 = row.try_get("tvdb_season").ok()?;
                let e: i64 = row.try_get("tvdb_episode").ok()?;
                Some((s as u32, e as u32))
            })
            .collect())
    }

    /// Scene episodes a tvdb (season, episode) maps to.
    pub async fn to_scene(
        &self,
        tvdb_id: u32,
        tvdb_season: u32,
        tvdb_episode: u32,
    ) -> Result<Vec<(u32, u32)>> {
        let rows = sqlx::query(
            r#"
            SELECT scene_season, scene_episode FROM xem_num
            WHERE tvdb_id = ?1 AND tvdb_season = ?2 AND tvdb_episode = ?3
            ORDER BY scene_season ASC, scene_episode ASC
            "#,
        )
        .bind(tvdb_id as i64)
        .bind(tvdb_season as i64)
        .bind(tvdb_episode as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let s: i64 = row.try_get("scene_season").ok()?;
                let e: i64 = row.try_get("scene_episode").ok()?;
                Some((s as u32, e as u32))
            })
            .collect())
    }

    /// Does the show have any mapping rows at all?
    pub async fn has_mapping(&self, tvdb_id: u32) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM xem_num WHERE tvdb_id = ?1 LIMIT 1")
            .bind(tvdb_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Replace a show's mapping with a freshly fetched one and stamp the
    /// refresh time. Runs in one transaction so a fetch that parsed into
    /// nothing still leaves the old rows intact only if the caller skips
    /// this call entirely.
    pub async fn replace_show(&self, tvdb_id: u32, entries: &[XemEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM xem_num WHERE tvdb_id = ?1")
            .bind(tvdb_id as i64)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO xem_num
                    (tvdb_id, tvdb_season, tvdb_episode, scene_season, scene_episode)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(tvdb_id as i64)
            .bind(entry.tvdb_season as i64)
            .bind(entry.tvdb_episode as i64)
            .bind(entry.scene_season as i64)
            .bind(entry.scene_episode as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO xem_refresh (tvdb_id, last_refreshed)
            VALUES (?1, ?2)
            ON CONFLICT (tvdb_id) DO UPDATE SET last_refreshed = ?2
            "#,
        )
        .bind(tvdb_id as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Unix time of the last refresh for a show, if it ever ran.
    pub async fn last_refreshed(&self, tvdb_id: u32) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT last_refreshed FROM xem_refresh WHERE tvdb_id = ?1")
            .bind(tvdb_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.try_get::<i64, _>("last_refreshed").ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn mapping_round_trip_and_ordering() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.numbering();

        assert!(!repo.has_mapping(79604).await.unwrap());
        assert_eq!(repo.to_tvdb(79604, 5, 3).await.unwrap(), vec![]);

        // One scene episode covering two tvdb episodes.
        repo.replace_show(
            79604,
            &[
                XemEntry {
                    tvdb_season: 5,
                    tvdb_episode: 4,
                    scene_season: 5,
                    scene_episode: 3,
                },
                XemEntry {
                    tvdb_season: 5,
                    tvdb_episode: 3,
                    scene_season: 5,
                    scene_episode: 3,
                },
            ],
        )
        .await
        .unwrap();

        assert!(repo.has_mapping(79604).await.unwrap());
        assert_eq!(
            repo.to_tvdb(79604, 5, 3).await.unwrap(),
            vec![(5, 3), (5, 4)]
        );
        assert_eq!(repo.to_scene(79604, 5, 4).await.unwrap(), vec![(5, 3)]);
        assert!(repo.last_refreshed(79604).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replace_drops_stale_rows() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.numbering();

        let first = XemEntry {
            tvdb_season: 1,
            tvdb_episode: 1,
            scene_season: 1,
            scene_episode: 1,
        };
        repo.replace_show(100, &[first]).await.unwrap();

        let second = XemEntry {
            tvdb_season: 1,
            tvdb_episode: 2,
            scene_season: 1,
            scene_episode: 1,
        };
        repo.replace_show(100, &[second]).await.unwrap();

        assert_eq!(repo.to_tvdb(100, 1, 1).await.unwrap(), vec![(1, 2)]);
    }
}
