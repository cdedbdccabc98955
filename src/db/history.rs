//! Download history log.
//!
//! One row per download attempt, keyed by the candidate's unique key
//! (info-hash when known). Rows are written when a download starts and
//! completed in place when it reaches a final status, so the log doubles
//! as the "have we tried this before" check used by the feed and backlog
//! passes.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::release::quality::Quality;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub id: i64,
    pub key: String,
    pub tvdb_id: Option<u32>,
    pub name: Option<String>,
    pub source: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_status: Option<String>,
    pub total_size: Option<u64>,
    pub quality: Quality,
    pub episodes: Vec<(u32, u32, u32)>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for HistoryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        let started: i64 = row.try_get("started_at")?;
        let finished: Option<i64> = row.try_get("finished_at")?;
        let quality: i64 = row.try_get("quality")?;
        Ok(Self {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            tvdb_id: row.try_get::<Option<i64>, _>("tvdb_id")?.map(|v| v as u32),
            name: row.try_get("name")?,
            source: row.try_get("source")?,
            started_at: Utc
                .timestamp_opt(started, 0)
                .single()
                .unwrap_or_else(Utc::now),
            finished_at: finished.and_then(|t| Utc.timestamp_opt(t, 0).single()),
            final_status: row.try_get("final_status")?,
            total_size: row.try_get::<Option<i64>, _>("total_size")?.map(|v| v as u64),
            quality: Quality(quality as u32),
            episodes: Vec::new(),
        })
    }
}

/// What a download attempt is recorded as when it starts.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub key: String,
    pub tvdb_id: Option<u32>,
    pub name: Option<String>,
    pub source: Option<String>,
    pub quality: Quality,
    pub episodes: Vec<(u32, u32, u32)>,
}

pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the start of a download attempt. Episode links are written
    /// alongside so per-episode lookups do not need to re-parse anything.
    pub async fn log_started(&self, entry: &HistoryEntry) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO history (key, tvdb_id, name, source, started_at, quality)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&entry.key)
        .bind(entry.tvdb_id.map(|v| v as i64))
        .bind(&entry.name)
        .bind(&entry.source)
        .bind(Utc::now().timestamp())
        .bind(entry.quality.0 as i64)
        .execute(&mut *tx)
        .await?;

        let history_id = result.last_insert_rowid();
        for (tvdb_id, season, episode) in &entry.episodes {
            sqlx::query(
                r#"
                INSERT INTO history_episode (history_id, tvdb_id, season, episode)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(history_id)
            .bind(*tvdb_id as i64)
            .bind(*season as i64)
            .bind(*episode as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(history_id)
    }

    /// Close out the most recent open row for `key` with its final status.
    pub async fn log_finished(
        &self,
        key: &str,
        final_status: &str,
        total_size: Option<u64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE history
            SET finished_at = ?2, final_status = ?3, total_size = ?4
            WHERE id = (
                SELECT id FROM history
                WHERE key = ?1 AND finished_at IS NULL
                ORDER BY started_at DESC LIMIT 1
            )
            "#,
        )
        .bind(key)
        .bind(Utc::now().timestamp())
        .bind(final_status)
        .bind(total_size.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Has this key ever been attempted?
    pub async fn is_in_history(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM history WHERE key = ?1 LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Has a download for this episode ever finished successfully?
    pub async fn episode_succeeded(
        &self,
        tvdb_id: u32,
        season: u32,
        episode: u32,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM history h
            JOIN history_episode he ON he.history_id = h.id
            WHERE he.tvdb_id = ?1 AND he.season = ?2 AND he.episode = ?3
              AND h.final_status = ?4
            LIMIT 1
            "#,
        )
        .bind(tvdb_id as i64)
        .bind(season as i64)
        .bind(episode as i64)
        .bind("finished")
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Most recent rows, newest first, with episode links attached.
    pub async fn recent(&self, limit: u32) -> Result<Vec<HistoryRow>> {
        let mut rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, key, tvdb_id, name, source, started_at,
                   finished_at, final_status, total_size, quality
            FROM history
            ORDER BY started_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in &mut rows {
            let links = sqlx::query(
                "SELECT tvdb_id, season, episode FROM history_episode WHERE history_id = ?1",
            )
            .bind(row.id)
            .fetch_all(&self.pool)
            .await?;
            row.episodes = links
                .into_iter()
                .filter_map(|l| {
                    let t: i64 = l.try_get("tvdb_id").ok()?;
                    let s: i64 = l.try_get("season").ok()?;
                    let e: i64 = l.try_get("episode").ok()?;
                    Some((t as u32, s as u32, e as u32))
                })
                .collect();
        }

        Ok(rows)
    }

    /// Delete rows (and their episode links) older than `max_age_days`.
    pub async fn prune(&self, max_age_days: u32) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - (max_age_days as i64) * 86_400;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM history_episode
            WHERE history_id IN (SELECT id FROM history WHERE started_at < ?1)
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM history WHERE started_at < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
