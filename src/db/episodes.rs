//! Cached episode listings, refreshed from the metadata provider.
//!
//! The cache keeps one row per known episode of a followed show plus a
//! per-show refresh stamp so the housekeeper can pick the stalest shows
//! to re-fetch first.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

/// One cached episode of a show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeRow {
    pub tvdb_id: u32,
    pub season: u32,
    pub episode: u32,
    pub name: Option<String>,
    pub first_aired: Option<NaiveDate>,
}

impl FromRow<'_, SqliteRow> for EpisodeRow {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let aired: Option<String> = row.try_get("first_aired")?;
        Ok(Self {
            tvdb_id: row.try_get::<i64, _>("tvdb_id")? as u32,
            season: row.try_get::<i64, _>("season")? as u32,
            episode: row.try_get::<i64, _>("episode")? as u32,
            name: row.try_get("name")?,
            first_aired: aired.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        })
    }
}

/// Repository for the episode cache and its refresh stamps.
#[derive(Clone)]
pub struct EpisodeCacheRepository {
    pool: SqlitePool,
}

impl EpisodeCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replaces the cached listing for one show and stamps it refreshed.
    ///
    /// Runs in a transaction so a failed fetch never leaves a show
    /// half-replaced.
    pub async fn replace_show(
        &self,
        tvdb_id: u32,
        episodes: &[EpisodeRow],
        show_status: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM episode WHERE tvdb_id = ?1")
            .bind(tvdb_id as i64)
            .execute(&mut *tx)
            .await?;

        for ep in episodes {
            sqlx::query(
                "INSERT INTO episode (tvdb_id, season, episode, name, first_aired)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (tvdb_id, season, episode) DO UPDATE SET
                   name = excluded.name,
                   first_aired = excluded.first_aired",
            )
            .bind(tvdb_id as i64)
            .bind(ep.season as i64)
            .bind(ep.episode as i64)
            .bind(&ep.name)
            .bind(ep.first_aired.map(|d| d.format("%Y-%m-%d").to_string()))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO episode_refresh (tvdb_id, last_refreshed, show_status)
             VALUES (?1, strftime('%s', 'now'), ?2)
             ON CONFLICT (tvdb_id) DO UPDATE SET
               last_refreshed = strftime('%s', 'now'),
               show_status = excluded.show_status",
        )
        .bind(tvdb_id as i64)
        .bind(show_status)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Title of one episode, if cached.
    pub async fn episode_name(
        &self,
        tvdb_id: u32,
        season: u32,
        episode: u32,
    ) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT name FROM episode WHERE tvdb_id = ?1 AND season = ?2 AND episode = ?3",
        )
        .bind(tvdb_id as i64)
        .bind(season as i64)
        .bind(episode as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(name,)| name))
    }

    /// Distinct season numbers of a show, ascending.
    pub async fn seasons(&self, tvdb_id: u32) -> Result<Vec<u32>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT season FROM episode WHERE tvdb_id = ?1 ORDER BY season",
        )
        .bind(tvdb_id as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s as u32).collect())
    }

    /// Episodes of one season, ascending by episode number.
    pub async fn episodes_in_season(&self, tvdb_id: u32, season: u32) -> Result<Vec<EpisodeRow>> {
        let rows = sqlx::query_as::<_, EpisodeRow>(
            "SELECT tvdb_id, season, episode, name, first_aired
             FROM episode WHERE tvdb_id = ?1 AND season = ?2 ORDER BY episode",
        )
        .bind(tvdb_id as i64)
        .bind(season as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every cached episode of a show, season then episode order.
    pub async fn all_episodes(&self, tvdb_id: u32) -> Result<Vec<EpisodeRow>> {
        let rows = sqlx::query_as::<_, EpisodeRow>(
            "SELECT tvdb_id, season, episode, name, first_aired
             FROM episode WHERE tvdb_id = ?1 ORDER BY season, episode",
        )
        .bind(tvdb_id as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All cached episodes first airing on the given date, any show.
    pub async fn episodes_on_date(&self, date: NaiveDate) -> Result<Vec<EpisodeRow>> {
        let rows = sqlx::query_as::<_, EpisodeRow>(
            "SELECT tvdb_id, season, episode, name, first_aired
             FROM episode WHERE first_aired = ?1 ORDER BY tvdb_id, season, episode",
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Refresh stamp and recorded show status, if the show was ever cached.
    pub async fn last_refreshed(&self, tvdb_id: u32) -> Result<Option<(i64, Option<String>)>> {
        let row: Option<(i64, Option<String>)> = sqlx::query_as(
            "SELECT last_refreshed, show_status FROM episode_refresh WHERE tvdb_id = ?1",
        )
        .bind(tvdb_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Shows whose cache is older than the cutoff for their status.
    ///
    /// Continuing shows (status `Continuing` or unknown) go stale after
    /// `continuing_cutoff`; ended shows after `ended_cutoff`. Stalest
    /// first, so a bounded refresh batch always drains the oldest.
    pub async fn refresh_needed_shows(
        &self,
        followed: &[u32],
        continuing_cutoff: i64,
        ended_cutoff: i64,
    ) -> Result<Vec<u32>> {
        let mut stale: Vec<(i64, u32)> = Vec::new();
        for &tvdb_id in followed {
            match self.last_refreshed(tvdb_id).await? {
                None => stale.push((0, tvdb_id)),
                Some((stamp, status)) => {
                    let continuing = match status.as_deref() {
                        Some("Running") | Some("Continuing") | Some("In Development") | None => {
                            true
                        }
                        _ => false,
                    };
                    let cutoff = if continuing {
                        continuing_cutoff
                    } else {
                        ended_cutoff
                    };
                    if stamp < cutoff {
                        stale.push((stamp, tvdb_id));
                    }
                }
            }
        }
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn ep(tvdb_id: u32, season: u32, episode: u32, name: &str, aired: &str) -> EpisodeRow {
        EpisodeRow {
            tvdb_id,
            season,
            episode,
            name: Some(name.to_string()),
            first_aired: NaiveDate::parse_from_str(aired, "%Y-%m-%d").ok(),
        }
    }

    #[tokio::test]
    async fn replace_and_query() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.episodes();

        repo.replace_show(
            82066,
            &[
                ep(82066, 1, 1, "Pilot", "2008-09-25"),
                ep(82066, 1, 2, "The Big One", "2008-10-02"),
                ep(82066, 2, 1, "Fresh Start", "2009-09-24"),
            ],
            Some("Continuing"),
        )
        .await
        .unwrap();

        assert_eq!(repo.seasons(82066).await.unwrap(), vec![1, 2]);
        assert_eq!(
            repo.episode_name(82066, 1, 2).await.unwrap(),
            Some("The Big One".to_string())
        );
        assert_eq!(repo.episodes_in_season(82066, 1).await.unwrap().len(), 2);
        assert_eq!(repo.all_episodes(82066).await.unwrap().len(), 3);

        let on_date = repo
            .episodes_on_date(NaiveDate::from_ymd_opt(2008, 10, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(on_date.len(), 1);
        assert_eq!(on_date[0].episode, 2);
    }

    #[tokio::test]
    async fn replace_is_full_replacement() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.episodes();

        repo.replace_show(100, &[ep(100, 1, 1, "A", "2020-01-01")], None)
            .await
            .unwrap();
        repo.replace_show(100, &[ep(100, 1, 2, "B", "2020-01-08")], None)
            .await
            .unwrap();

        let all = repo.all_episodes(100).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].episode, 2);
    }

    #[tokio::test]
    async fn refresh_stamp_recorded() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.episodes();

        assert!(repo.last_refreshed(55).await.unwrap().is_none());
        repo.replace_show(55, &[], Some("Ended")).await.unwrap();
        let (stamp, status) = repo.last_refreshed(55).await.unwrap().unwrap();
        assert!(stamp > 0);
        assert_eq!(status.as_deref(), Some("Ended"));
    }

    #[tokio::test]
    async fn stale_shows_sorted_oldest_first() {
        let db = Database::connect_memory().await.unwrap();
        let repo = db.episodes();

        repo.replace_show(1, &[], Some("Continuing")).await.unwrap();
        repo.replace_show(2, &[], Some("Ended")).await.unwrap();

        // Cutoffs in the future make every refreshed show stale; show 3
        // was never refreshed and must sort first.
        let now = chrono::Utc::now().timestamp();
        let stale = repo
            .refresh_needed_shows(&[1, 2, 3], now + 1000, now + 1000)
            .await
            .unwrap();
        assert_eq!(stale[0], 3);
        assert_eq!(stale.len(), 3);

        // Cutoffs in the past: only the never-refreshed show is stale.
        let stale = repo
            .refresh_needed_shows(&[1, 2, 3], now - 1000, now - 1000)
            .await
            .unwrap();
        assert_eq!(stale, vec![3]);
    }
}
