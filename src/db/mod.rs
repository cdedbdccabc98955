//! Database connection and per-table repositories.

pub mod episodes;
pub mod history;
pub mod numbering;
pub mod scene_names;
pub mod settings;
pub mod show_settings;

use anyhow::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub use episodes::{EpisodeCacheRepository, EpisodeRow};
pub use history::{HistoryEntry, HistoryRepository, HistoryRow};
pub use numbering::{NumberingRepository, XemEntry};
pub use scene_names::{SceneNameRow, SceneNamesRepository};
pub use settings::SettingsRepository;
pub use show_settings::{ShowSettingsRepository, ShowSettingsRow};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `path`.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// An in-memory database, used by tests and scratch runs. Pinned to a
    /// single connection so every caller sees the same data.
    pub async fn connect_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }

    pub fn show_settings(&self) -> ShowSettingsRepository {
        ShowSettingsRepository::new(self.pool.clone())
    }

    pub fn episodes(&self) -> EpisodeCacheRepository {
        EpisodeCacheRepository::new(self.pool.clone())
    }

    pub fn history(&self) -> HistoryRepository {
        HistoryRepository::new(self.pool.clone())
    }

    pub fn scene_names(&self) -> SceneNamesRepository {
        SceneNamesRepository::new(self.pool.clone())
    }

    pub fn numbering(&self) -> NumberingRepository {
        NumberingRepository::new(self.pool.clone())
    }

    /// Create all tables if they do not exist yet. Safe to run on every
    /// startup.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS show_settings (
                tvdb_id INTEGER PRIMARY KEY,
                follow INTEGER NOT NULL DEFAULT 0,
                wanted_quality INTEGER NOT NULL DEFAULT 3
            )",
            "CREATE TABLE IF NOT EXISTS episode (
                tvdb_id INTEGER NOT NULL,
                season INTEGER NOT NULL,
                episode INTEGER NOT NULL,
                name TEXT,
                first_aired TEXT,
                PRIMARY KEY (tvdb_id, season, episode)
            )",
            "CREATE TABLE IF NOT EXISTS episode_refresh (
                tvdb_id INTEGER PRIMARY KEY,
                last_refreshed INTEGER NOT NULL,
                show_status TEXT
            )",
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                tvdb_id INTEGER,
                name TEXT,
                source TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                final_status TEXT,
                total_size INTEGER,
                quality INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_history_key ON history (key)",
            "CREATE TABLE IF NOT EXISTS history_episode (
                history_id INTEGER NOT NULL,
                tvdb_id INTEGER NOT NULL,
                season INTEGER NOT NULL,
                episode INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_history_episode
                ON history_episode (tvdb_id, season, episode)",
            "CREATE TABLE IF NOT EXISTS scene_names (
                exception_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tvdb_id INTEGER NOT NULL,
                show_name TEXT NOT NULL,
                simplified_name TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_scene_names_simplified
                ON scene_names (simplified_name)",
            "CREATE TABLE IF NOT EXISTS xem_num (
                tvdb_id INTEGER NOT NULL,
                tvdb_season INTEGER NOT NULL,
                tvdb_episode INTEGER NOT NULL,
                scene_season INTEGER NOT NULL,
                scene_episode INTEGER NOT NULL,
                PRIMARY KEY (tvdb_id, tvdb_season, tvdb_episode, scene_season, scene_episode)
            )",
            "CREATE TABLE IF NOT EXISTS xem_refresh (
                tvdb_id INTEGER PRIMARY KEY,
                last_refreshed INTEGER NOT NULL
            )",
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}
