//! Runtime settings: JSON-typed key-value rows.
//!
//! Enable flags, feed urls and similar user-flippable knobs live here so a
//! SETTINGS_CHANGED event can take effect without a restart.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the raw JSON value for a key.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let text: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    /// Get a setting value as a specific type
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Get a setting value with a default
    pub async fn get_or_default<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T> {
        match self.get_value(key).await? {
            Some(v) => Ok(v),
            None => Ok(default),
        }
    }

    /// Set a setting value
    pub async fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_string(&serde_json::to_value(value)?)?;

        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?1, ?2, strftime('%s','now'))
            ON CONFLICT (key) DO UPDATE SET
                value = ?2,
                updated_at = strftime('%s','now')
            "#,
        )
        .bind(key)
        .bind(&json_value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a setting
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;

    #[tokio::test]
    async fn set_get_roundtrip_and_overwrite() {
        let db = Database::connect_memory().await.unwrap();
        let settings = db.settings();

        assert_eq!(settings.get_value::<bool>("missing").await.unwrap(), None);
        assert!(
            settings
                .get_or_default("missing", true)
                .await
                .unwrap()
        );

        settings.set("feeder_showrss_enabled", false).await.unwrap();
        assert_eq!(
            settings
                .get_value::<bool>("feeder_showrss_enabled")
                .await
                .unwrap(),
            Some(false)
        );

        settings.set("feeder_showrss_enabled", true).await.unwrap();
        assert_eq!(
            settings
                .get_value::<bool>("feeder_showrss_enabled")
                .await
                .unwrap(),
            Some(true)
        );

        settings
            .set("showrss_feed_url", "http://showrss.info/user/123.rss")
            .await
            .unwrap();
        assert_eq!(
            settings
                .get_value::<String>("showrss_feed_url")
                .await
                .unwrap()
                .as_deref(),
            Some("http://showrss.info/user/123.rss")
        );

        assert!(settings.delete("showrss_feed_url").await.unwrap());
        assert!(!settings.delete("showrss_feed_url").await.unwrap());
    }
}
