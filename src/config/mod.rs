//! Application configuration management

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
///
/// These are the process-level knobs. Settings a user can flip at runtime
/// (per-show follow/quality, feeder and backend enable flags) live in the
/// settings table instead and take effect on `SETTINGS_CHANGED`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Loopback port for the RPC surface
    pub rpc_port: u16,

    /// SQLite database path
    pub database_path: String,

    /// Directory for runtime state (backend snapshots)
    pub state_dir: PathBuf,

    /// Directory download engines write into
    pub downloads_path: String,

    /// Root directory for shows that are not in the library yet
    pub new_show_path: String,

    /// Session directory for the native torrent engine (DHT, resume data)
    pub session_path: String,

    /// Media library JSON-RPC endpoint (None = headless, no library)
    pub library_url: Option<String>,

    /// Remote metadata API base url
    pub metadata_base_url: String,

    /// Scene/native numbering map base url
    pub xem_base_url: String,

    /// Scene-name exception list url (None = exception refresh disabled)
    pub exceptions_url: Option<String>,

    /// Transmission RPC url (None = Transmission backend unavailable)
    pub transmission_url: Option<String>,
    pub transmission_user: Option<String>,
    pub transmission_password: Option<String>,

    /// Feed aggregation pass interval/delay (seconds)
    pub feed_poll_interval_secs: u64,
    pub feed_poll_initial_delay_secs: u64,

    /// Housekeeper interval/delay (seconds)
    pub housekeeper_interval_secs: u64,
    pub housekeeper_initial_delay_secs: u64,

    /// Backlog search interval/delay (seconds)
    pub backlog_interval_secs: u64,
    pub backlog_initial_delay_secs: u64,

    /// Emit logs as JSON
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let state_dir = env::var("STATE_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("showrunner"))
                .unwrap_or_else(|| PathBuf::from("./data"))
        });

        let database_path = env::var("DATABASE_PATH")
            .unwrap_or_else(|_| state_dir.join("showrunner.db").to_string_lossy().into_owned());

        Ok(Self {
            rpc_port: env::var("RPC_PORT")
                .unwrap_or_else(|_| "28574".to_string())
                .parse()
                .context("Invalid RPC_PORT")?,

            database_path,

            downloads_path: env::var("DOWNLOADS_PATH")
                .unwrap_or_else(|_| "./data/downloads".to_string()),

            new_show_path: env::var("NEW_SHOW_PATH").unwrap_or_else(|_| "./data/tv".to_string()),

            session_path: env::var("SESSION_PATH").unwrap_or_else(|_| "./data/session".to_string()),

            library_url: env::var("LIBRARY_URL").ok(),

            metadata_base_url: env::var("METADATA_BASE_URL")
                .unwrap_or_else(|_| "https://api.tvmaze.com".to_string()),

            xem_base_url: env::var("XEM_BASE_URL")
                .unwrap_or_else(|_| "http://thexem.info".to_string()),

            exceptions_url: env::var("EXCEPTIONS_URL").ok(),

            transmission_url: env::var("TRANSMISSION_URL").ok(),
            transmission_user: env::var("TRANSMISSION_USER").ok(),
            transmission_password: env::var("TRANSMISSION_PASSWORD").ok(),

            feed_poll_interval_secs: env_u64("FEED_POLL_INTERVAL_SECS", 180),
            feed_poll_initial_delay_secs: env_u64("FEED_POLL_INITIAL_DELAY_SECS", 20),

            housekeeper_interval_secs: env_u64("HOUSEKEEPER_INTERVAL_SECS", 5000),
            housekeeper_initial_delay_secs: env_u64("HOUSEKEEPER_INITIAL_DELAY_SECS", 1000),

            backlog_interval_secs: env_u64("BACKLOG_INTERVAL_SECS", 16 * 60 * 60),
            backlog_initial_delay_secs: env_u64("BACKLOG_INITIAL_DELAY_SECS", 600),

            log_json: env::var("LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            state_dir,
        })
    }

    /// A config rooted entirely under `root`, for tests and scratch runs.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            rpc_port: 0,
            database_path: root.join("showrunner.db").to_string_lossy().into_owned(),
            state_dir: root.join("state"),
            downloads_path: root.join("downloads").to_string_lossy().into_owned(),
            new_show_path: root.join("tv").to_string_lossy().into_owned(),
            session_path: root.join("session").to_string_lossy().into_owned(),
            library_url: None,
            metadata_base_url: "https://api.tvmaze.com".to_string(),
            xem_base_url: "http://thexem.info".to_string(),
            exceptions_url: None,
            transmission_url: None,
            transmission_user: None,
            transmission_password: None,
            feed_poll_interval_secs: 180,
            feed_poll_initial_delay_secs: 20,
            housekeeper_interval_secs: 5000,
            housekeeper_initial_delay_secs: 1000,
            backlog_interval_secs: 16 * 60 * 60,
            backlog_initial_delay_secs: 600,
            log_json: false,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
