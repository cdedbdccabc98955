//! Top-level recurring jobs: feed polling, housekeeping, backlog search.

pub mod backlog;
pub mod housekeeper;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::feeds::aggregate::FeedAggregator;
use crate::schedule::RecurringTaskRunner;
use backlog::BacklogSearcher;
use housekeeper::Housekeeper;

/// Handles to the three top-level runners.
pub struct Jobs {
    runners: Vec<RecurringTaskRunner>,
}

pub fn start(
    config: &Config,
    aggregator: Arc<FeedAggregator>,
    housekeeper: Arc<Housekeeper>,
    backlog: Arc<BacklogSearcher>,
) -> Jobs {
    let feed = RecurringTaskRunner::start(
        "feed-poll",
        Duration::from_secs(config.feed_poll_interval_secs),
        Duration::from_secs(config.feed_poll_initial_delay_secs),
        move || {
            let aggregator = aggregator.clone();
            async move { aggregator.poll_once().await }
        },
    );
    let house = RecurringTaskRunner::start(
        "housekeeper",
        Duration::from_secs(config.housekeeper_interval_secs),
        Duration::from_secs(config.housekeeper_initial_delay_secs),
        move || {
            let housekeeper = housekeeper.clone();
            async move { housekeeper.run_once().await }
        },
    );
    let backlog_runner = RecurringTaskRunner::start(
        "backlog",
        Duration::from_secs(config.backlog_interval_secs),
        Duration::from_secs(config.backlog_initial_delay_secs),
        move || {
            let backlog = backlog.clone();
            async move { backlog.run_once().await }
        },
    );

    info!("background jobs started");
    Jobs {
        runners: vec![feed, house, backlog_runner],
    }
}

impl Jobs {
    /// Cancel every runner and wait (bounded) for them to wind down.
    pub async fn shutdown(self) {
        for runner in self.runners {
            runner.shutdown().await;
        }
    }
}
