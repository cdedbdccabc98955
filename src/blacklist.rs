//! Do-not-retry keys for releases that failed or produced unusable media.
//!
//! Keys are plain strings: source urls or torrent info-hashes. Entries age
//! out; an absent `max_age` treats an entry as permanent.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

/// Default entry lifetime: one week.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Blacklist {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    clock: Clock,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blacklist {
    pub fn new() -> Self {
        Self::with_clock(Box::new(Utc::now))
    }

    /// Construct with a custom time source. Tests use this to simulate
    /// entry aging without sleeping.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Record `key` as blacklisted from now.
    pub fn add(&self, key: &str) {
        debug!(key = %key, "blacklisting");
        self.entries.write().insert(key.to_string(), self.now());
    }

    /// Is `key` blacklisted? `max_age = None` means entries never expire.
    pub fn is_blacklisted(&self, key: &str, max_age: Option<Duration>) -> bool {
        let entries = self.entries.read();
        let Some(recorded_at) = entries.get(key) else {
            return false;
        };
        match max_age {
            None => true,
            Some(max_age) => {
                let age = self.now().signed_duration_since(*recorded_at);
                age.num_seconds() <= max_age.as_secs() as i64
            }
        }
    }

    /// Is `key` blacklisted under the default one-week lifetime?
    pub fn contains(&self, key: &str) -> bool {
        self.is_blacklisted(key, Some(DEFAULT_MAX_AGE))
    }

    /// Drop entries older than `max_age`.
    pub fn expire_old_records(&self, max_age: Duration) {
        let cutoff = self.now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, recorded_at| *recorded_at >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed = removed, "expired blacklist entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn fixed_clock() -> (Arc<Mutex<DateTime<Utc>>>, Clock) {
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        (now, Box::new(move || *clock_now.lock()))
    }

    #[test]
    fn unknown_key_is_not_blacklisted() {
        let bl = Blacklist::new();
        assert!(!bl.contains("magnet:?xt=urn:btih:abc"));
    }

    #[test]
    fn entry_expires_after_max_age() {
        let (now, clock) = fixed_clock();
        let bl = Blacklist::with_clock(clock);

        bl.add("http://example.com/a.torrent");
        assert!(bl.is_blacklisted(
            "http://example.com/a.torrent",
            Some(Duration::from_secs(1))
        ));

        *now.lock() += chrono::Duration::seconds(2);
        assert!(!bl.is_blacklisted(
            "http://example.com/a.torrent",
            Some(Duration::from_secs(1))
        ));
    }

    #[test]
    fn permanent_when_no_max_age() {
        let (now, clock) = fixed_clock();
        let bl = Blacklist::with_clock(clock);

        bl.add("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef");
        *now.lock() += chrono::Duration::days(365);
        assert!(bl.is_blacklisted("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef", None));
        assert!(!bl.contains("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef"));
    }

    #[test]
    fn expiry_garbage_collects() {
        let (now, clock) = fixed_clock();
        let bl = Blacklist::with_clock(clock);

        bl.add("old");
        *now.lock() += chrono::Duration::days(8);
        bl.add("fresh");

        bl.expire_old_records(DEFAULT_MAX_AGE);
        assert_eq!(bl.len(), 1);
        assert!(bl.contains("fresh"));
        assert!(!bl.is_blacklisted("old", None));
    }
}
