use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::storage::{Database, FeedSource};

/// Per-feed publication admission control.
///
/// Two gates, both against the persisted publication log so limits
/// survive restarts:
///
/// 1. Count: publications in the trailing hour must stay under
///    `max_news_per_hour`.
/// 2. Spacing: the effective interval is the smaller of the hourly slot
///    (60 / max_news_per_hour minutes) and the feed's cooldown, and that
///    much time must have passed since the last publication.
///
/// A feed configured with cooldown longer than its hourly slot is paced
/// by the slot, so its full hourly budget stays reachable.
pub struct RateLimiter {
    db: Database,
    feed_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            feed_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize check-then-record sequences for one feed.
    ///
    /// Callers hold the guard across `may_publish` and the subsequent
    /// publication record so concurrent items from the same feed cannot
    /// both pass the same gate.
    pub async fn lock_feed(&self, feed_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.feed_locks.lock().await;
            locks
                .entry(feed_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Whether a publication for this feed is admissible at `now`.
    pub async fn may_publish(&self, feed: &FeedSource, now: DateTime<Utc>) -> Result<bool> {
        if feed.max_news_per_hour <= 0 {
            tracing::debug!(feed_id = feed.id, "Feed has no publication budget");
            return Ok(false);
        }

        let recent = self
            .db
            .count_publications(feed.id, now - Duration::minutes(60))
            .await?;
        if recent >= feed.max_news_per_hour {
            tracing::debug!(
                feed_id = feed.id,
                recent = recent,
                max_per_hour = feed.max_news_per_hour,
                "Skipping publication: hourly budget spent"
            );
            return Ok(false);
        }

        let interval = effective_interval(feed.max_news_per_hour, feed.cooldown_minutes);
        if let Some(last) = self.db.last_publication_time(feed.id).await? {
            let elapsed = now - last;
            if elapsed < interval {
                tracing::debug!(
                    feed_id = feed.id,
                    elapsed_secs = elapsed.num_seconds(),
                    interval_secs = interval.num_seconds(),
                    "Skipping publication: inside effective interval"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// min(60 / max_news_per_hour minutes, cooldown_minutes).
fn effective_interval(max_news_per_hour: i64, cooldown_minutes: i64) -> Duration {
    let slot_secs = 3600.0 / max_news_per_hour as f64;
    let cooldown_secs = (cooldown_minutes * 60) as f64;
    Duration::seconds(slot_secs.min(cooldown_secs) as i64)
}
