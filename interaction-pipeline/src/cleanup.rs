use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use interaction_common::kv::ProfileCache;
use interaction_common::storage::{InteractionStore, StorageError};
use tracing::{debug, error, info, warn};

// Lets the dispatcher trigger a sweep without knowing what is being swept.
#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self);
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub users_scanned: u64,
    pub users_skipped: u64,
    pub records_deleted: u64,
}

/// Deletes interaction records older than each user's retention interval.
pub struct RetentionCleaner {
    store: InteractionStore,
    profiles: ProfileCache,
    default_retention_secs: i64,
    profile_fallback: bool,
}

impl RetentionCleaner {
    pub fn new(
        store: InteractionStore,
        profiles: ProfileCache,
        default_retention_secs: i64,
        profile_fallback: bool,
    ) -> Self {
        Self {
            store,
            profiles,
            default_retention_secs,
            profile_fallback,
        }
    }

    /// Run one sweep as if the current time was `now`.
    /// Users whose profile is not cached are skipped, unless the users table fallback is enabled.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupSummary, StorageError> {
        let mut session = self.store.session().await?;
        let mut summary = CleanupSummary::default();

        for user_id in session.user_ids().await? {
            summary.users_scanned += 1;

            let retention = match self.profiles.get(user_id).await {
                Ok(Some(profile)) => Some(profile.retention_interval_secs),
                Ok(None) if self.profile_fallback => session.user_retention(user_id).await?,
                Ok(None) => None,
                Err(error) => {
                    warn!(user_id, "failed to read cached user profile: {}", error);
                    None
                }
            };

            let Some(retention) = retention else {
                debug!(user_id, "no cached profile, skipping retention cleanup");
                summary.users_skipped += 1;
                continue;
            };

            let retention = if retention > 0 {
                retention
            } else {
                self.default_retention_secs
            };

            let Some(cutoff) = retention_cutoff(now, retention) else {
                warn!(user_id, retention, "retention interval out of range, skipping");
                summary.users_skipped += 1;
                continue;
            };

            summary.records_deleted += session.delete_expired(user_id, cutoff).await?;
        }

        Ok(summary)
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention_secs: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(retention_secs).and_then(|retention| now.checked_sub_signed(retention))
}

#[async_trait]
impl Cleaner for RetentionCleaner {
    async fn cleanup(&self) {
        match self.cleanup_at(Utc::now()).await {
            Ok(summary) => {
                metrics::counter!("retention_cleanup_runs_total", "outcome" => "success")
                    .increment(1);
                metrics::counter!("retention_records_deleted_total")
                    .increment(summary.records_deleted);
                metrics::counter!("retention_users_skipped_total")
                    .increment(summary.users_skipped);

                info!(
                    users_scanned = summary.users_scanned,
                    users_skipped = summary.users_skipped,
                    records_deleted = summary.records_deleted,
                    "retention cleanup finished"
                );
            }
            Err(error) => {
                metrics::counter!("retention_cleanup_runs_total", "outcome" => "error")
                    .increment(1);
                error!("retention cleanup failed: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use interaction_common::event::{DnsInteraction, InteractionRecord};
    use interaction_common::kv::{KeyValueStore, MemoryStore, UserProfile};
    use interaction_common::storage::Backend;

    async fn sqlite_store(dir: &tempfile::TempDir) -> InteractionStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("cleanup.db").display());
        let store = InteractionStore::connect(Backend::Sqlite, &url, 4)
            .await
            .expect("failed to open sqlite database");
        store.migrate().await.expect("failed to create schema");
        store
    }

    fn profiles() -> ProfileCache {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        ProfileCache::new(store)
    }

    fn dns(user_id: i64, domain: &str, created_at: DateTime<Utc>) -> InteractionRecord {
        InteractionRecord::Dns(DnsInteraction {
            user_id,
            domain: domain.to_owned(),
            ip: "192.0.2.10".to_owned(),
            created_at,
            callback: None,
        })
    }

    fn at(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, hour, min, sec).unwrap()
    }

    async fn remaining(store: &InteractionStore, user_id: i64) -> Vec<String> {
        let mut session = store.session().await.unwrap();
        session
            .dns_interactions(user_id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.domain)
            .collect()
    }

    #[tokio::test]
    async fn test_deletes_only_records_older_than_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let profiles = profiles();
        {
            let mut session = store.session().await.unwrap();
            session.insert_user(&UserProfile::new(1)).await.unwrap();
            session
                .insert(&dns(1, "expired.oob.test", at(9, 59, 59)))
                .await
                .unwrap();
            session
                .insert(&dns(1, "kept.oob.test", at(10, 0, 1)))
                .await
                .unwrap();
        }
        profiles.put(&UserProfile::new(1)).await.unwrap();
        let cleaner = RetentionCleaner::new(store.clone(), profiles, 7200, false);

        let summary = cleaner.cleanup_at(at(12, 0, 0)).await.unwrap();

        assert_eq!(
            summary,
            CleanupSummary {
                users_scanned: 1,
                users_skipped: 0,
                records_deleted: 1,
            }
        );
        assert_eq!(remaining(&store, 1).await, vec!["kept.oob.test"]);
    }

    #[tokio::test]
    async fn test_cache_miss_skips_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        {
            let mut session = store.session().await.unwrap();
            session
                .insert_user(&UserProfile::new(2).with_retention_interval(60))
                .await
                .unwrap();
            session
                .insert(&dns(2, "old.oob.test", at(1, 0, 0)))
                .await
                .unwrap();
        }
        let cleaner = RetentionCleaner::new(store.clone(), profiles(), 7200, false);

        let summary = cleaner.cleanup_at(at(12, 0, 0)).await.unwrap();

        assert_eq!(summary.users_scanned, 1);
        assert_eq!(summary.users_skipped, 1);
        assert_eq!(summary.records_deleted, 0);
        assert_eq!(remaining(&store, 2).await, vec!["old.oob.test"]);
    }

    #[tokio::test]
    async fn test_fallback_reads_users_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        {
            let mut session = store.session().await.unwrap();
            session
                .insert_user(&UserProfile::new(2).with_retention_interval(60))
                .await
                .unwrap();
            session
                .insert(&dns(2, "old.oob.test", at(11, 58, 0)))
                .await
                .unwrap();
            session
                .insert(&dns(2, "new.oob.test", at(11, 59, 30)))
                .await
                .unwrap();
        }
        let cleaner = RetentionCleaner::new(store.clone(), profiles(), 7200, true);

        let summary = cleaner.cleanup_at(at(12, 0, 0)).await.unwrap();

        assert_eq!(summary.users_skipped, 0);
        assert_eq!(summary.records_deleted, 1);
        assert_eq!(remaining(&store, 2).await, vec!["new.oob.test"]);
    }

    #[tokio::test]
    async fn test_non_positive_retention_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let profiles = profiles();
        {
            let mut session = store.session().await.unwrap();
            session.insert_user(&UserProfile::new(3)).await.unwrap();
            session
                .insert(&dns(3, "two-hours.oob.test", at(9, 0, 0)))
                .await
                .unwrap();
            session
                .insert(&dns(3, "recent.oob.test", at(11, 0, 0)))
                .await
                .unwrap();
        }
        profiles
            .put(&UserProfile::new(3).with_retention_interval(0))
            .await
            .unwrap();
        let cleaner = RetentionCleaner::new(store.clone(), profiles, 7200, false);

        let summary = cleaner.cleanup_at(at(12, 0, 0)).await.unwrap();

        assert_eq!(summary.records_deleted, 1);
        assert_eq!(remaining(&store, 3).await, vec!["recent.oob.test"]);
    }

    #[tokio::test]
    async fn test_large_user_id_and_real_dates() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let profiles = profiles();
        let user_id = 3_000_000_000;
        {
            let mut session = store.session().await.unwrap();
            session.insert_user(&UserProfile::new(user_id)).await.unwrap();
            session
                .insert(&dns(
                    user_id,
                    "january.oob.test",
                    Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap(),
                ))
                .await
                .unwrap();
            session
                .insert(&dns(
                    user_id,
                    "june.oob.test",
                    Utc.with_ymd_and_hms(2024, 6, 1, 11, 30, 0).unwrap(),
                ))
                .await
                .unwrap();
        }
        profiles.put(&UserProfile::new(user_id)).await.unwrap();
        let cleaner = RetentionCleaner::new(store.clone(), profiles, 7200, false);

        let summary = cleaner
            .cleanup_at(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
            .await
            .unwrap();

        assert_eq!(summary.users_scanned, 1);
        assert_eq!(summary.users_skipped, 0);
        assert_eq!(summary.records_deleted, 1);
        assert_eq!(remaining(&store, user_id).await, vec!["june.oob.test"]);
    }

    #[test]
    fn test_retention_cutoff() {
        assert_eq!(retention_cutoff(at(12, 0, 0), 7200), Some(at(10, 0, 0)));
        assert_eq!(retention_cutoff(at(12, 0, 0), i64::MAX), None);
    }
}
