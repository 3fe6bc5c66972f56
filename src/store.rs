use crate::models::{
    AchievementRecord, Challenge, ContributionRecord, UserAccount, WasteBreakdown, WasteCategory,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Result of a conditional find-and-modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The precondition held and the mutation was applied.
    Applied,
    /// The record exists but the precondition did not hold (e.g. already
    /// joined); nothing was changed.
    NoMatch,
    /// No record with that id.
    NotFound,
}

/// Persistence collaborator. Every method is a single atomic step: the
/// backing engine is only assumed to provide "atomic find-and-modify by
/// filter", so conditional updates (join/leave, unlock) check their
/// precondition and mutate in the same operation. Two concurrent calls for
/// the same record are serialized by the store; exactly one observes
/// `Applied`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn user(&self, id: &str) -> Result<Option<UserAccount>>;
    async fn all_users(&self) -> Result<Vec<UserAccount>>;
    async fn insert_user(&self, user: UserAccount) -> Result<()>;

    async fn challenge(&self, id: &str) -> Result<Option<Challenge>>;
    async fn insert_challenge(&self, challenge: Challenge) -> Result<()>;

    /// Add `challenge_id` to the user's joined set and bump the joined
    /// count, only if not already present.
    async fn join_challenge(&self, user_id: &str, challenge_id: &str) -> Result<UpdateOutcome>;
    /// Symmetric conditional removal.
    async fn leave_challenge(&self, user_id: &str, challenge_id: &str) -> Result<UpdateOutcome>;

    async fn bump_volunteers(&self, challenge_id: &str, delta: i64) -> Result<UpdateOutcome>;
    /// Floor a negative volunteer total back to zero. No-op when already
    /// non-negative.
    async fn clamp_volunteers(&self, challenge_id: &str) -> Result<()>;

    /// Bump the user's item and cleanup counters for one accepted
    /// submission.
    async fn apply_user_stats(&self, user_id: &str, items: u64) -> Result<UpdateOutcome>;
    /// Bump a challenge's item total, and the per-category bucket when the
    /// label was recognized.
    async fn apply_challenge_stats(
        &self,
        challenge_id: &str,
        items: u64,
        category: Option<WasteCategory>,
    ) -> Result<UpdateOutcome>;
    /// Overwrite a challenge's aggregates wholesale (reconciliation only).
    async fn set_challenge_aggregates(
        &self,
        challenge_id: &str,
        total_items: u64,
        breakdown: WasteBreakdown,
    ) -> Result<UpdateOutcome>;
    async fn add_impact(&self, user_id: &str, points: u64) -> Result<UpdateOutcome>;

    async fn insert_contribution(&self, record: ContributionRecord) -> Result<()>;
    async fn contributions_for_user(&self, user_id: &str) -> Result<Vec<ContributionRecord>>;
    async fn contributions_for_challenge(
        &self,
        challenge_id: &str,
    ) -> Result<Vec<ContributionRecord>>;

    async fn achievements_for_user(&self, user_id: &str) -> Result<Vec<AchievementRecord>>;
    /// Returns false when a record for (user, kind) already exists, so a
    /// racing create can be treated as success by the caller.
    async fn insert_achievement(&self, record: AchievementRecord) -> Result<bool>;
    async fn set_achievement_progress(
        &self,
        user_id: &str,
        kind: &str,
        progress: u64,
    ) -> Result<()>;
    /// One-way false -> true transition; returns false if already unlocked
    /// (or missing), so the point award fires at most once.
    async fn unlock_achievement(
        &self,
        user_id: &str,
        kind: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserAccount>,
    challenges: HashMap<String, Challenge>,
    contributions: Vec<ContributionRecord>,
    achievements: HashMap<(String, String), AchievementRecord>,
}

/// In-process store. A single mutex over the maps makes every trait call
/// one serialized step, which is exactly the atomicity the trait promises.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user(&self, id: &str) -> Result<Option<UserAccount>> {
        Ok(self.inner.lock().await.users.get(id).cloned())
    }

    async fn all_users(&self) -> Result<Vec<UserAccount>> {
        Ok(self.inner.lock().await.users.values().cloned().collect())
    }

    async fn insert_user(&self, user: UserAccount) -> Result<()> {
        self.inner.lock().await.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn challenge(&self, id: &str) -> Result<Option<Challenge>> {
        Ok(self.inner.lock().await.challenges.get(id).cloned())
    }

    async fn insert_challenge(&self, challenge: Challenge) -> Result<()> {
        self.inner
            .lock()
            .await
            .challenges
            .insert(challenge.id.clone(), challenge);
        Ok(())
    }

    async fn join_challenge(&self, user_id: &str, challenge_id: &str) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(user_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if user.joined_challenges.iter().any(|c| c == challenge_id) {
            return Ok(UpdateOutcome::NoMatch);
        }
        user.joined_challenges.push(challenge_id.to_string());
        user.total_challenges_joined += 1;
        Ok(UpdateOutcome::Applied)
    }

    async fn leave_challenge(&self, user_id: &str, challenge_id: &str) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(user_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        let before = user.joined_challenges.len();
        user.joined_challenges.retain(|c| c != challenge_id);
        if user.joined_challenges.len() == before {
            return Ok(UpdateOutcome::NoMatch);
        }
        // Symmetric to join: the joined count tracks the set, not a
        // lifetime tally, so churn cannot inflate it.
        user.total_challenges_joined = user.total_challenges_joined.saturating_sub(1);
        Ok(UpdateOutcome::Applied)
    }

    async fn bump_volunteers(&self, challenge_id: &str, delta: i64) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(challenge) = inner.challenges.get_mut(challenge_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        challenge.total_volunteers += delta;
        Ok(UpdateOutcome::Applied)
    }

    async fn clamp_volunteers(&self, challenge_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(challenge) = inner.challenges.get_mut(challenge_id) {
            if challenge.total_volunteers < 0 {
                challenge.total_volunteers = 0;
            }
        }
        Ok(())
    }

    async fn apply_user_stats(&self, user_id: &str, items: u64) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(user_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        user.total_items_collected += items;
        user.total_cleanups += 1;
        Ok(UpdateOutcome::Applied)
    }

    async fn apply_challenge_stats(
        &self,
        challenge_id: &str,
        items: u64,
        category: Option<WasteCategory>,
    ) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(challenge) = inner.challenges.get_mut(challenge_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        challenge.total_items_collected += items;
        if let Some(category) = category {
            challenge.breakdown.add(category, items);
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn set_challenge_aggregates(
        &self,
        challenge_id: &str,
        total_items: u64,
        breakdown: WasteBreakdown,
    ) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(challenge) = inner.challenges.get_mut(challenge_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        challenge.total_items_collected = total_items;
        challenge.breakdown = breakdown;
        Ok(UpdateOutcome::Applied)
    }

    async fn add_impact(&self, user_id: &str, points: u64) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(user_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        user.impact_score += points;
        Ok(UpdateOutcome::Applied)
    }

    async fn insert_contribution(&self, record: ContributionRecord) -> Result<()> {
        self.inner.lock().await.contributions.push(record);
        Ok(())
    }

    async fn contributions_for_user(&self, user_id: &str) -> Result<Vec<ContributionRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .contributions
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn contributions_for_challenge(
        &self,
        challenge_id: &str,
    ) -> Result<Vec<ContributionRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .contributions
            .iter()
            .filter(|c| c.challenge_id == challenge_id)
            .cloned()
            .collect())
    }

    async fn achievements_for_user(&self, user_id: &str) -> Result<Vec<AchievementRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .achievements
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_achievement(&self, record: AchievementRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (record.user_id.clone(), record.kind.clone());
        if inner.achievements.contains_key(&key) {
            return Ok(false);
        }
        inner.achievements.insert(key, record);
        Ok(true)
    }

    async fn set_achievement_progress(
        &self,
        user_id: &str,
        kind: &str,
        progress: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(rec) = inner
            .achievements
            .get_mut(&(user_id.to_string(), kind.to_string()))
        {
            rec.progress = progress;
        }
        Ok(())
    }

    async fn unlock_achievement(
        &self,
        user_id: &str,
        kind: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(rec) = inner
            .achievements
            .get_mut(&(user_id.to_string(), kind.to_string()))
        else {
            return Ok(false);
        };
        if rec.unlocked {
            return Ok(false);
        }
        rec.unlocked = true;
        rec.unlocked_at = Some(now);
        rec.progress = rec.goal;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(id: &str) -> Challenge {
        Challenge {
            id: id.into(),
            title: "Riverbank".into(),
            location: None,
            province: None,
            starts_at: Utc::now(),
            ends_at: Utc::now(),
            total_items_collected: 0,
            total_volunteers: 0,
            breakdown: WasteBreakdown::default(),
        }
    }

    #[tokio::test]
    async fn join_is_conditional_on_absence() {
        let store = MemoryStore::new();
        store
            .insert_user(UserAccount::new("u1", "a@b.c", "Ana"))
            .await
            .unwrap();

        assert_eq!(
            store.join_challenge("u1", "c1").await.unwrap(),
            UpdateOutcome::Applied
        );
        assert_eq!(
            store.join_challenge("u1", "c1").await.unwrap(),
            UpdateOutcome::NoMatch
        );
        let user = store.user("u1").await.unwrap().unwrap();
        assert_eq!(user.total_challenges_joined, 1);
        assert_eq!(user.joined_challenges, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn leave_decrements_joined_count() {
        let store = MemoryStore::new();
        store
            .insert_user(UserAccount::new("u1", "a@b.c", "Ana"))
            .await
            .unwrap();

        for _ in 0..5 {
            assert_eq!(
                store.join_challenge("u1", "c1").await.unwrap(),
                UpdateOutcome::Applied
            );
            assert_eq!(
                store.leave_challenge("u1", "c1").await.unwrap(),
                UpdateOutcome::Applied
            );
        }
        let user = store.user("u1").await.unwrap().unwrap();
        assert_eq!(user.total_challenges_joined, 0);
        assert!(user.joined_challenges.is_empty());

        // Rejoining counts again, once.
        store.join_challenge("u1", "c1").await.unwrap();
        let user = store.user("u1").await.unwrap().unwrap();
        assert_eq!(user.total_challenges_joined, 1);
    }

    #[tokio::test]
    async fn leave_without_join_is_no_match() {
        let store = MemoryStore::new();
        store
            .insert_user(UserAccount::new("u1", "a@b.c", "Ana"))
            .await
            .unwrap();
        assert_eq!(
            store.leave_challenge("u1", "c1").await.unwrap(),
            UpdateOutcome::NoMatch
        );
        assert_eq!(
            store.leave_challenge("ghost", "c1").await.unwrap(),
            UpdateOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn clamp_floors_negative_volunteer_counts() {
        let store = MemoryStore::new();
        store.insert_challenge(challenge("c1")).await.unwrap();
        store.bump_volunteers("c1", -3).await.unwrap();
        store.clamp_volunteers("c1").await.unwrap();
        assert_eq!(
            store.challenge("c1").await.unwrap().unwrap().total_volunteers,
            0
        );
    }

    #[tokio::test]
    async fn achievement_insert_is_idempotent_and_unlock_fires_once() {
        let store = MemoryStore::new();
        let rec = AchievementRecord {
            user_id: "u1".into(),
            kind: "item_hunter".into(),
            progress: 0,
            goal: 100,
            unlocked: false,
            unlocked_at: None,
            points: 50,
        };
        assert!(store.insert_achievement(rec.clone()).await.unwrap());
        assert!(!store.insert_achievement(rec).await.unwrap());

        assert!(store
            .unlock_achievement("u1", "item_hunter", Utc::now())
            .await
            .unwrap());
        assert!(!store
            .unlock_achievement("u1", "item_hunter", Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unrecognized_label_skips_category_buckets() {
        let store = MemoryStore::new();
        store.insert_challenge(challenge("c1")).await.unwrap();
        store.apply_challenge_stats("c1", 4, None).await.unwrap();
        store
            .apply_challenge_stats("c1", 6, Some(WasteCategory::Plastic))
            .await
            .unwrap();
        let c = store.challenge("c1").await.unwrap().unwrap();
        assert_eq!(c.total_items_collected, 10);
        assert_eq!(c.breakdown.plastic, 6);
        assert_eq!(c.breakdown, {
            let mut b = WasteBreakdown::default();
            b.add(WasteCategory::Plastic, 6);
            b
        });
    }
}
