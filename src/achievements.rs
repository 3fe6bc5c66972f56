use crate::error::ApiError;
use crate::models::{AchievementRecord, UserAccount};
use crate::store::Store;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

const LEADERBOARD_SIZE: usize = 10;

/// Which live statistic drives a template's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSource {
    ChallengesJoined,
    ItemsCollected,
    ImpactScore,
    Cleanups,
    DistinctProvinces,
}

pub struct Template {
    pub kind: &'static str,
    pub title: &'static str,
    pub goal: u64,
    pub points: u64,
    pub source: ProgressSource,
}

/// Static catalog, compiled into the engine. Records for kinds no longer in
/// this list keep their last stored progress and are reported as-is.
pub static CATALOG: Lazy<Vec<Template>> = Lazy::new(|| {
    vec![
        Template {
            kind: "first_steps",
            title: "First Steps",
            goal: 1,
            points: 10,
            source: ProgressSource::ChallengesJoined,
        },
        Template {
            kind: "team_player",
            title: "Team Player",
            goal: 5,
            points: 50,
            source: ProgressSource::ChallengesJoined,
        },
        Template {
            kind: "item_hunter",
            title: "Item Hunter",
            goal: 100,
            points: 50,
            source: ProgressSource::ItemsCollected,
        },
        Template {
            kind: "century_collector",
            title: "Century Collector",
            goal: 500,
            points: 150,
            source: ProgressSource::ItemsCollected,
        },
        Template {
            kind: "impact_maker",
            title: "Impact Maker",
            goal: 250,
            points: 100,
            source: ProgressSource::ImpactScore,
        },
        Template {
            kind: "cleanup_regular",
            title: "Cleanup Regular",
            goal: 10,
            points: 75,
            source: ProgressSource::Cleanups,
        },
        Template {
            kind: "wanderer",
            title: "Wanderer",
            goal: 3,
            points: 60,
            source: ProgressSource::DistinctProvinces,
        },
    ]
});

/// Milestone ladder over total items collected. Purely informational; no
/// unlock or point side effects.
static MILESTONES: Lazy<Vec<u64>> = Lazy::new(|| vec![10, 50, 100, 250, 500, 1000]);

struct LiveStats {
    challenges_joined: u64,
    items_collected: u64,
    impact_score: u64,
    cleanups: u64,
    distinct_provinces: u64,
}

impl LiveStats {
    fn progress(&self, source: ProgressSource) -> u64 {
        match source {
            ProgressSource::ChallengesJoined => self.challenges_joined,
            ProgressSource::ItemsCollected => self.items_collected,
            ProgressSource::ImpactScore => self.impact_score,
            ProgressSource::Cleanups => self.cleanups,
            ProgressSource::DistinctProvinces => self.distinct_provinces,
        }
    }
}

async fn live_stats(store: &dyn Store, user: &UserAccount) -> anyhow::Result<LiveStats> {
    let mut provinces = HashSet::new();
    for challenge_id in &user.joined_challenges {
        if let Some(challenge) = store.challenge(challenge_id).await? {
            if let Some(province) = challenge.province {
                provinces.insert(province);
            }
        }
    }
    Ok(LiveStats {
        challenges_joined: user.total_challenges_joined,
        items_collected: user.total_items_collected,
        impact_score: user.impact_score,
        cleanups: user.total_cleanups,
        distinct_provinces: provinces.len() as u64,
    })
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AchievementView {
    pub kind: String,
    pub title: String,
    pub progress: u64,
    pub goal: u64,
    pub points: u64,
    pub unlocked: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
}

/// Evaluate the full catalog against a user's live statistics.
///
/// Stored progress is only a display cache: it is recomputed from the live
/// stats on every call, clamped to the goal. Reaching a goal transitions
/// `unlocked` exactly once and awards the template's points as a side effect
/// of that transition; repeated evaluation can never award twice because the
/// unlock itself is a conditional update.
pub async fn evaluate(store: &dyn Store, user_id: &str) -> Result<Vec<AchievementView>, ApiError> {
    let user = store
        .user(user_id)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    let stats = live_stats(store, &user).await?;

    // Lazily create a record per template. A racing create losing the
    // (user, kind) uniqueness check is fine: we re-read below either way.
    for template in CATALOG.iter() {
        let created = store
            .insert_achievement(AchievementRecord {
                user_id: user_id.to_string(),
                kind: template.kind.to_string(),
                progress: 0,
                goal: template.goal,
                unlocked: false,
                unlocked_at: None,
                points: template.points,
            })
            .await?;
        if created {
            info!("Created {} achievement record for {}", template.kind, user_id);
        }
    }

    let mut records: HashMap<String, AchievementRecord> = store
        .achievements_for_user(user_id)
        .await?
        .into_iter()
        .map(|r| (r.kind.clone(), r))
        .collect();

    let mut views = Vec::with_capacity(records.len());
    for template in CATALOG.iter() {
        let Some(record) = records.remove(template.kind) else {
            continue;
        };
        let current = stats.progress(template.source);
        let (progress, unlocked, unlocked_at) = if current >= template.goal && !record.unlocked {
            let now = Utc::now();
            if store.unlock_achievement(user_id, template.kind, now).await? {
                store.add_impact(user_id, template.points).await?;
                info!(
                    "User {} unlocked {} (+{} points)",
                    user_id, template.kind, template.points
                );
                (template.goal, true, Some(now))
            } else {
                // Lost the race to a concurrent evaluation; it awarded.
                (template.goal, true, record.unlocked_at)
            }
        } else if record.unlocked {
            (template.goal, true, record.unlocked_at)
        } else {
            let clamped = current.min(template.goal);
            store
                .set_achievement_progress(user_id, template.kind, clamped)
                .await?;
            (clamped, false, None)
        };
        views.push(AchievementView {
            kind: template.kind.to_string(),
            title: template.title.to_string(),
            progress,
            goal: template.goal,
            points: template.points,
            unlocked,
            unlocked_at,
        });
    }

    // Records whose template left the catalog: keep the stored progress
    // untouched and flag the data drift.
    for (kind, record) in records {
        warn!(
            "Achievement record {} for user {} has no catalog template",
            kind, user_id
        );
        views.push(AchievementView {
            title: kind.clone(),
            kind,
            progress: record.progress,
            goal: record.goal,
            points: record.points,
            unlocked: record.unlocked,
            unlocked_at: record.unlocked_at,
        });
    }
    Ok(views)
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub name: String,
    pub impact_score: u64,
    pub total_items_collected: u64,
}

/// Impact score descending, item total as tiebreak; rank is strictly
/// positional, so tied scores still get distinct ranks.
pub async fn leaderboard(store: &dyn Store, top_n: Option<usize>) -> Result<Vec<LeaderboardEntry>, ApiError> {
    let mut users = store.all_users().await?;
    users.sort_by(|a, b| {
        b.impact_score
            .cmp(&a.impact_score)
            .then(b.total_items_collected.cmp(&a.total_items_collected))
    });
    Ok(users
        .into_iter()
        .take(top_n.unwrap_or(LEADERBOARD_SIZE))
        .enumerate()
        .map(|(i, u)| LeaderboardEntry {
            rank: i + 1,
            user_id: u.id,
            name: u.name,
            impact_score: u.impact_score,
            total_items_collected: u.total_items_collected,
        })
        .collect())
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneProgress {
    pub items_collected: u64,
    pub completed: Vec<u64>,
    pub next_goal: Option<u64>,
    /// Percentage toward the nearest uncompleted milestone; 100 when the
    /// whole ladder is done.
    pub percent: f64,
}

pub async fn milestones(store: &dyn Store, user_id: &str) -> Result<MilestoneProgress, ApiError> {
    let user = store
        .user(user_id)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    let items = user.total_items_collected;
    let completed: Vec<u64> = MILESTONES.iter().copied().filter(|&m| items >= m).collect();
    let next_goal = MILESTONES.iter().copied().find(|&m| items < m);
    let percent = match next_goal {
        Some(goal) => ((items as f64 / goal as f64) * 100.0 * 100.0).round() / 100.0,
        None => 100.0,
    };
    Ok(MilestoneProgress {
        items_collected: items,
        completed,
        next_goal,
        percent,
    })
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AchievementStats {
    pub unlocked: usize,
    pub total: usize,
    pub impact_score: u64,
    pub formatted_points: String,
    /// Count of users with strictly greater impact, plus one. Tied users
    /// share displayed totals but not necessarily this rank; accepted.
    pub rank: usize,
}

/// Values >= 1000 compress to a "12.3k"-style string.
pub fn format_points(points: u64) -> String {
    if points >= 1000 {
        format!("{:.1}k", points as f64 / 1000.0)
    } else {
        points.to_string()
    }
}

pub async fn stats(store: &dyn Store, user_id: &str) -> Result<AchievementStats, ApiError> {
    let views = evaluate(store, user_id).await?;
    // Re-read after evaluation so a fresh unlock's points show up.
    let user = store
        .user(user_id)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    let greater = store
        .all_users()
        .await?
        .iter()
        .filter(|u| u.impact_score > user.impact_score)
        .count();
    Ok(AchievementStats {
        unlocked: views.iter().filter(|v| v.unlocked).count(),
        total: views.len(),
        impact_score: user.impact_score,
        formatted_points: format_points(user.impact_score),
        rank: greater + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Challenge, WasteBreakdown};
    use crate::store::MemoryStore;
    use chrono::Duration;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_user(UserAccount::new("u1", "ana@example.com", "Ana"))
            .await
            .unwrap();
        store
    }

    async fn seed_challenge(store: &MemoryStore, id: &str, province: &str) {
        let now = Utc::now();
        store
            .insert_challenge(Challenge {
                id: id.into(),
                title: format!("Cleanup {}", id),
                location: None,
                province: Some(province.into()),
                starts_at: now - Duration::days(1),
                ends_at: now + Duration::days(1),
                total_items_collected: 0,
                total_volunteers: 0,
                breakdown: WasteBreakdown::default(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unlock_and_award_fire_exactly_once() {
        let store = seeded().await;
        seed_challenge(&store, "c1", "Drenthe").await;
        store.join_challenge("u1", "c1").await.unwrap();

        for _ in 0..3 {
            evaluate(&store, "u1").await.unwrap();
        }
        let user = store.user("u1").await.unwrap().unwrap();
        // Only first_steps (goal 1, 10 points) is reachable here.
        assert_eq!(user.impact_score, 10);

        let views = evaluate(&store, "u1").await.unwrap();
        let first = views.iter().find(|v| v.kind == "first_steps").unwrap();
        assert!(first.unlocked);
        assert!(first.unlocked_at.is_some());
        assert_eq!(first.progress, first.goal);
    }

    #[tokio::test]
    async fn join_leave_churn_does_not_farm_unlocks() {
        let store = seeded().await;
        seed_challenge(&store, "c1", "Drenthe").await;
        // Repeatedly joining and leaving the same challenge must not build
        // up joined-count progress for a user who is a member of nothing.
        for _ in 0..5 {
            store.join_challenge("u1", "c1").await.unwrap();
            store.leave_challenge("u1", "c1").await.unwrap();
            evaluate(&store, "u1").await.unwrap();
        }
        let views = evaluate(&store, "u1").await.unwrap();
        let team_player = views.iter().find(|v| v.kind == "team_player").unwrap();
        assert!(!team_player.unlocked);
        assert_eq!(team_player.progress, 0);
        let first = views.iter().find(|v| v.kind == "first_steps").unwrap();
        assert!(!first.unlocked);
        let user = store.user("u1").await.unwrap().unwrap();
        assert_eq!(user.impact_score, 0);
    }

    #[tokio::test]
    async fn progress_is_clamped_to_goal() {
        let store = seeded().await;
        store.apply_user_stats("u1", 150).await.unwrap();
        let views = evaluate(&store, "u1").await.unwrap();
        let century = views.iter().find(|v| v.kind == "century_collector").unwrap();
        assert!(!century.unlocked);
        assert_eq!(century.progress, 150);
        let hunter = views.iter().find(|v| v.kind == "item_hunter").unwrap();
        assert!(hunter.unlocked);
        assert_eq!(hunter.progress, hunter.goal);
    }

    #[tokio::test]
    async fn distinct_provinces_drive_wanderer() {
        let store = seeded().await;
        for (id, province) in [("c1", "Utrecht"), ("c2", "Drenthe"), ("c3", "Utrecht")] {
            seed_challenge(&store, id, province).await;
            store.join_challenge("u1", id).await.unwrap();
        }
        let views = evaluate(&store, "u1").await.unwrap();
        let wanderer = views.iter().find(|v| v.kind == "wanderer").unwrap();
        assert_eq!(wanderer.progress, 2);
        assert!(!wanderer.unlocked);
    }

    #[tokio::test]
    async fn unknown_kind_keeps_stored_progress() {
        let store = seeded().await;
        store
            .insert_achievement(AchievementRecord {
                user_id: "u1".into(),
                kind: "legacy_badge".into(),
                progress: 7,
                goal: 20,
                unlocked: false,
                unlocked_at: None,
                points: 5,
            })
            .await
            .unwrap();
        let views = evaluate(&store, "u1").await.unwrap();
        let legacy = views.iter().find(|v| v.kind == "legacy_badge").unwrap();
        assert_eq!(legacy.progress, 7);
        assert!(!legacy.unlocked);
    }

    #[tokio::test]
    async fn leaderboard_breaks_score_ties_by_items() {
        let store = MemoryStore::new();
        for (id, impact, items) in [("a", 50u64, 10u64), ("b", 50, 20), ("c", 30, 5)] {
            let mut user = UserAccount::new(id, format!("{id}@example.com"), id.to_uppercase());
            user.impact_score = impact;
            user.total_items_collected = items;
            store.insert_user(user).await.unwrap();
        }
        let board = leaderboard(&store, None).await.unwrap();
        let order: Vec<&str> = board.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].rank, 2);
        assert_eq!(board[2].rank, 3);
    }

    #[tokio::test]
    async fn leaderboard_materializes_top_n_only() {
        let store = MemoryStore::new();
        for i in 0..15 {
            let mut user = UserAccount::new(format!("u{i}"), format!("u{i}@x.y"), format!("U{i}"));
            user.impact_score = i;
            store.insert_user(user).await.unwrap();
        }
        assert_eq!(leaderboard(&store, None).await.unwrap().len(), 10);
        assert_eq!(leaderboard(&store, Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn milestone_percent_targets_nearest_uncompleted() {
        let store = seeded().await;
        store.apply_user_stats("u1", 25).await.unwrap();
        let progress = milestones(&store, "u1").await.unwrap();
        assert_eq!(progress.completed, vec![10]);
        assert_eq!(progress.next_goal, Some(50));
        assert_eq!(progress.percent, 50.0);
    }

    #[tokio::test]
    async fn stats_rank_counts_strictly_greater() {
        let store = MemoryStore::new();
        for (id, impact) in [("a", 50u64), ("b", 50), ("c", 70)] {
            let mut user = UserAccount::new(id, format!("{id}@example.com"), id.to_uppercase());
            user.impact_score = impact;
            store.insert_user(user).await.unwrap();
        }
        let s = stats(&store, "a").await.unwrap();
        // Only "c" is strictly greater; the tie with "b" shares the rank.
        assert_eq!(s.rank, 2);
        assert_eq!(stats(&store, "b").await.unwrap().rank, 2);
    }

    #[test]
    fn points_formatting_compresses_thousands() {
        assert_eq!(format_points(0), "0");
        assert_eq!(format_points(999), "999");
        assert_eq!(format_points(1000), "1.0k");
        assert_eq!(format_points(12300), "12.3k");
    }
}
