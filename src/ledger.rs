use crate::error::ApiError;
use crate::models::{ContributionRecord, WasteBreakdown, WasteCategory};
use crate::store::{Store, UpdateOutcome};
use chrono::Utc;
use tracing::{error, info, warn};

/// Atomic bookkeeping over user and challenge counters. Membership is one
/// conditional update; volunteer counts are separate monotone bumps with a
/// clamp pass. A crash between the two steps can leave the volunteer total
/// briefly stale, but a read never observes a negative count.
pub async fn join(store: &dyn Store, user_id: &str, challenge_id: &str) -> Result<(), ApiError> {
    if store.challenge(challenge_id).await?.is_none() {
        return Err(ApiError::NotFound("Challenge"));
    }
    match store.join_challenge(user_id, challenge_id).await? {
        UpdateOutcome::Applied => {}
        UpdateOutcome::NoMatch => return Err(ApiError::AlreadyJoined),
        UpdateOutcome::NotFound => return Err(ApiError::NotFound("User")),
    }
    bump_and_clamp(store, challenge_id, 1).await;
    info!("User {} joined challenge {}", user_id, challenge_id);
    Ok(())
}

pub async fn leave(store: &dyn Store, user_id: &str, challenge_id: &str) -> Result<(), ApiError> {
    if store.challenge(challenge_id).await?.is_none() {
        return Err(ApiError::NotFound("Challenge"));
    }
    match store.leave_challenge(user_id, challenge_id).await? {
        UpdateOutcome::Applied => {}
        UpdateOutcome::NoMatch => return Err(ApiError::NotJoined),
        UpdateOutcome::NotFound => return Err(ApiError::NotFound("User")),
    }
    bump_and_clamp(store, challenge_id, -1).await;
    info!("User {} left challenge {}", user_id, challenge_id);
    Ok(())
}

async fn bump_and_clamp(store: &dyn Store, challenge_id: &str, delta: i64) {
    // Best-effort once membership is recorded: the joined set is the truth
    // the count can be rebuilt from.
    match store.bump_volunteers(challenge_id, delta).await {
        Ok(UpdateOutcome::NotFound) => {
            error!("Volunteer count update skipped: {} not found", challenge_id);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            error!("Volunteer count update failed for {}: {:?}", challenge_id, e);
            return;
        }
    }
    if let Err(e) = store.clamp_volunteers(challenge_id).await {
        error!("Volunteer count clamp failed for {}: {:?}", challenge_id, e);
    }
}

/// One accepted unit of evidence, ready to be logged.
#[derive(Debug, Clone)]
pub struct Submission {
    pub user_id: String,
    pub challenge_id: String,
    pub item_count: u64,
    pub label: String,
    pub confidence: f64,
    pub image_id: Option<String>,
}

/// Durably append the contribution record, then apply the aggregate stat
/// bumps best-effort. A stat failure after the record exists is logged and
/// swallowed: the record, not the aggregate, is the source of truth, and
/// `reconcile_challenge` can rebuild the aggregates from it.
pub async fn record(
    store: &dyn Store,
    submission: Submission,
) -> Result<ContributionRecord, ApiError> {
    let now = Utc::now();
    let category = WasteCategory::parse(&submission.label);
    if category.is_none() {
        warn!(
            "Unrecognized waste label {:?}, counting toward totals only",
            submission.label
        );
    }
    let record = ContributionRecord {
        id: format!("{}-{}", submission.user_id, now.timestamp_micros()),
        user_id: submission.user_id,
        challenge_id: submission.challenge_id,
        item_count: submission.item_count,
        label: submission.label,
        category,
        confidence: submission.confidence,
        image_id: submission.image_id,
        created_at: now,
    };
    store.insert_contribution(record.clone()).await?;
    info!(
        "Recorded contribution of {} item(s) by {} for challenge {}",
        record.item_count, record.user_id, record.challenge_id
    );

    match store.apply_user_stats(&record.user_id, record.item_count).await {
        Ok(UpdateOutcome::NotFound) => {
            error!("User stat update skipped: {} not found", record.user_id)
        }
        Ok(_) => {}
        Err(e) => error!("User stat update failed for {}: {:?}", record.user_id, e),
    }
    match store
        .apply_challenge_stats(&record.challenge_id, record.item_count, category)
        .await
    {
        Ok(UpdateOutcome::NotFound) => error!(
            "Challenge stat update skipped: {} not found",
            record.challenge_id
        ),
        Ok(_) => {}
        Err(e) => error!(
            "Challenge stat update failed for {}: {:?}",
            record.challenge_id, e
        ),
    }
    Ok(record)
}

/// Maintenance operation: recompute a challenge's item total and category
/// breakdown from the contribution log. No route calls this yet; operators
/// run it when the best-effort stat path has been interrupted.
pub async fn reconcile_challenge(
    store: &dyn Store,
    challenge_id: &str,
) -> Result<(u64, WasteBreakdown), ApiError> {
    let records = store.contributions_for_challenge(challenge_id).await?;
    let mut total = 0u64;
    let mut breakdown = WasteBreakdown::default();
    for rec in &records {
        total += rec.item_count;
        if let Some(category) = rec.category {
            breakdown.add(category, rec.item_count);
        }
    }
    match store
        .set_challenge_aggregates(challenge_id, total, breakdown)
        .await?
    {
        UpdateOutcome::NotFound => Err(ApiError::NotFound("Challenge")),
        _ => {
            info!(
                "Reconciled challenge {} from {} record(s): {} item(s)",
                challenge_id,
                records.len(),
                total
            );
            Ok((total, breakdown))
        }
    }
}
