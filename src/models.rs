use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A longitude/latitude pair owned by a challenge. Immutable once set.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Fixed set of waste categories the classifier may assign. Anything the
/// model returns outside this set is treated as uncategorized and only
/// counts toward a challenge's total, never a per-category bucket.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WasteCategory {
    Plastic,
    Glass,
    Metal,
    Paper,
    Organic,
    Electronic,
    Textile,
}

impl WasteCategory {
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_lowercase().as_str() {
            "plastic" => Some(Self::Plastic),
            "glass" => Some(Self::Glass),
            "metal" => Some(Self::Metal),
            "paper" | "cardboard" => Some(Self::Paper),
            "organic" | "biological" => Some(Self::Organic),
            "electronic" | "e-waste" => Some(Self::Electronic),
            "textile" | "clothes" => Some(Self::Textile),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plastic => "plastic",
            Self::Glass => "glass",
            Self::Metal => "metal",
            Self::Paper => "paper",
            Self::Organic => "organic",
            Self::Electronic => "electronic",
            Self::Textile => "textile",
        }
    }
}

/// Per-category item counters for one challenge. Fixed fields rather than a
/// string-keyed map so an unexpected label can never mint a new bucket.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct WasteBreakdown {
    pub plastic: u64,
    pub glass: u64,
    pub metal: u64,
    pub paper: u64,
    pub organic: u64,
    pub electronic: u64,
    pub textile: u64,
}

impl WasteBreakdown {
    pub fn add(&mut self, category: WasteCategory, count: u64) {
        let slot = match category {
            WasteCategory::Plastic => &mut self.plastic,
            WasteCategory::Glass => &mut self.glass,
            WasteCategory::Metal => &mut self.metal,
            WasteCategory::Paper => &mut self.paper,
            WasteCategory::Organic => &mut self.organic,
            WasteCategory::Electronic => &mut self.electronic,
            WasteCategory::Textile => &mut self.textile,
        };
        *slot += count;
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserAccount {
    pub id: String,
    pub email: String,
    pub name: String,
    pub total_items_collected: u64,
    pub total_cleanups: u64,
    pub total_challenges_joined: u64,
    pub impact_score: u64,
    pub joined_challenges: Vec<String>,
}

impl UserAccount {
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            total_items_collected: 0,
            total_cleanups: 0,
            total_challenges_joined: 0,
            impact_score: 0,
            joined_challenges: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Upcoming,
    Active,
    Ended,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Challenge {
    pub id: String,
    pub title: String,
    pub location: Option<GeoPoint>,
    pub province: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub total_items_collected: u64,
    // i64 so a racing decrement can be observed below zero and clamped,
    // instead of wrapping.
    pub total_volunteers: i64,
    pub breakdown: WasteBreakdown,
}

impl Challenge {
    /// Status is derived from the stored dates at read time, never stored
    /// as authoritative.
    pub fn status_at(&self, now: DateTime<Utc>) -> ChallengeStatus {
        if now < self.starts_at {
            ChallengeStatus::Upcoming
        } else if now > self.ends_at {
            ChallengeStatus::Ended
        } else {
            ChallengeStatus::Active
        }
    }
}

/// Immutable log entry for one accepted unit of cleanup evidence. This is
/// the durable source of truth; all aggregate counters can be rebuilt from
/// these records.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContributionRecord {
    pub id: String,
    pub user_id: String,
    pub challenge_id: String,
    pub item_count: u64,
    pub label: String,
    pub category: Option<WasteCategory>,
    pub confidence: f64,
    pub image_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One record per (user, achievement kind). Progress is a display cache
/// recomputed from live statistics on every read; `unlocked` transitions
/// false -> true exactly once.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AchievementRecord {
    pub user_id: String,
    pub kind: String,
    pub progress: u64,
    pub goal: u64,
    pub unlocked: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub points: u64,
}
