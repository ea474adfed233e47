//! Entities that flow through one simulation step.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::error::ValidationError;

/// Upper bound for a user's influence score.
pub const INFLUENCE_CEILING: f64 = 10.0;

/// Clamp a score into `[0, 1]`. NaN collapses to 0.
pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Apply an additive delta to a unit-bounded score, clamping the result.
pub fn nudge_unit(score: &mut f64, delta: f64) {
    *score = clamp_unit(*score + delta);
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    check_range(field, value, 0.0, 1.0)
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFinite(field));
    }
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Platform user identifier.
    UserId
);
string_id!(
    /// Advertisement identifier.
    AdId
);
string_id!(
    /// Post/comment/thread/video identifier.
    ContentId
);

/// Closed enumerations stored as lowercase labels.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(ValidationError::UnknownLabel {
                        kind: stringify!($name),
                        label: other.to_string(),
                    }),
                }
            }
        }
    };
}

labelled_enum!(
    /// Device a user browses from.
    Device {
        Mobile => "mobile",
        Desktop => "desktop",
        Tablet => "tablet",
    }
);

labelled_enum!(
    /// Lifecycle status of a user account.
    UserStatus {
        Active => "active",
        Inactive => "inactive",
        Banned => "banned",
    }
);

labelled_enum!(
    /// Kinds of organic content.
    ContentType {
        Post => "post",
        Comment => "comment",
        Thread => "thread",
        Video => "video",
    }
);

labelled_enum!(
    /// Ad categories. The integer index is the historical wire value.
    AdCategory {
        Technology => "technology",
        Fashion => "fashion",
        Food => "food",
        Travel => "travel",
        Entertainment => "entertainment",
        Sports => "sports",
        Health => "health",
        Education => "education",
        Finance => "finance",
        Other => "other",
    }
);

impl AdCategory {
    /// Stable index in `0..=9`.
    pub fn index(self) -> u8 {
        // ALL is declared in index order.
        AdCategory::ALL
            .iter()
            .position(|c| *c == self)
            .map(|i| i as u8)
            .unwrap_or(9)
    }

    pub fn from_index(i: i64) -> Result<Self, ValidationError> {
        usize::try_from(i)
            .ok()
            .and_then(|i| AdCategory::ALL.get(i).copied())
            .ok_or(ValidationError::CategoryIndex(i))
    }
}

labelled_enum!(
    /// What a report or flag points at.
    TargetKind {
        Ad => "ad",
        Post => "post",
        Comment => "comment",
        Thread => "thread",
        Video => "video",
    }
);

impl From<ContentType> for TargetKind {
    fn from(t: ContentType) -> Self {
        match t {
            ContentType::Post => TargetKind::Post,
            ContentType::Comment => TargetKind::Comment,
            ContentType::Thread => TargetKind::Thread,
            ContentType::Video => TargetKind::Video,
        }
    }
}

labelled_enum!(
    /// Reason a user gives when reporting.
    ReportReason {
        Spam => "spam",
        Harassment => "harassment",
        Hate => "hate",
        Violence => "violence",
        Copyright => "copyright",
        Inappropriate => "inappropriate",
        Other => "other",
    }
);

labelled_enum!(
    /// Report lifecycle: `pending -> resolved | dismissed`.
    ReportStatus {
        Pending => "pending",
        Resolved => "resolved",
        Dismissed => "dismissed",
    }
);

labelled_enum!(
    /// Moderator decision on a report.
    ActionType {
        Remove => "remove",
        Warn => "warn",
        Ban => "ban",
        Flag => "flag",
        Ignore => "ignore",
    }
);

impl ActionType {
    /// Whether the action hides the target and therefore produces a flag.
    pub fn suppresses(self) -> bool {
        matches!(self, ActionType::Remove | ActionType::Flag | ActionType::Ban)
    }

    /// Status the resolved report ends in.
    pub fn terminal_status(self) -> ReportStatus {
        match self {
            ActionType::Ignore => ReportStatus::Dismissed,
            _ => ReportStatus::Resolved,
        }
    }

    /// Flag type attached to a suppressing action.
    pub fn flag_type(self) -> Option<FlagType> {
        match self {
            ActionType::Ban => Some(FlagType::Permanent),
            ActionType::Remove => Some(FlagType::Temporary),
            ActionType::Flag => Some(FlagType::Review),
            ActionType::Warn | ActionType::Ignore => None,
        }
    }
}

labelled_enum!(
    /// Suppression marker kinds.
    FlagType {
        Temporary => "temporary",
        Permanent => "permanent",
        Review => "review",
    }
);

labelled_enum!(
    /// Kinds of content interaction.
    InteractionKind {
        View => "view",
        Like => "like",
        Share => "share",
        Comment => "comment",
        Bookmark => "bookmark",
        Retweet => "retweet",
        Quote => "quote",
    }
);

impl InteractionKind {
    /// Draw weights aligned with `ALL`.
    pub const WEIGHTS: [f64; 7] = [0.5, 0.2, 0.1, 0.1, 0.05, 0.03, 0.02];
}

labelled_enum!(
    /// Dominant contributor when a user churns.
    ChurnReason {
        LowSatisfaction => "low_satisfaction",
        LowEngagement => "low_engagement",
        Isolation => "isolation",
    }
);

/// Which content types a user favors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTypePreference {
    #[default]
    All,
    Text,
    Video,
}

impl ContentTypePreference {
    pub fn matches(self, t: ContentType) -> bool {
        match self {
            ContentTypePreference::All => true,
            ContentTypePreference::Text => t != ContentType::Video,
            ContentTypePreference::Video => t == ContentType::Video,
        }
    }
}

/// Typed user preferences, decoded once when the user is loaded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub topics: Vec<String>,
    pub content_type: ContentTypePreference,
    pub categories: Vec<AdCategory>,
}

/// A simulated platform user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub age: u32,
    pub region: String,
    pub device: Device,
    pub persona_id: u32,
    pub status: UserStatus,
    /// In [0,1].
    pub satisfaction: f64,
    /// In [0,1].
    pub engagement_rate: f64,
    /// In [0,1].
    pub network_density: f64,
    /// In [0, INFLUENCE_CEILING].
    pub influence_score: f64,
    /// In [0,1].
    pub avg_scroll_depth: f64,
    /// Seconds, >= 0.
    pub avg_watch_time: f64,
    pub clicks_last_24h: u32,
    pub content_interactions: u32,
    /// Video interactions only; the sample count behind
    /// `video_completion_rate`.
    pub video_views: u32,
    /// In [0,1].
    pub video_completion_rate: f64,
    pub follower_count: u32,
    pub following_count: u32,
    pub preferences: Preferences,
}

impl User {
    /// Check every bounded score.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_unit("satisfaction", self.satisfaction)?;
        check_unit("engagement_rate", self.engagement_rate)?;
        check_unit("network_density", self.network_density)?;
        check_unit("avg_scroll_depth", self.avg_scroll_depth)?;
        check_unit("video_completion_rate", self.video_completion_rate)?;
        check_range("influence_score", self.influence_score, 0.0, INFLUENCE_CEILING)?;
        check_range("avg_watch_time", self.avg_watch_time, 0.0, f64::MAX)?;
        Ok(())
    }

    /// Pull every bounded score back inside its range.
    pub fn clamp_scores(&mut self) {
        self.satisfaction = clamp_unit(self.satisfaction);
        self.engagement_rate = clamp_unit(self.engagement_rate);
        self.network_density = clamp_unit(self.network_density);
        self.avg_scroll_depth = clamp_unit(self.avg_scroll_depth);
        self.video_completion_rate = clamp_unit(self.video_completion_rate);
        self.influence_score = if self.influence_score.is_nan() {
            0.0
        } else {
            self.influence_score.clamp(0.0, INFLUENCE_CEILING)
        };
        if !(self.avg_watch_time.is_finite() && self.avg_watch_time >= 0.0) {
            self.avg_watch_time = 0.0;
        }
    }

    pub fn prefers_category(&self, category: AdCategory) -> bool {
        self.preferences.categories.contains(&category)
    }

    pub fn prefers_topic(&self, topic: &str) -> bool {
        self.preferences.topics.iter().any(|t| t == topic)
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn snapshot(&self) -> UserMetricsSnapshot {
        UserMetricsSnapshot {
            satisfaction: self.satisfaction,
            engagement_rate: self.engagement_rate,
            network_density: self.network_density,
            influence_score: self.influence_score,
            avg_scroll_depth: self.avg_scroll_depth,
            avg_watch_time: self.avg_watch_time,
            clicks_last_24h: self.clicks_last_24h,
            content_interactions: self.content_interactions,
            video_views: self.video_views,
            video_completion_rate: self.video_completion_rate,
            following_count: self.following_count,
        }
    }
}

/// Minimum user scores an advertiser targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetMetrics {
    pub min_satisfaction: f64,
    pub min_engagement: f64,
    pub min_influence: f64,
}

impl TargetMetrics {
    /// Margins by which a user clears each threshold; negative means missed.
    pub fn margins(&self, user: &User) -> [f64; 3] {
        [
            user.satisfaction - self.min_satisfaction,
            user.engagement_rate - self.min_engagement,
            user.influence_score - self.min_influence,
        ]
    }

    /// Margins of the thresholds the advertiser actually set (> 0).
    pub fn targeted_margins(&self, user: &User) -> impl Iterator<Item = f64> {
        let thresholds = [self.min_satisfaction, self.min_engagement, self.min_influence];
        self.margins(user)
            .into_iter()
            .zip(thresholds)
            .filter(|(_, threshold)| *threshold > 0.0)
            .map(|(margin, _)| margin)
    }

    pub fn met_by(&self, user: &User) -> bool {
        self.margins(user).iter().all(|m| *m >= 0.0)
    }
}

/// A budgeted advertisement competing in auctions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ad {
    pub id: AdId,
    pub title: String,
    /// Price per impression offered, > 0.
    pub bid: Decimal,
    /// Remaining spend, >= 0.
    pub budget: Decimal,
    pub category: AdCategory,
    pub target: TargetMetrics,
}

impl Ad {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bid <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveBid);
        }
        if self.budget < Decimal::ZERO {
            return Err(ValidationError::NegativeMoney("budget"));
        }
        let t = &self.target;
        for (field, v) in [
            ("min_satisfaction", t.min_satisfaction),
            ("min_engagement", t.min_engagement),
            ("min_influence", t.min_influence),
        ] {
            if !v.is_finite() {
                return Err(ValidationError::NonFinite(field));
            }
        }
        Ok(())
    }
}

/// A piece of organic content shown in the feed. Read-only during a step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub content_type: ContentType,
    pub topic: String,
    pub reply_count: u32,
    pub retweet_count: u32,
    pub quote_count: u32,
    /// Videos only.
    pub completion_rate: Option<f64>,
    pub watch_time_seconds: Option<u32>,
    pub loop_count: Option<u32>,
}

impl ContentItem {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(rate) = self.completion_rate {
            check_unit("completion_rate", rate)?;
        }
        Ok(())
    }
}

/// The thing a report or flag is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTarget {
    pub id: String,
    pub kind: TargetKind,
}

impl ReportTarget {
    pub fn ad(id: &AdId) -> Self {
        ReportTarget {
            id: id.0.clone(),
            kind: TargetKind::Ad,
        }
    }

    pub fn content(item: &ContentItem) -> Self {
        ReportTarget {
            id: item.id.0.clone(),
            kind: item.content_type.into(),
        }
    }
}

/// A user report against an ad or content item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentReport {
    pub id: Uuid,
    pub reporter_id: UserId,
    pub target: ReportTarget,
    pub reason: ReportReason,
    pub details: String,
    pub severity: f64,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}

impl ContentReport {
    /// Move a pending report to the terminal status implied by `action`.
    pub fn resolve_with(&mut self, action: ActionType) -> Result<(), ValidationError> {
        if self.status != ReportStatus::Pending {
            return Err(ValidationError::ReportNotPending(self.id));
        }
        self.status = action.terminal_status();
        Ok(())
    }
}

/// Structured notes stored with a moderation action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDetails {
    pub reason: ReportReason,
    pub severity: f64,
    /// Suspension length for bans and warnings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
    pub notes: String,
}

/// Moderator decision resolving exactly one report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModerationAction {
    pub id: Uuid,
    pub report_id: Uuid,
    pub moderator_id: String,
    pub action_type: ActionType,
    pub details: ActionDetails,
    pub created_at: DateTime<Utc>,
}

/// Time-bounded suppression marker produced by a suppressing action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentFlag {
    pub id: Uuid,
    pub action_id: Uuid,
    pub target: ReportTarget,
    pub flag_type: FlagType,
    pub reason: ReportReason,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One ad shown to the user, with the provisional budget debit behind it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdPlacement {
    pub ad_id: AdId,
    /// 1-based feed slot.
    pub position: u32,
    pub predicted_ctr: f64,
    pub score: f64,
    pub spend: Decimal,
    pub budget_after: Decimal,
    pub clicked: bool,
}

/// A recorded interaction with a content item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentInteraction {
    pub content_id: ContentId,
    pub kind: InteractionKind,
    pub engagement_score: f64,
}

/// A newly formed connection between two users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub initiator: UserId,
    pub target: UserId,
    pub created_at: DateTime<Utc>,
    /// Influence added to the target when the pair is new.
    pub influence_delta: f64,
}

impl Connection {
    /// Direction-free key: the same pair always yields the same tuple.
    pub fn pair(&self) -> (&UserId, &UserId) {
        if self.initiator <= self.target {
            (&self.initiator, &self.target)
        } else {
            (&self.target, &self.initiator)
        }
    }
}

/// Updated behavioral state of a user at the end of a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMetricsSnapshot {
    pub satisfaction: f64,
    pub engagement_rate: f64,
    pub network_density: f64,
    /// Informational; influence is only raised by other users' connections.
    pub influence_score: f64,
    pub avg_scroll_depth: f64,
    pub avg_watch_time: f64,
    pub clicks_last_24h: u32,
    pub content_interactions: u32,
    pub video_views: u32,
    pub video_completion_rate: f64,
    pub following_count: u32,
}

/// Active-to-inactive transition recorded instead of a metrics update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChurnEvent {
    pub user_id: UserId,
    pub reason: ChurnReason,
    pub probability: f64,
    pub satisfaction: f64,
    pub at: DateTime<Utc>,
}

/// One pass over the feed by a user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    /// Predicted time spent on the feed, seconds.
    pub length_secs: f64,
    /// Smoothed averages after this session.
    pub avg_scroll_depth: f64,
    pub avg_watch_time: f64,
    /// Ad clicks during this session.
    pub clicks: u32,
}

/// What the recommender knew when it scored an item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationReason {
    pub user_interests: Vec<String>,
    pub engagement_history: u32,
}

/// A scored content item shown to the user, interacted with or not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentRecommendation {
    pub content_id: ContentId,
    /// Predicted engagement score, in [0,1].
    pub score: f64,
    pub reason: RecommendationReason,
}

/// Everything one user's step produced. Persisted atomically or not at all.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationResult {
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub placements: Vec<AdPlacement>,
    pub interactions: Vec<ContentInteraction>,
    pub reports: Vec<ContentReport>,
    pub actions: Vec<ModerationAction>,
    pub flags: Vec<ContentFlag>,
    pub connections: Vec<Connection>,
    pub recommendations: Vec<ContentRecommendation>,
    pub session: UserSession,
    pub metrics: UserMetricsSnapshot,
}

impl SimulationResult {
    pub fn new(user: &User, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.clone(),
            timestamp,
            placements: Vec::new(),
            interactions: Vec::new(),
            reports: Vec::new(),
            actions: Vec::new(),
            flags: Vec::new(),
            connections: Vec::new(),
            recommendations: Vec::new(),
            session: UserSession::default(),
            metrics: user.snapshot(),
        }
    }

    pub fn clicks(&self) -> usize {
        self.placements.iter().filter(|p| p.clicked).count()
    }

    pub fn spend(&self) -> Decimal {
        self.placements.iter().map(|p| p.spend).sum()
    }

    /// Cross-entity checks: one action per report, no orphan actions, and
    /// every flag backed by a suppressing action of this result.
    pub fn check_consistency(&self) -> Result<(), ValidationError> {
        let reports: BTreeSet<Uuid> = self.reports.iter().map(|r| r.id).collect();
        let mut per_report: BTreeMap<Uuid, usize> = BTreeMap::new();
        let mut actions: BTreeMap<Uuid, ActionType> = BTreeMap::new();
        for a in &self.actions {
            if !reports.contains(&a.report_id) {
                return Err(ValidationError::OrphanAction {
                    action: a.id,
                    report: a.report_id,
                });
            }
            *per_report.entry(a.report_id).or_default() += 1;
            actions.insert(a.id, a.action_type);
        }
        for r in &self.reports {
            if per_report.get(&r.id).copied() != Some(1) {
                return Err(ValidationError::UnresolvedReport(r.id));
            }
        }
        for f in &self.flags {
            match actions.get(&f.action_id) {
                Some(t) if t.suppresses() => {}
                _ => return Err(ValidationError::UnbackedFlag { flag: f.id }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn user(id: &str) -> User {
        User {
            id: UserId(id.to_string()),
            username: format!("{id}_name"),
            age: 30,
            region: "Europe".to_string(),
            device: Device::Mobile,
            persona_id: 1,
            status: UserStatus::Active,
            satisfaction: 0.5,
            engagement_rate: 0.3,
            network_density: 0.2,
            influence_score: 0.1,
            avg_scroll_depth: 0.5,
            avg_watch_time: 30.0,
            clicks_last_24h: 0,
            content_interactions: 0,
            video_views: 0,
            video_completion_rate: 0.4,
            follower_count: 10,
            following_count: 10,
            preferences: Preferences::default(),
        }
    }
}
