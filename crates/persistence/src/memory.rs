//! In-process repository for tests and offline runs.
//!
//! Applies the same rules as the SQLite store: a step result lands as a whole
//! or not at all, pairs are undirected, and churned users stop receiving
//! metric updates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sim_core::{
    Ad, AdId, AdPlacement, Candidate, ChurnEvent, ContentFlag, ContentInteraction, ContentItem,
    ContentRecommendation, ContentReport, ModerationAction, Neighborhood, PersistenceError,
    Repository, RepositoryError, SimulationResult, User, UserId, UserSession, UserStatus,
    INFLUENCE_CEILING,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::debug;

/// Everything the memory store holds. Returned by value from
/// [`MemoryRepository::snapshot`].
#[derive(Clone, Debug, Default)]
pub struct MemoryState {
    pub users: BTreeMap<UserId, User>,
    pub ads: BTreeMap<AdId, Ad>,
    /// Newest first.
    pub content: Vec<ContentItem>,
    /// Canonical `(smaller, larger)` pairs.
    pub connections: BTreeSet<(UserId, UserId)>,
    pub impressions: Vec<(UserId, AdPlacement)>,
    pub interactions: Vec<(UserId, ContentInteraction)>,
    pub reports: Vec<ContentReport>,
    pub actions: Vec<ModerationAction>,
    pub flags: Vec<ContentFlag>,
    pub sessions: Vec<(UserId, UserSession)>,
    pub recommendations: Vec<(UserId, ContentRecommendation)>,
    pub churn_events: Vec<ChurnEvent>,
    pub step_results: u64,
}

impl MemoryState {
    fn neighbors(&self, user: &UserId) -> BTreeSet<UserId> {
        self.connections
            .iter()
            .filter_map(|(a, b)| {
                if a == user {
                    Some(b.clone())
                } else if b == user {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn apply(&mut self, r: &SimulationResult) -> Result<(), PersistenceError> {
        let user = self
            .users
            .get_mut(&r.user_id)
            .filter(|u| u.is_active())
            .ok_or_else(|| PersistenceError::UserNotActive(r.user_id.clone()))?;
        let m = &r.metrics;
        user.satisfaction = m.satisfaction;
        user.engagement_rate = m.engagement_rate;
        user.network_density = m.network_density;
        user.avg_scroll_depth = m.avg_scroll_depth;
        user.avg_watch_time = m.avg_watch_time;
        user.clicks_last_24h = m.clicks_last_24h;
        user.content_interactions = m.content_interactions;
        user.video_views = m.video_views;
        user.video_completion_rate = m.video_completion_rate;

        for p in &r.placements {
            let ad = self.ads.get_mut(&p.ad_id).ok_or_else(|| PersistenceError::Write {
                operation: "update_ad_budget",
                message: format!("unknown ad `{}`", p.ad_id),
            })?;
            ad.budget = p.budget_after;
            self.impressions.push((r.user_id.clone(), p.clone()));
        }
        self.interactions
            .extend(r.interactions.iter().map(|i| (r.user_id.clone(), i.clone())));
        self.sessions.push((r.user_id.clone(), r.session.clone()));
        self.recommendations
            .extend(r.recommendations.iter().map(|c| (r.user_id.clone(), c.clone())));
        self.reports.extend(r.reports.iter().cloned());
        self.actions.extend(r.actions.iter().cloned());
        self.flags.extend(r.flags.iter().cloned());

        for c in &r.connections {
            let (a, b) = c.pair();
            if !self.connections.insert((a.clone(), b.clone())) {
                debug!(a = %a, b = %b, "connection already present");
                continue;
            }
            if let Some(initiator) = self.users.get_mut(&c.initiator) {
                initiator.following_count = initiator.following_count.saturating_add(1);
            }
            if let Some(target) = self.users.get_mut(&c.target) {
                target.influence_score =
                    (target.influence_score + c.influence_delta).min(INFLUENCE_CEILING);
                target.follower_count = target.follower_count.saturating_add(1);
            }
        }
        self.step_results += 1;
        Ok(())
    }
}

/// [`Repository`] over a mutex-guarded [`MemoryState`].
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    fail_persist: BTreeSet<UserId>,
    fail_reads: bool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = User>) -> Self {
        let state = self.state.get_mut();
        for u in users {
            state.users.insert(u.id.clone(), u);
        }
        self
    }

    pub fn with_ads(mut self, ads: impl IntoIterator<Item = Ad>) -> Self {
        let state = self.state.get_mut();
        for a in ads {
            state.ads.insert(a.id.clone(), a);
        }
        self
    }

    /// Items are treated as newest first, in the order given.
    pub fn with_content(mut self, items: impl IntoIterator<Item = ContentItem>) -> Self {
        self.state.get_mut().content.extend(items);
        self
    }

    /// Make every persist for `user` fail with a write error.
    pub fn fail_persist_for(mut self, user: UserId) -> Self {
        self.fail_persist.insert(user);
        self
    }

    /// Make every read fail as if the store were unreachable.
    pub fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    fn check_reads(&self) -> Result<(), RepositoryError> {
        if self.fail_reads {
            return Err(RepositoryError::Connection("memory store is offline".into()));
        }
        Ok(())
    }
}

impl Repository for MemoryRepository {
    async fn load_active_users(&self, limit: usize) -> Result<Vec<User>, RepositoryError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .filter(|u| u.is_active())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_budgeted_ads(
        &self,
        limit: usize,
        min_budget: Decimal,
    ) -> Result<Vec<Ad>, RepositoryError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state
            .ads
            .values()
            .filter(|a| a.budget >= min_budget)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_recent_content(&self, limit: usize) -> Result<Vec<ContentItem>, RepositoryError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state.content.iter().take(limit).cloned().collect())
    }

    async fn load_network(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Neighborhood, RepositoryError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        let existing = state.neighbors(user);
        let candidates = state
            .users
            .values()
            .filter(|u| u.is_active() && &u.id != user && !existing.contains(&u.id))
            .take(limit)
            .map(|u| Candidate {
                id: u.id.clone(),
                network_density: u.network_density,
                influence_score: u.influence_score,
            })
            .collect();
        Ok(Neighborhood {
            existing,
            candidates,
        })
    }

    async fn persist_step_result(&self, result: &SimulationResult) -> Result<(), PersistenceError> {
        result.check_consistency()?;
        if self.fail_persist.contains(&result.user_id) {
            return Err(PersistenceError::Write {
                operation: "persist_step_result",
                message: format!("injected failure for `{}`", result.user_id),
            });
        }
        let mut state = self.state.lock().await;
        // Apply to a scratch copy so a mid-way failure leaves nothing behind.
        let mut next = state.clone();
        next.apply(result)?;
        *state = next;
        Ok(())
    }

    async fn record_churn(&self, event: &ChurnEvent) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&event.user_id)
            .filter(|u| u.is_active())
            .ok_or_else(|| PersistenceError::UserNotActive(event.user_id.clone()))?;
        user.status = UserStatus::Inactive;
        state.churn_events.push(event.clone());
        Ok(())
    }

    async fn count_active_flags(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state.flags.iter().filter(|f| f.expires_at > now).count() as u64)
    }
}
