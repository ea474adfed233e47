//! Contract between the step engine and whatever stores users, ads and
//! content.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;

use crate::error::{PersistenceError, RepositoryError};
use crate::model::{Ad, ChurnEvent, ContentItem, SimulationResult, User, UserId};

/// A potential new connection for the user being stepped.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub id: UserId,
    pub network_density: f64,
    pub influence_score: f64,
}

/// The user's current connections plus active users they could connect to.
#[derive(Clone, Debug, Default)]
pub struct Neighborhood {
    pub existing: BTreeSet<UserId>,
    pub candidates: Vec<Candidate>,
}

/// Storage collaborator consumed by the simulator.
///
/// Reads may fail independently; the simulator degrades them to empty sets.
/// `persist_step_result` and `record_churn` must be transactional.
#[allow(async_fn_in_trait)]
pub trait Repository {
    /// Up to `limit` users with status `active`.
    async fn load_active_users(&self, limit: usize) -> Result<Vec<User>, RepositoryError>;

    /// Up to `limit` ads whose budget is at least `min_budget`.
    async fn load_budgeted_ads(
        &self,
        limit: usize,
        min_budget: Decimal,
    ) -> Result<Vec<Ad>, RepositoryError>;

    /// Up to `limit` of the most recent content items.
    async fn load_recent_content(&self, limit: usize) -> Result<Vec<ContentItem>, RepositoryError>;

    /// Existing connections of `user` and up to `limit` active candidates
    /// that are neither the user nor already connected.
    async fn load_network(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Neighborhood, RepositoryError>;

    /// Commit everything in `result` or nothing.
    async fn persist_step_result(&self, result: &SimulationResult)
        -> Result<(), PersistenceError>;

    /// Mark the user inactive and record why.
    async fn record_churn(&self, event: &ChurnEvent) -> Result<(), PersistenceError>;

    /// Flags that have not expired at `now`.
    async fn count_active_flags(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}
