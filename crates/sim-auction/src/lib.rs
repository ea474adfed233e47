//! Ad auction engine for the feed simulator.
//!
//! This crate provides:
//! - Eligibility checks (remaining budget, advertiser targeting)
//! - Quality-adjusted scoring of candidate ads
//! - Stable top-k selection with provisional budget debits against a
//!   per-tick [`AdPool`]

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use sim_core::{Ad, AdId, AdPlacement, AuctionConfig, User};
use sim_predict::{PredictionClient, Predictor};
use tracing::{debug, trace};

/// Ads loaded for one tick. Every user of the tick bids against the same
/// budgets, so debits made for one user are visible to the next.
#[derive(Clone, Debug, Default)]
pub struct AdPool {
    ads: Vec<Ad>,
}

impl AdPool {
    pub fn new(ads: Vec<Ad>) -> Self {
        Self { ads }
    }

    pub fn ads(&self) -> &[Ad] {
        &self.ads
    }

    pub fn get(&self, id: &AdId) -> Option<&Ad> {
        self.ads.iter().find(|a| &a.id == id)
    }

    pub fn len(&self) -> usize {
        self.ads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ads.is_empty()
    }

    /// Sum of remaining budgets.
    pub fn total_budget(&self) -> Decimal {
        self.ads.iter().map(|a| a.budget).sum()
    }

    /// Return the debits behind `placements` to their ads.
    ///
    /// Called when the step that produced them is not persisted.
    pub fn refund(&mut self, placements: &[AdPlacement]) {
        for p in placements {
            if let Some(ad) = self.ads.iter_mut().find(|a| a.id == p.ad_id) {
                ad.budget += p.spend;
                trace!(ad = %ad.id, spend = %p.spend, "refunded");
            }
        }
    }
}

/// Whether `ad` may compete for `user`: enough budget for one minimal debit
/// and every targeting threshold met.
///
/// Example:
/// // budget 0.005 with min unit 0.01 => ineligible
pub fn is_eligible(cfg: &AuctionConfig, user: &User, ad: &Ad) -> bool {
    ad.budget >= cfg.min_spend_unit && ad.target.met_by(user)
}

/// Multiplier applied on top of `bid × ctr`.
///
/// ×`preferred_category_boost` when the user prefers the ad's category and
/// ×`marginal_penalty` for every set threshold cleared by less than
/// `marginal_band`. Thresholds left at zero never penalize.
pub fn quality_multiplier(cfg: &AuctionConfig, user: &User, ad: &Ad) -> f64 {
    let mut q = 1.0;
    if user.prefers_category(ad.category) {
        q *= cfg.preferred_category_boost;
    }
    for margin in ad.target.targeted_margins(user) {
        if margin < cfg.marginal_band {
            q *= cfg.marginal_penalty;
        }
    }
    q
}

/// `bid × ctr × quality`. Non-finite inputs score zero.
pub fn score(cfg: &AuctionConfig, user: &User, ad: &Ad, ctr: f64) -> f64 {
    let bid = ad.bid.to_f64().unwrap_or(0.0);
    let s = bid * ctr * quality_multiplier(cfg, user, ad);
    if s.is_finite() {
        s
    } else {
        0.0
    }
}

/// A scored candidate; `index` points into the pool.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScoredAd {
    pub index: usize,
    pub ctr: f64,
    pub score: f64,
}

/// Rank `bids` by descending score and debit the top `slots` in selection
/// order.
///
/// The sort is stable, so equal scores keep candidate order. Each debit is
/// `bid × spend_fraction` capped at the remaining budget; an ad whose budget
/// has fallen below the minimal unit is skipped and its slot goes to the next
/// candidate.
pub fn select(
    cfg: &AuctionConfig,
    pool: &mut AdPool,
    mut bids: Vec<ScoredAd>,
    slots: usize,
) -> Vec<AdPlacement> {
    bids.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut placements = Vec::with_capacity(slots.min(bids.len()));
    for bid in bids {
        if placements.len() >= slots {
            break;
        }
        let Some(ad) = pool.ads.get_mut(bid.index) else {
            continue;
        };
        if ad.budget < cfg.min_spend_unit {
            continue;
        }
        let spend = (ad.bid * cfg.spend_fraction).min(ad.budget);
        ad.budget -= spend;
        placements.push(AdPlacement {
            ad_id: ad.id.clone(),
            position: placements.len() as u32 + 1,
            predicted_ctr: bid.ctr,
            score: bid.score,
            spend,
            budget_after: ad.budget,
            clicked: false,
        });
    }
    placements
}

/// Run one auction for `user` over the pool and return up to `slots`
/// placements, best first.
///
/// CTR comes from the prediction client, which falls back to its static
/// default on failure, so the auction itself cannot fail.
pub async fn run_auction<P: Predictor>(
    cfg: &AuctionConfig,
    predictions: &PredictionClient<P>,
    user: &User,
    pool: &mut AdPool,
    slots: usize,
    now: DateTime<Utc>,
) -> Vec<AdPlacement> {
    let mut bids = Vec::new();
    for (index, ad) in pool.ads.iter().enumerate() {
        if !is_eligible(cfg, user, ad) {
            continue;
        }
        let ctr = predictions.ctr(user, ad, 1, now).await;
        bids.push(ScoredAd {
            index,
            ctr,
            score: score(cfg, user, ad, ctr),
        });
    }
    let eligible = bids.len();
    let placements = select(cfg, pool, bids, slots);
    debug!(
        user = %user.id,
        candidates = pool.len(),
        eligible,
        selected = placements.len(),
        "auction complete"
    );
    placements
}
