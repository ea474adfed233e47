//! Random behavior model.
//!
//! Pure functions that turn user, ad and content attributes into interaction,
//! report and churn probabilities, plus the seeded draws that turn those
//! probabilities into outcomes. Nothing here performs I/O.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use sim_core::{
    clamp_unit, Ad, BehaviorConfig, ChurnReason, ContentItem, InteractionKind, User,
};
use tracing::trace;

/// Something a user may report.
#[derive(Clone, Copy, Debug)]
pub enum ReportSubject<'a> {
    Ad(&'a Ad),
    Content(&'a ContentItem),
}

impl ReportSubject<'_> {
    /// Ads match on category, content on topic.
    pub fn preferred_by(&self, user: &User) -> bool {
        match self {
            ReportSubject::Ad(ad) => user.prefers_category(ad.category),
            ReportSubject::Content(item) => user.prefers_topic(&item.topic),
        }
    }
}

/// Probability that `user` interacts with `content`.
///
/// base + topic match + content-type match + engagement-weighted term.
pub fn interaction_probability(cfg: &BehaviorConfig, user: &User, content: &ContentItem) -> f64 {
    let mut p = cfg.interaction_base;
    if user.prefers_topic(&content.topic) {
        p += cfg.topic_boost;
    }
    if user.preferences.content_type.matches(content.content_type) {
        p += cfg.content_type_boost;
    }
    p += user.engagement_rate * cfg.engagement_weight;
    clamp_unit(p)
}

/// Probability that `user` reports `subject`.
///
/// Dissatisfied and disengaged users report more; items the user prefers are
/// discounted multiplicatively.
pub fn report_probability(cfg: &BehaviorConfig, user: &User, subject: ReportSubject<'_>) -> f64 {
    let mut p = cfg.report_base
        + (1.0 - user.satisfaction) * cfg.report_satisfaction_weight
        + (1.0 - user.engagement_rate) * cfg.report_engagement_weight;
    if subject.preferred_by(user) {
        p *= cfg.preferred_report_discount;
    }
    clamp_unit(p)
}

fn churn_terms(cfg: &BehaviorConfig, user: &User) -> [(ChurnReason, f64); 3] {
    [
        (
            ChurnReason::LowSatisfaction,
            (1.0 - user.satisfaction) * cfg.churn_satisfaction_weight,
        ),
        (
            ChurnReason::LowEngagement,
            (1.0 - user.engagement_rate) * cfg.churn_engagement_weight,
        ),
        (
            ChurnReason::Isolation,
            (1.0 - user.network_density) * cfg.churn_density_weight,
        ),
    ]
}

/// Probability that `user` churns this step.
pub fn churn_probability(cfg: &BehaviorConfig, user: &User) -> f64 {
    let p = cfg.churn_base + churn_terms(cfg, user).iter().map(|(_, t)| t).sum::<f64>();
    clamp_unit(p)
}

/// The largest weighted contributor to churn. Ties resolve to satisfaction.
pub fn churn_reason(cfg: &BehaviorConfig, user: &User) -> ChurnReason {
    let terms = churn_terms(cfg, user);
    let mut best = terms[0];
    for t in &terms[1..] {
        if t.1 > best.1 {
            best = *t;
        }
    }
    best.0
}

/// Combine the heuristic with a model prediction (equal weight).
pub fn blend(heuristic: f64, predicted: f64) -> f64 {
    clamp_unit((clamp_unit(heuristic) + clamp_unit(predicted)) / 2.0)
}

/// Bernoulli trial; `p` is clamped to [0,1] first.
pub fn bernoulli<R: Rng + ?Sized>(rng: &mut R, p: f64) -> bool {
    let p = clamp_unit(p);
    let hit = rng.gen_bool(p);
    trace!(p, hit, "bernoulli");
    hit
}

/// Index drawn proportionally to `weights`. `None` when no weight is positive.
pub fn weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> Option<usize> {
    WeightedIndex::new(weights).ok().map(|d| d.sample(rng))
}

/// Draw the kind of an interaction that already happened.
pub fn interaction_kind<R: Rng + ?Sized>(rng: &mut R) -> InteractionKind {
    weighted_index(rng, &InteractionKind::WEIGHTS)
        .and_then(|i| InteractionKind::ALL.get(i).copied())
        .unwrap_or(InteractionKind::View)
}
