//! One user's pass through a tick.

use chrono::{DateTime, Utc};
use rand::Rng;
use sim_auction::{run_auction, AdPool};
use sim_behavior::{
    bernoulli, blend, churn_probability, churn_reason, interaction_kind,
    interaction_probability, report_probability, ReportSubject,
};
use sim_core::{
    nudge_unit, ChurnEvent, ContentInteraction, ContentItem, ContentRecommendation, ContentType,
    Neighborhood, RecommendationReason, ReportTarget, Repository, SimConfig, SimError,
    SimulationResult, User, UserSession,
};
use sim_predict::{PredictionClient, Predictor};
use tracing::{debug, warn};

use crate::moderation::file_report;
use crate::network::grow_network;

/// Phases of a step, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPhase {
    LoadInputs,
    RunAuction,
    ApplyInteractions,
    RunModeration,
    GrowNetwork,
    EvaluateChurn,
    Persist,
}

/// How a step ended.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// The full result was committed.
    Persisted(SimulationResult),
    /// The user churned; only the churn event was recorded.
    Churned(ChurnEvent),
}

/// Collaborators and tick-wide inputs shared by every step of a tick.
pub struct StepContext<'a, R, P> {
    pub cfg: &'a SimConfig,
    pub repo: &'a R,
    pub predictions: &'a PredictionClient<P>,
    pub content: &'a [ContentItem],
    pub now: DateTime<Utc>,
}

/// Run every phase for `user`.
///
/// Ad debits land in `pool` immediately and are refunded when the step ends
/// without persisting its result (churn or a failed write).
pub async fn step_user<R, P, G>(
    ctx: &StepContext<'_, R, P>,
    rng: &mut G,
    pool: &mut AdPool,
    mut user: User,
) -> Result<StepOutcome, SimError>
where
    R: Repository,
    P: Predictor,
    G: Rng + ?Sized,
{
    let cfg = ctx.cfg;
    let now = ctx.now;
    user.clamp_scores();
    let mut result = SimulationResult::new(&user, now);

    let mut phase = StepPhase::LoadInputs;
    let mut hood = match ctx
        .repo
        .load_network(&user.id, cfg.network.candidates_per_step)
        .await
    {
        Ok(h) => h,
        Err(error) => {
            warn!(user = %user.id, ?phase, %error, "network read failed, skipping growth");
            Neighborhood::default()
        }
    };

    phase = StepPhase::RunAuction;
    debug!(user = %user.id, ?phase);
    result.placements =
        run_auction(&cfg.auction, ctx.predictions, &user, pool, cfg.ad_slots, now).await;

    phase = StepPhase::ApplyInteractions;
    debug!(user = %user.id, ?phase);
    let b = &cfg.behavior;
    let mut to_report: Vec<ReportTarget> = Vec::new();
    for placement in &mut result.placements {
        placement.clicked = bernoulli(rng, placement.predicted_ctr);
        if placement.clicked {
            nudge_unit(&mut user.satisfaction, b.click_satisfaction_delta);
            nudge_unit(&mut user.engagement_rate, b.click_engagement_delta);
            user.clicks_last_24h = user.clicks_last_24h.saturating_add(1);
        } else {
            nudge_unit(&mut user.satisfaction, b.ignore_satisfaction_delta);
        }
        if let Some(ad) = pool.get(&placement.ad_id) {
            if bernoulli(rng, report_probability(b, &user, ReportSubject::Ad(ad))) {
                to_report.push(ReportTarget::ad(&ad.id));
            }
        }
    }

    let feed = ctx.predictions.feed(&user, ctx.content, now).await;
    let k = b.feed_smoothing;
    user.avg_scroll_depth += k * (feed.scroll_depth - user.avg_scroll_depth);
    user.avg_watch_time += k * (feed.time_spent - user.avg_watch_time);

    for item in ctx.content {
        let predicted = ctx.predictions.content(&user, item, now).await;
        result.recommendations.push(ContentRecommendation {
            content_id: item.id.clone(),
            score: predicted.engagement_score,
            reason: RecommendationReason {
                user_interests: user.preferences.topics.clone(),
                engagement_history: user.content_interactions,
            },
        });
        let p = blend(interaction_probability(b, &user, item), predicted.interaction_prob);
        if !bernoulli(rng, p) {
            continue;
        }
        user.content_interactions = user.content_interactions.saturating_add(1);
        nudge_unit(&mut user.engagement_rate, b.interaction_engagement_delta);
        if item.content_type == ContentType::Video {
            // running mean over video views only
            let seen = f64::from(user.video_views);
            user.video_views = user.video_views.saturating_add(1);
            user.video_completion_rate =
                (user.video_completion_rate * seen + predicted.completion_prob) / (seen + 1.0);
        }
        result.interactions.push(ContentInteraction {
            content_id: item.id.clone(),
            kind: interaction_kind(rng),
            engagement_score: predicted.engagement_score,
        });
        if bernoulli(rng, report_probability(b, &user, ReportSubject::Content(item))) {
            to_report.push(ReportTarget::content(item));
        }
    }
    user.clamp_scores();
    result.session = UserSession {
        length_secs: feed.time_spent,
        avg_scroll_depth: user.avg_scroll_depth,
        avg_watch_time: user.avg_watch_time,
        clicks: result.clicks() as u32,
    };

    phase = StepPhase::RunModeration;
    debug!(user = %user.id, ?phase, reports = to_report.len());
    for target in to_report {
        let filed = match file_report(&cfg.moderation, rng, &user, target, now) {
            Ok(f) => f,
            Err(error) => {
                pool.refund(&result.placements);
                return Err(error.into());
            }
        };
        result.reports.push(filed.report);
        result.actions.push(filed.action);
        result.flags.extend(filed.flag);
    }

    phase = StepPhase::GrowNetwork;
    debug!(user = %user.id, ?phase, candidates = hood.candidates.len());
    result.connections = grow_network(&cfg.network, rng, &mut user, &mut hood, now);

    phase = StepPhase::EvaluateChurn;
    debug!(user = %user.id, ?phase);
    user.clamp_scores();
    let p_churn = churn_probability(b, &user);
    if bernoulli(rng, p_churn) {
        pool.refund(&result.placements);
        let event = ChurnEvent {
            user_id: user.id.clone(),
            reason: churn_reason(b, &user),
            probability: p_churn,
            satisfaction: user.satisfaction,
            at: now,
        };
        ctx.repo.record_churn(&event).await?;
        debug!(user = %user.id, reason = %event.reason, p = p_churn, "user churned");
        return Ok(StepOutcome::Churned(event));
    }

    phase = StepPhase::Persist;
    debug!(user = %user.id, ?phase);
    result.metrics = user.snapshot();
    if let Err(error) = ctx.repo.persist_step_result(&result).await {
        pool.refund(&result.placements);
        return Err(error.into());
    }
    Ok(StepOutcome::Persisted(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ad, item, user};
    use persistence::memory::MemoryRepository;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rust_decimal::Decimal;
    use sim_core::{BehaviorConfig, UserId};
    use sim_predict::{ContentPrediction, CtrPrediction, FeedPrediction, FixedPredictor};

    const EPS: f64 = 1e-9;

    /// No reports, no churn, and interactions decided by `interact`.
    fn certain_config(interact: bool) -> SimConfig {
        let base = if interact { 1.0 } else { 0.0 };
        SimConfig {
            ad_slots: 1,
            behavior: BehaviorConfig {
                interaction_base: base,
                topic_boost: 0.0,
                content_type_boost: 0.0,
                engagement_weight: 0.0,
                report_base: 0.0,
                report_satisfaction_weight: 0.0,
                report_engagement_weight: 0.0,
                churn_base: 0.0,
                churn_satisfaction_weight: 0.0,
                churn_engagement_weight: 0.0,
                churn_density_weight: 0.0,
                ..BehaviorConfig::default()
            },
            ..SimConfig::default()
        }
    }

    fn predictor(ctr: f64, interaction_prob: f64) -> FixedPredictor {
        FixedPredictor::new(
            CtrPrediction { ctr },
            ContentPrediction {
                interaction_prob,
                completion_prob: 0.9,
                engagement_score: 0.7,
            },
            FeedPrediction {
                engagement_prob: 0.3,
                scroll_depth: 1.0,
                time_spent: 80.0,
            },
        )
    }

    async fn persisted(
        cfg: &SimConfig,
        predictor: FixedPredictor,
        u: User,
        content: &[ContentItem],
        pool: &mut AdPool,
    ) -> SimulationResult {
        // a lone user has no candidates, so the network stays put
        let repo = MemoryRepository::new()
            .with_users([u.clone()])
            .with_ads([ad("a1", Decimal::ONE, Decimal::TEN)]);
        let predictions = PredictionClient::new(predictor);
        let ctx = StepContext {
            cfg,
            repo: &repo,
            predictions: &predictions,
            content,
            now: Utc::now(),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        match step_user(&ctx, &mut rng, pool, u).await.unwrap() {
            StepOutcome::Persisted(result) => result,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn click_raises_satisfaction_and_engagement() {
        let cfg = certain_config(false);
        let mut pool = AdPool::new(vec![ad("a1", Decimal::ONE, Decimal::TEN)]);
        let r = persisted(&cfg, predictor(1.0, 0.0), user("u1"), &[], &mut pool).await;

        assert_eq!(r.placements.len(), 1);
        assert!(r.placements[0].clicked);
        let m = &r.metrics;
        assert!((m.satisfaction - 0.62).abs() < EPS);
        assert!((m.engagement_rate - 0.41).abs() < EPS);
        assert_eq!(m.clicks_last_24h, 1);
        assert_eq!(r.session.clicks, 1);
        assert_eq!(pool.get(&"a1".into()).unwrap().budget, Decimal::new(92, 1));
    }

    #[tokio::test]
    async fn ignored_ad_costs_satisfaction() {
        let cfg = certain_config(false);
        let mut pool = AdPool::new(vec![ad("a1", Decimal::ONE, Decimal::TEN)]);
        let r = persisted(&cfg, predictor(0.0, 0.0), user("u1"), &[], &mut pool).await;

        assert!(!r.placements[0].clicked);
        let m = &r.metrics;
        assert!((m.satisfaction - 0.59).abs() < EPS);
        assert!((m.engagement_rate - 0.4).abs() < EPS);
        assert_eq!(m.clicks_last_24h, 0);
        assert_eq!(r.session.clicks, 0);
    }

    #[tokio::test]
    async fn feed_prediction_is_smoothed_into_session() {
        let cfg = certain_config(false);
        let mut pool = AdPool::new(Vec::new());
        let r = persisted(&cfg, predictor(0.0, 0.0), user("u1"), &[], &mut pool).await;

        // 0.5 + 0.2 * (1.0 - 0.5), 30 + 0.2 * (80 - 30)
        assert!((r.metrics.avg_scroll_depth - 0.6).abs() < EPS);
        assert!((r.metrics.avg_watch_time - 40.0).abs() < EPS);
        assert_eq!(r.session.length_secs, 80.0);
        assert!((r.session.avg_scroll_depth - 0.6).abs() < EPS);
        assert!((r.session.avg_watch_time - 40.0).abs() < EPS);
        assert!(r.placements.is_empty());
        assert!((r.metrics.satisfaction - 0.6).abs() < EPS);
    }

    #[tokio::test]
    async fn interactions_update_engagement_and_video_average() {
        let cfg = certain_config(true);
        let mut u = user("u1");
        u.content_interactions = 50;
        u.video_views = 1;
        let mut video = item("v1", "sports");
        video.content_type = ContentType::Video;
        video.completion_rate = Some(0.5);
        let content = [item("c1", "news"), video];
        let mut pool = AdPool::new(Vec::new());
        let r = persisted(&cfg, predictor(0.0, 1.0), u, &content, &mut pool).await;

        let m = &r.metrics;
        assert_eq!(m.content_interactions, 52);
        assert_eq!(m.video_views, 2);
        assert!((m.engagement_rate - 0.41).abs() < EPS);
        // text interactions do not dilute the video mean: (0.5 * 1 + 0.9) / 2
        assert!((m.video_completion_rate - 0.7).abs() < EPS);
        assert_eq!(r.interactions.len(), 2);
        assert!(r.interactions.iter().all(|i| i.engagement_score == 0.7));

        let history: Vec<u32> = r
            .recommendations
            .iter()
            .map(|c| c.reason.engagement_history)
            .collect();
        assert_eq!(history, vec![50, 51]);
        assert_eq!(r.recommendations[0].reason.user_interests, vec!["news".to_string()]);
        assert!(r.recommendations.iter().all(|c| c.score == 0.7));
    }

    #[tokio::test]
    async fn skipped_content_is_still_recommended() {
        let cfg = certain_config(false);
        let content = [item("c1", "news"), item("c2", "music")];
        let mut pool = AdPool::new(Vec::new());
        let r = persisted(&cfg, predictor(0.0, 0.0), user("u1"), &content, &mut pool).await;

        assert!(r.interactions.is_empty());
        assert_eq!(r.recommendations.len(), 2);
        assert_eq!(r.metrics.content_interactions, 0);
        assert!((r.metrics.engagement_rate - 0.4).abs() < EPS);
        assert!((r.metrics.video_completion_rate - 0.5).abs() < EPS);
    }

    #[tokio::test]
    async fn failed_persist_refunds_debits() {
        let cfg = certain_config(false);
        let repo = MemoryRepository::new()
            .with_users([user("u1")])
            .fail_persist_for(UserId::from("u1"));
        let predictions = PredictionClient::new(predictor(1.0, 0.0));
        let ctx = StepContext {
            cfg: &cfg,
            repo: &repo,
            predictions: &predictions,
            content: &[],
            now: Utc::now(),
        };
        let mut pool = AdPool::new(vec![ad("a1", Decimal::ONE, Decimal::TEN)]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(step_user(&ctx, &mut rng, &mut pool, user("u1")).await.is_err());
        assert_eq!(pool.get(&"a1".into()).unwrap().budget, Decimal::TEN);
    }
}
