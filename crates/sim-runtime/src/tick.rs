//! Tick loop: load inputs once, step each user in turn, summarize.

use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sim_auction::AdPool;
use sim_core::{Repository, SimConfig};
use sim_predict::{PredictionClient, Predictor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};

use crate::metrics::{MetricsSink, TickSummary};
use crate::step::{step_user, StepContext, StepOutcome};

/// Cooperative stop signal, checked between ticks only.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns the collaborators, the RNG and the metrics sink for a run.
pub struct Simulator<R, P, M> {
    cfg: SimConfig,
    repo: R,
    predictions: PredictionClient<P>,
    metrics: M,
    rng: ChaCha8Rng,
    tick: u64,
}

impl<R, P, M> Simulator<R, P, M>
where
    R: Repository,
    P: Predictor,
    M: MetricsSink,
{
    /// `cfg` is expected to be validated already.
    pub fn new(cfg: SimConfig, repo: R, predictor: P, metrics: M) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(cfg.rng_seed);
        Self {
            cfg,
            repo,
            predictions: PredictionClient::new(predictor),
            metrics,
            rng,
            tick: 0,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn predictions(&self) -> &PredictionClient<P> {
        &self.predictions
    }

    pub fn metrics(&self) -> &M {
        &self.metrics
    }

    pub fn into_metrics(self) -> M {
        self.metrics
    }

    /// Ticks completed so far.
    pub fn ticks_run(&self) -> u64 {
        self.tick
    }

    /// Run one tick over up to `users_per_tick` active users.
    ///
    /// Read failures degrade to empty inputs. A failed user step is counted
    /// and logged; it never stops the tick.
    pub async fn run_tick(&mut self) -> TickSummary {
        self.tick += 1;
        let span = info_span!("tick", tick = self.tick);
        let summary = self.run_tick_inner().instrument(span).await;
        self.metrics.record_tick(&summary);
        summary
    }

    async fn run_tick_inner(&mut self) -> TickSummary {
        let started = Instant::now();
        let now = Utc::now();
        let cfg = &self.cfg;
        let mut summary = TickSummary::new(self.tick);

        let users = self
            .repo
            .load_active_users(cfg.users_per_tick)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, "loading users failed, tick has no users");
                Vec::new()
            });
        let ads = self
            .repo
            .load_budgeted_ads(cfg.ads_per_tick, cfg.auction.min_spend_unit)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, "loading ads failed, running without ads");
                Vec::new()
            });
        let content = self
            .repo
            .load_recent_content(cfg.content_per_tick)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, "loading content failed, running without content");
                Vec::new()
            });

        let mut pool = AdPool::new(ads);
        let ctx = StepContext {
            cfg,
            repo: &self.repo,
            predictions: &self.predictions,
            content: &content,
            now,
        };
        for user in users {
            summary.users += 1;
            let user_id = user.id.clone();
            let span = info_span!("step", user = %user_id);
            match step_user(&ctx, &mut self.rng, &mut pool, user)
                .instrument(span)
                .await
            {
                Ok(StepOutcome::Persisted(result)) => summary.absorb(&result),
                Ok(StepOutcome::Churned(_)) => summary.churned += 1,
                Err(error) => {
                    summary.failed += 1;
                    warn!(user = %user_id, %error, "user step failed, skipped");
                }
            }
        }

        summary.active_flags = self
            .repo
            .count_active_flags(now)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, "counting active flags failed");
                0
            });
        summary.prediction_fallbacks = self.predictions.take_fallbacks();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        summary.log();
        summary
    }

    /// Run up to `ticks` ticks, pausing `step_interval_ms` between them.
    ///
    /// Returns the number of ticks completed by this call. `stop` is honored
    /// before each tick; an in-flight tick always finishes.
    pub async fn run(&mut self, ticks: u64, stop: &StopFlag) -> u64 {
        let interval = Duration::from_millis(self.cfg.step_interval_ms);
        let mut done = 0;
        info!(ticks, interval_ms = self.cfg.step_interval_ms, "simulation starting");
        while done < ticks {
            if stop.is_stopped() {
                info!(done, "stop requested");
                break;
            }
            self.run_tick().await;
            done += 1;
            if done < ticks && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        info!(done, "simulation finished");
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SimMetrics;
    use crate::testing::{ad, item, user};
    use persistence::memory::MemoryRepository;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use sim_core::{AdId, BehaviorConfig, ReportStatus, UserId, UserStatus};
    use sim_predict::{ContentPrediction, CtrPrediction, FeedPrediction, FixedPredictor};

    fn quiet_config() -> SimConfig {
        SimConfig {
            users_per_tick: 10,
            ads_per_tick: 10,
            content_per_tick: 10,
            ad_slots: 2,
            step_interval_ms: 0,
            behavior: BehaviorConfig {
                churn_base: 0.0,
                churn_satisfaction_weight: 0.0,
                churn_engagement_weight: 0.0,
                churn_density_weight: 0.0,
                ..BehaviorConfig::default()
            },
            ..SimConfig::default()
        }
    }

    fn seeded_repo(n_users: usize) -> MemoryRepository {
        MemoryRepository::new()
            .with_users((0..n_users).map(|i| user(&format!("u{i}"))))
            .with_ads([
                ad("a1", Decimal::ONE, Decimal::new(50, 0)),
                ad("a2", Decimal::TWO, Decimal::new(50, 0)),
            ])
            .with_content([item("c1", "news"), item("c2", "music")])
    }

    #[tokio::test]
    async fn churned_user_persists_no_metrics() {
        let cfg = SimConfig {
            behavior: BehaviorConfig {
                churn_base: 1.0,
                ..BehaviorConfig::default()
            },
            ..quiet_config()
        };
        let mut u = user("u1");
        u.satisfaction = 0.1;
        u.engagement_rate = 0.1;
        let repo = MemoryRepository::new()
            .with_users([u.clone()])
            .with_ads([ad("a1", Decimal::ONE, Decimal::new(5, 0))]);
        let mut sim = Simulator::new(cfg, repo, FixedPredictor::default(), SimMetrics::default());
        let summary = sim.run_tick().await;
        assert_eq!(summary.churned, 1);
        assert_eq!(summary.persisted, 0);

        let state = sim.repo().snapshot().await;
        let stored = &state.users[&UserId::from("u1")];
        assert_eq!(stored.status, UserStatus::Inactive);
        assert_eq!(stored.satisfaction, 0.1);
        assert_eq!(state.step_results, 0);
        assert!(state.impressions.is_empty());
        assert!(state.reports.is_empty());
        assert_eq!(state.churn_events.len(), 1);
        // debits of a churned user are not kept
        assert_eq!(state.ads[&AdId::from("a1")].budget, Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn unreachable_models_still_complete_the_tick() {
        let mut sim = Simulator::new(
            quiet_config(),
            seeded_repo(4),
            FixedPredictor::unreachable(),
            SimMetrics::default(),
        );
        let summary = sim.run_tick().await;
        assert_eq!(summary.users, 4);
        assert_eq!(summary.persisted, 4);
        assert_eq!(summary.failed, 0);
        assert!(summary.prediction_fallbacks > 0);
        let state = sim.repo().snapshot().await;
        for (_, placement) in &state.impressions {
            assert_eq!(placement.predicted_ctr, 0.05);
        }
        for (_, interaction) in &state.interactions {
            assert_eq!(interaction.engagement_score, 0.5);
        }
        assert_eq!(state.sessions.len(), 4);
        assert!(state.sessions.iter().all(|(_, s)| s.length_secs == 60.0));
        assert_eq!(state.recommendations.len(), 4 * 2);
        assert_eq!(summary.recommendations, 8);
        assert!(summary.avg_satisfaction > 0.0);
    }

    #[tokio::test]
    async fn persistence_failure_is_isolated_to_one_user() {
        let repo = seeded_repo(3).fail_persist_for(UserId::from("u1"));
        let mut sim = Simulator::new(
            quiet_config(),
            repo,
            FixedPredictor::default(),
            SimMetrics::default(),
        );
        let summary = sim.run_tick().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.persisted, 2);
        let state = sim.repo().snapshot().await;
        assert!(state.impressions.iter().all(|(u, _)| u.as_str() != "u1"));
        let spent: Decimal = state.impressions.iter().map(|(_, p)| p.spend).sum();
        let remaining: Decimal = state.ads.values().map(|a| a.budget).sum();
        assert_eq!(spent + remaining, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn failed_reads_degrade_to_empty_tick() {
        let repo = seeded_repo(3).fail_reads();
        let mut sim = Simulator::new(
            quiet_config(),
            repo,
            FixedPredictor::default(),
            SimMetrics::default(),
        );
        let summary = sim.run_tick().await;
        assert_eq!(summary.users, 0);
        assert_eq!(sim.metrics().ticks, 1);
    }

    #[tokio::test]
    async fn every_step_result_is_consistent() {
        let cfg = SimConfig {
            behavior: BehaviorConfig {
                report_base: 1.0,
                ..quiet_config().behavior
            },
            ..quiet_config()
        };
        let mut sim = Simulator::new(cfg, seeded_repo(5), FixedPredictor::default(), SimMetrics::default());
        sim.run(3, &StopFlag::new()).await;
        let state = sim.repo().snapshot().await;
        assert!(!state.reports.is_empty());
        assert_eq!(state.reports.len(), state.actions.len());
        for action in &state.actions {
            let report = state.reports.iter().find(|r| r.id == action.report_id).unwrap();
            assert_eq!(report.status, action.action_type.terminal_status());
            assert_ne!(report.status, ReportStatus::Pending);
        }
        for flag in &state.flags {
            let action = state.actions.iter().find(|a| a.id == flag.action_id).unwrap();
            assert!(action.action_type.suppresses());
        }
        assert!(state.ads.values().all(|a| a.budget >= Decimal::ZERO));
        // flags from this run expire a day after creation
        assert_eq!(sim.metrics().active_flags, state.flags.len() as u64);
        assert_eq!(sim.metrics().actions, state.actions.len() as u64);
    }

    #[tokio::test]
    async fn stop_flag_is_checked_between_ticks() {
        let mut sim = Simulator::new(
            quiet_config(),
            seeded_repo(1),
            FixedPredictor::default(),
            SimMetrics::default(),
        );
        let stop = StopFlag::new();
        assert_eq!(sim.run(2, &stop).await, 2);
        stop.stop();
        assert_eq!(sim.run(5, &stop).await, 0);
        assert_eq!(sim.ticks_run(), 2);
    }

    #[tokio::test]
    async fn same_seed_same_outcome() {
        async fn clicks(seed: u64) -> u64 {
            let cfg = SimConfig {
                rng_seed: seed,
                ..quiet_config()
            };
            let predictor = FixedPredictor::new(
                CtrPrediction { ctr: 0.5 },
                ContentPrediction::DEFAULT,
                FeedPrediction::DEFAULT,
            );
            let mut sim = Simulator::new(cfg, seeded_repo(6), predictor, SimMetrics::default());
            sim.run(2, &StopFlag::new()).await;
            sim.metrics().clicks * 1_000 + sim.metrics().interactions
        }
        assert_eq!(clicks(7).await, clicks(7).await);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn scores_stay_bounded_after_a_step(
            seed in any::<u64>(),
            sat in 0.0f64..=1.0,
            eng in 0.0f64..=1.0,
            density in 0.0f64..=1.0,
            ctr in 0.0f64..=1.0,
            interaction in 0.0f64..=1.0,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let state = rt.block_on(async {
                let mut u = user("u0");
                u.satisfaction = sat;
                u.engagement_rate = eng;
                u.network_density = density;
                let repo = MemoryRepository::new()
                    .with_users([u, user("u1"), user("u2")])
                    .with_ads([ad("a1", Decimal::ONE, Decimal::new(3, 0))])
                    .with_content([item("c1", "news"), item("c2", "sports")]);
                let predictor = FixedPredictor::new(
                    CtrPrediction { ctr },
                    ContentPrediction { interaction_prob: interaction, ..ContentPrediction::DEFAULT },
                    FeedPrediction::DEFAULT,
                );
                let cfg = SimConfig { rng_seed: seed, ..quiet_config() };
                let mut sim = Simulator::new(cfg, repo, predictor, SimMetrics::default());
                sim.run_tick().await;
                sim.repo().snapshot().await
            });
            for u in state.users.values() {
                prop_assert!(u.validate().is_ok());
            }
            for a in state.ads.values() {
                prop_assert!(a.budget >= Decimal::ZERO);
            }
        }
    }
}
