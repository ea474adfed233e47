//! Tick summaries and the sink they are reported to.

use rust_decimal::Decimal;
use serde::Serialize;
use sim_core::SimulationResult;
use tracing::info;

/// Counters for one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TickSummary {
    pub tick: u64,
    pub users: u64,
    pub persisted: u64,
    pub churned: u64,
    pub failed: u64,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: Decimal,
    pub interactions: u64,
    pub recommendations: u64,
    pub reports: u64,
    pub actions: u64,
    pub flags: u64,
    /// Unexpired flags in storage once the tick finished.
    pub active_flags: u64,
    pub connections: u64,
    /// Means over the users persisted this tick.
    pub avg_satisfaction: f64,
    pub avg_engagement: f64,
    pub avg_density: f64,
    pub prediction_fallbacks: u64,
    pub elapsed_ms: u64,
}

impl TickSummary {
    pub fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Count a persisted step result.
    pub fn absorb(&mut self, result: &SimulationResult) {
        self.persisted += 1;
        self.impressions += result.placements.len() as u64;
        self.clicks += result.clicks() as u64;
        self.spend += result.spend();
        self.interactions += result.interactions.len() as u64;
        self.recommendations += result.recommendations.len() as u64;
        self.reports += result.reports.len() as u64;
        self.actions += result.actions.len() as u64;
        self.flags += result.flags.len() as u64;
        self.connections += result.connections.len() as u64;

        let n = self.persisted as f64;
        let m = &result.metrics;
        self.avg_satisfaction += (m.satisfaction - self.avg_satisfaction) / n;
        self.avg_engagement += (m.engagement_rate - self.avg_engagement) / n;
        self.avg_density += (m.network_density - self.avg_density) / n;
    }

    /// Click-through rate over this tick's impressions.
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }

    pub fn log(&self) {
        info!(
            tick = self.tick,
            users = self.users,
            persisted = self.persisted,
            churned = self.churned,
            failed = self.failed,
            impressions = self.impressions,
            clicks = self.clicks,
            ctr = self.ctr(),
            spend = %self.spend,
            interactions = self.interactions,
            recommendations = self.recommendations,
            reports = self.reports,
            actions = self.actions,
            flags = self.flags,
            active_flags = self.active_flags,
            connections = self.connections,
            avg_satisfaction = self.avg_satisfaction,
            avg_engagement = self.avg_engagement,
            avg_density = self.avg_density,
            fallbacks = self.prediction_fallbacks,
            elapsed_ms = self.elapsed_ms,
            "tick complete"
        );
    }
}

/// Receives one summary per completed tick.
pub trait MetricsSink {
    fn record_tick(&mut self, summary: &TickSummary);
}

/// Running totals across every tick of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SimMetrics {
    pub ticks: u64,
    pub users: u64,
    pub persisted: u64,
    pub churned: u64,
    pub failed_steps: u64,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: Decimal,
    pub interactions: u64,
    pub recommendations: u64,
    pub reports: u64,
    pub actions: u64,
    pub flags: u64,
    /// As of the last tick.
    pub active_flags: u64,
    pub connections: u64,
    /// Means over every persisted step of the run.
    pub avg_satisfaction: f64,
    pub avg_engagement: f64,
    pub avg_density: f64,
    pub prediction_fallbacks: u64,
    /// Most recent summary, if any tick ran.
    pub last_tick: Option<TickSummary>,
}

impl SimMetrics {
    /// Overall click-through rate.
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }
}

fn pooled_mean(mean: f64, n: u64, tick_mean: f64, tick_n: u64) -> f64 {
    let total = n + tick_n;
    if total == 0 {
        return 0.0;
    }
    (mean * n as f64 + tick_mean * tick_n as f64) / total as f64
}

impl MetricsSink for SimMetrics {
    fn record_tick(&mut self, s: &TickSummary) {
        let before = self.persisted;
        self.avg_satisfaction = pooled_mean(self.avg_satisfaction, before, s.avg_satisfaction, s.persisted);
        self.avg_engagement = pooled_mean(self.avg_engagement, before, s.avg_engagement, s.persisted);
        self.avg_density = pooled_mean(self.avg_density, before, s.avg_density, s.persisted);

        self.ticks += 1;
        self.users += s.users;
        self.persisted += s.persisted;
        self.churned += s.churned;
        self.failed_steps += s.failed;
        self.impressions += s.impressions;
        self.clicks += s.clicks;
        self.spend += s.spend;
        self.interactions += s.interactions;
        self.recommendations += s.recommendations;
        self.reports += s.reports;
        self.actions += s.actions;
        self.flags += s.flags;
        self.active_flags = s.active_flags;
        self.connections += s.connections;
        self.prediction_fallbacks += s.prediction_fallbacks;
        self.last_tick = Some(s.clone());
    }
}

impl<M: MetricsSink + ?Sized> MetricsSink for &mut M {
    fn record_tick(&mut self, summary: &TickSummary) {
        (**self).record_tick(summary);
    }
}
