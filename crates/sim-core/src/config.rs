//! Step-wide tunables, supplied once at process start.
//!
//! Every field has a default; a YAML file may override any subset and a small
//! set of environment variables is applied on top.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;

/// Top-level simulation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed for the deterministic RNG.
    pub rng_seed: u64,
    /// Repository location, e.g. `sqlite://./data/feedsim.db`.
    pub database_url: String,
    pub users_per_tick: usize,
    pub ads_per_tick: usize,
    pub content_per_tick: usize,
    /// Feed slots auctioned per user.
    pub ad_slots: usize,
    /// Pause between ticks.
    pub step_interval_ms: u64,
    /// Ticks to run when the caller does not say otherwise.
    pub ticks: u64,
    pub behavior: BehaviorConfig,
    pub auction: AuctionConfig,
    pub network: NetworkConfig,
    pub moderation: ModerationConfig,
    pub endpoints: EndpointConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            rng_seed: 42,
            database_url: "sqlite://./data/feedsim.db".to_string(),
            users_per_tick: 5,
            ads_per_tick: 10,
            content_per_tick: 10,
            ad_slots: 3,
            step_interval_ms: 1000,
            ticks: 100,
            behavior: BehaviorConfig::default(),
            auction: AuctionConfig::default(),
            network: NetworkConfig::default(),
            moderation: ModerationConfig::default(),
            endpoints: EndpointConfig::default(),
        }
    }
}

/// Weights of the random behavior model and per-event metric deltas.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub interaction_base: f64,
    pub topic_boost: f64,
    pub content_type_boost: f64,
    pub engagement_weight: f64,
    pub report_base: f64,
    pub report_satisfaction_weight: f64,
    pub report_engagement_weight: f64,
    /// Multiplier applied to report probability for preferred items.
    pub preferred_report_discount: f64,
    pub churn_base: f64,
    pub churn_satisfaction_weight: f64,
    pub churn_engagement_weight: f64,
    pub churn_density_weight: f64,
    pub click_satisfaction_delta: f64,
    pub click_engagement_delta: f64,
    pub ignore_satisfaction_delta: f64,
    pub interaction_engagement_delta: f64,
    /// Fraction of the gap to the feed model's prediction closed per step.
    pub feed_smoothing: f64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            interaction_base: 0.3,
            topic_boost: 0.2,
            content_type_boost: 0.1,
            engagement_weight: 0.2,
            report_base: 0.1,
            report_satisfaction_weight: 0.3,
            report_engagement_weight: 0.1,
            preferred_report_discount: 0.8,
            churn_base: 0.01,
            churn_satisfaction_weight: 0.5,
            churn_engagement_weight: 0.3,
            churn_density_weight: 0.2,
            click_satisfaction_delta: 0.02,
            click_engagement_delta: 0.01,
            ignore_satisfaction_delta: -0.01,
            interaction_engagement_delta: 0.005,
            feed_smoothing: 0.2,
        }
    }
}

/// Auction scoring and budget consumption.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionConfig {
    /// Smallest debit an ad can pay; ads below it are ineligible.
    pub min_spend_unit: Decimal,
    /// Share of the bid charged per impression, in (0, 1].
    pub spend_fraction: Decimal,
    pub preferred_category_boost: f64,
    /// A threshold cleared by less than this is "marginally met".
    pub marginal_band: f64,
    pub marginal_penalty: f64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            min_spend_unit: Decimal::new(1, 2),
            spend_fraction: Decimal::new(8, 1),
            preferred_category_boost: 1.2,
            marginal_band: 0.05,
            marginal_penalty: 0.9,
        }
    }
}

/// Connection formation and metric increments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub base_probability: f64,
    pub density_weight: f64,
    pub influence_divisor: f64,
    pub density_increment: f64,
    pub influence_increment: f64,
    pub candidates_per_step: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_probability: 0.1,
            density_weight: 0.2,
            influence_divisor: 20.0,
            density_increment: 0.05,
            influence_increment: 0.1,
            candidates_per_step: 20,
        }
    }
}

/// Moderation pipeline tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub min_severity: f64,
    pub max_severity: f64,
    pub flag_duration_hours: i64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            min_severity: 0.3,
            max_severity: 1.0,
            flag_duration_hours: 24,
        }
    }
}

/// Prediction service endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub ctr: String,
    pub content: String,
    pub feed: String,
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        let base = "http://localhost:8000";
        Self {
            ctr: format!("{base}/api/ads/predict/ctr"),
            content: format!("{base}/api/content/predict"),
            feed: format!("{base}/api/content/predict/feed"),
            timeout_ms: 2000,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ValidationError> {
    raw.trim()
        .parse()
        .map_err(|_| ValidationError::Config(format!("{key}={raw} cannot be parsed")))
}

fn unit(name: &str, v: f64) -> Result<(), ValidationError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(ValidationError::Config(format!("{name} must be in [0,1], got {v}")))
    }
}

fn non_negative(name: &str, v: f64) -> Result<(), ValidationError> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::Config(format!("{name} must be >= 0, got {v}")))
    }
}

impl SimConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ValidationError> {
        let cfg: SimConfig =
            serde_yaml::from_str(text).map_err(|e| ValidationError::Config(e.to_string()))?;
        Ok(cfg)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ValidationError> {
        self.apply_env_with(|k| std::env::var(k).ok())
    }

    /// Apply overrides from an arbitrary lookup; testable without touching
    /// the real environment.
    pub fn apply_env_with<F>(&mut self, get: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| -> Option<String> {
            let v = get(key).filter(|v| !v.trim().is_empty());
            if v.is_some() {
                debug!(key, "config override from environment");
            }
            v
        };
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("SIM_SEED") {
            self.rng_seed = parse_env("SIM_SEED", &v)?;
        }
        if let Some(v) = lookup("NUM_USERS_PER_STEP") {
            self.users_per_tick = parse_env("NUM_USERS_PER_STEP", &v)?;
        }
        if let Some(v) = lookup("NUM_ADS_PER_STEP") {
            self.ads_per_tick = parse_env("NUM_ADS_PER_STEP", &v)?;
        }
        if let Some(v) = lookup("NUM_CONTENT_PER_STEP") {
            self.content_per_tick = parse_env("NUM_CONTENT_PER_STEP", &v)?;
        }
        if let Some(v) = lookup("STEP_INTERVAL_MS") {
            self.step_interval_ms = parse_env("STEP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("REPORT_PROBABILITY") {
            self.behavior.report_base = parse_env("REPORT_PROBABILITY", &v)?;
        }
        if let Some(v) = lookup("CHURN_BASE_PROBABILITY") {
            self.behavior.churn_base = parse_env("CHURN_BASE_PROBABILITY", &v)?;
        }
        if let Some(v) = lookup("INTERACTION_BASE_PROBABILITY") {
            self.behavior.interaction_base = parse_env("INTERACTION_BASE_PROBABILITY", &v)?;
        }
        if let Some(v) = lookup("CTR_ENDPOINT") {
            self.endpoints.ctr = v;
        }
        if let Some(v) = lookup("CONTENT_ENDPOINT") {
            self.endpoints.content = v;
        }
        if let Some(v) = lookup("FEED_RANKING_ENDPOINT") {
            self.endpoints.feed = v;
        }
        Ok(())
    }

    /// Reject configurations the step engine cannot honor.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ad_slots == 0 {
            return Err(ValidationError::Config("ad_slots must be > 0".into()));
        }
        let b = &self.behavior;
        unit("behavior.interaction_base", b.interaction_base)?;
        unit("behavior.report_base", b.report_base)?;
        unit("behavior.churn_base", b.churn_base)?;
        unit("behavior.preferred_report_discount", b.preferred_report_discount)?;
        unit("behavior.feed_smoothing", b.feed_smoothing)?;
        for (name, w) in [
            ("behavior.topic_boost", b.topic_boost),
            ("behavior.content_type_boost", b.content_type_boost),
            ("behavior.engagement_weight", b.engagement_weight),
            ("behavior.report_satisfaction_weight", b.report_satisfaction_weight),
            ("behavior.report_engagement_weight", b.report_engagement_weight),
            ("behavior.churn_satisfaction_weight", b.churn_satisfaction_weight),
            ("behavior.churn_engagement_weight", b.churn_engagement_weight),
            ("behavior.churn_density_weight", b.churn_density_weight),
        ] {
            non_negative(name, w)?;
        }

        let a = &self.auction;
        if a.min_spend_unit <= Decimal::ZERO {
            return Err(ValidationError::Config(
                "auction.min_spend_unit must be > 0".into(),
            ));
        }
        if a.spend_fraction <= Decimal::ZERO || a.spend_fraction > Decimal::ONE {
            return Err(ValidationError::Config(
                "auction.spend_fraction must be in (0, 1]".into(),
            ));
        }
        non_negative("auction.preferred_category_boost", a.preferred_category_boost)?;
        non_negative("auction.marginal_band", a.marginal_band)?;
        unit("auction.marginal_penalty", a.marginal_penalty)?;

        let n = &self.network;
        unit("network.base_probability", n.base_probability)?;
        non_negative("network.density_weight", n.density_weight)?;
        if !(n.influence_divisor.is_finite() && n.influence_divisor > 0.0) {
            return Err(ValidationError::Config(
                "network.influence_divisor must be > 0".into(),
            ));
        }
        non_negative("network.density_increment", n.density_increment)?;
        non_negative("network.influence_increment", n.influence_increment)?;

        let m = &self.moderation;
        unit("moderation.min_severity", m.min_severity)?;
        unit("moderation.max_severity", m.max_severity)?;
        if m.min_severity > m.max_severity {
            return Err(ValidationError::Config(
                "moderation.min_severity exceeds max_severity".into(),
            ));
        }
        if m.flag_duration_hours <= 0 {
            return Err(ValidationError::Config(
                "moderation.flag_duration_hours must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = SimConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.auction.min_spend_unit, Decimal::new(1, 2));
        assert_eq!(cfg.moderation.flag_duration_hours, 24);
    }

    #[test]
    fn yaml_overrides_subset() {
        let cfg = SimConfig::from_yaml_str(
            "users_per_tick: 50\nbehavior:\n  churn_base: 0.2\nauction:\n  min_spend_unit: \"0.05\"\n",
        )
        .unwrap();
        assert_eq!(cfg.users_per_tick, 50);
        assert_eq!(cfg.ads_per_tick, 10);
        assert!((cfg.behavior.churn_base - 0.2).abs() < 1e-12);
        assert!((cfg.behavior.report_base - 0.1).abs() < 1e-12);
        assert_eq!(cfg.auction.min_spend_unit, Decimal::new(5, 2));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("NUM_USERS_PER_STEP", "7"),
            ("CHURN_BASE_PROBABILITY", "0.5"),
            ("CTR_ENDPOINT", "http://ctr:8001/predict"),
            ("CONTENT_ENDPOINT", "  "),
        ]
        .into_iter()
        .collect();
        let mut cfg = SimConfig::default();
        cfg.apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.users_per_tick, 7);
        assert!((cfg.behavior.churn_base - 0.5).abs() < 1e-12);
        assert_eq!(cfg.endpoints.ctr, "http://ctr:8001/predict");
        assert_eq!(cfg.endpoints.content, EndpointConfig::default().content);
    }

    #[test]
    fn env_parse_failure_is_reported() {
        let mut cfg = SimConfig::default();
        let err = cfg
            .apply_env_with(|k| (k == "NUM_ADS_PER_STEP").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Config(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = SimConfig::default();
        cfg.behavior.churn_base = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = SimConfig::default();
        cfg.auction.spend_fraction = Decimal::new(15, 1);
        assert!(cfg.validate().is_err());

        let mut cfg = SimConfig::default();
        cfg.ad_slots = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SimConfig::default();
        cfg.moderation.min_severity = 0.9;
        cfg.moderation.max_severity = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shipped_profile_parses_and_validates() {
        let cfg = SimConfig::from_yaml_str(include_str!("../../../config/sim.yaml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.auction.spend_fraction, Decimal::new(8, 1));
        assert_eq!(cfg.network.candidates_per_step, 20);
    }
}
