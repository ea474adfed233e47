//! Prediction calls with graceful fallback.

use chrono::{DateTime, Utc};
use sim_core::{Ad, ContentItem, PredictionError, User};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::wire::{
    ContentPrediction, ContentRequest, CtrPrediction, CtrRequest, FeedPrediction, FeedRequest,
    RequestContext,
};
use crate::Predictor;

/// Wraps a [`Predictor`] so that callers always get a usable score.
///
/// Any transport error, non-2xx status, malformed or out-of-range payload is
/// replaced by the model's static default and counted as a fallback.
pub struct PredictionClient<P> {
    inner: P,
    fallbacks: AtomicU64,
}

impl<P: Predictor> PredictionClient<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Predicted click-through rate for `ad` shown at `position`.
    pub async fn ctr(&self, user: &User, ad: &Ad, position: u32, now: DateTime<Utc>) -> f64 {
        let ctx = RequestContext::new(user, now).at_position(position);
        let request = CtrRequest::new(user, ad, ctx);
        let result = self
            .inner
            .predict_ctr(&request)
            .await
            .and_then(CtrPrediction::check);
        self.or_default(result, CtrPrediction::DEFAULT, user).ctr
    }

    pub async fn content(
        &self,
        user: &User,
        item: &ContentItem,
        now: DateTime<Utc>,
    ) -> ContentPrediction {
        let request = ContentRequest::new(user, item, RequestContext::new(user, now));
        let result = self
            .inner
            .predict_content(&request)
            .await
            .and_then(ContentPrediction::check);
        self.or_default(result, ContentPrediction::DEFAULT, user)
    }

    pub async fn feed(&self, user: &User, feed: &[ContentItem], now: DateTime<Utc>) -> FeedPrediction {
        let request = FeedRequest::new(user, feed, RequestContext::new(user, now));
        let result = self
            .inner
            .predict_feed(&request)
            .await
            .and_then(FeedPrediction::check);
        self.or_default(result, FeedPrediction::DEFAULT, user)
    }

    /// Total fallbacks since construction.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Fallbacks since the previous call; used for per-tick summaries.
    pub fn take_fallbacks(&self) -> u64 {
        self.fallbacks.swap(0, Ordering::Relaxed)
    }

    fn or_default<T>(&self, result: Result<T, PredictionError>, default: T, user: &User) -> T {
        match result {
            Ok(v) => v,
            Err(error) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(user = %user.id, %error, "prediction failed, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedPredictor;
    use rust_decimal::Decimal;
    use sim_core::{AdCategory, AdId, ContentId, ContentType, TargetMetrics};

    fn user() -> User {
        serde_json::from_value(serde_json::json!({
            "id": "u1", "username": "u1", "age": 20, "region": "Europe",
            "device": "desktop", "persona_id": 1, "status": "active",
            "satisfaction": 0.5, "engagement_rate": 0.5, "network_density": 0.5,
            "influence_score": 1.0, "avg_scroll_depth": 0.5, "avg_watch_time": 10.0,
            "clicks_last_24h": 0, "content_interactions": 0, "video_views": 0,
            "video_completion_rate": 0.5, "follower_count": 0, "following_count": 0,
            "preferences": {}
        }))
        .unwrap()
    }

    fn ad() -> Ad {
        Ad {
            id: AdId::from("a1"),
            title: "t".into(),
            bid: Decimal::ONE,
            budget: Decimal::TEN,
            category: AdCategory::Sports,
            target: TargetMetrics::default(),
        }
    }

    fn item() -> ContentItem {
        ContentItem {
            id: ContentId::from("c1"),
            content_type: ContentType::Video,
            topic: "sports".into(),
            reply_count: 1,
            retweet_count: 2,
            quote_count: 3,
            completion_rate: Some(0.7),
            watch_time_seconds: Some(40),
            loop_count: Some(1),
        }
    }

    #[tokio::test]
    async fn unreachable_service_yields_defaults() {
        let client = PredictionClient::new(FixedPredictor::unreachable());
        let now = Utc::now();
        let u = user();
        assert_eq!(client.ctr(&u, &ad(), 1, now).await, 0.05);
        assert_eq!(client.content(&u, &item(), now).await, ContentPrediction::DEFAULT);
        assert_eq!(client.feed(&u, &[item()], now).await, FeedPrediction::DEFAULT);
        assert_eq!(client.fallbacks(), 3);
        assert_eq!(client.take_fallbacks(), 3);
        assert_eq!(client.fallbacks(), 0);
    }

    #[tokio::test]
    async fn out_of_range_payload_falls_back() {
        let fixed = FixedPredictor::new(
            CtrPrediction { ctr: 4.0 },
            ContentPrediction {
                interaction_prob: 0.9,
                completion_prob: 0.8,
                engagement_score: 2.5,
            },
            FeedPrediction::DEFAULT,
        );
        let client = PredictionClient::new(fixed);
        let now = Utc::now();
        let u = user();
        assert_eq!(client.ctr(&u, &ad(), 1, now).await, 0.05);
        let c = client.content(&u, &item(), now).await;
        assert_eq!(c.interaction_prob, 0.9);
        assert_eq!(client.fallbacks(), 1);
        assert_eq!(client.inner().calls(), 2);
    }
}
