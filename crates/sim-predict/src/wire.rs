//! JSON request and response bodies exchanged with the scoring services.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sim_core::{
    Ad, AdId, ContentId, ContentItem, ContentType, Device, PredictionError, User, UserId,
};

/// Behavioral features sent with every request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserFeatures {
    pub satisfaction: f64,
    pub engagement_rate: f64,
    pub network_density: f64,
    pub influence_score: f64,
    pub scroll_depth: f64,
    pub watch_time: f64,
    pub clicks_last_24h: u32,
    pub content_interactions: u32,
    pub completion_rate: f64,
}

impl From<&User> for UserFeatures {
    fn from(u: &User) -> Self {
        UserFeatures {
            satisfaction: u.satisfaction,
            engagement_rate: u.engagement_rate,
            network_density: u.network_density,
            influence_score: u.influence_score,
            scroll_depth: u.avg_scroll_depth,
            watch_time: u.avg_watch_time,
            clicks_last_24h: u.clicks_last_24h,
            content_interactions: u.content_interactions,
            completion_rate: u.video_completion_rate,
        }
    }
}

/// When and where the impression happens.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestContext {
    /// 1-based feed slot, ads only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    pub device: Device,
    pub hour: u32,
    /// 0 = Monday.
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub region: String,
}

impl RequestContext {
    pub fn new(user: &User, now: DateTime<Utc>) -> Self {
        let day_of_week = now.weekday().num_days_from_monday();
        RequestContext {
            position: None,
            device: user.device,
            hour: now.hour(),
            day_of_week,
            is_weekend: day_of_week >= 5,
            region: user.region.clone(),
        }
    }

    pub fn at_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdFeatures {
    pub bid: f64,
    pub budget: f64,
    pub category: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CtrRequest {
    pub user_id: UserId,
    pub ad_id: AdId,
    pub user_metrics: UserFeatures,
    pub ad_metrics: AdFeatures,
    pub context: RequestContext,
}

impl CtrRequest {
    pub fn new(user: &User, ad: &Ad, context: RequestContext) -> Self {
        CtrRequest {
            user_id: user.id.clone(),
            ad_id: ad.id.clone(),
            user_metrics: user.into(),
            ad_metrics: AdFeatures {
                bid: ad.bid.to_f64().unwrap_or(0.0),
                budget: ad.budget.to_f64().unwrap_or(0.0),
                category: ad.category.index(),
            },
            context,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContentFeatures {
    pub reply_count: u32,
    pub retweet_count: u32,
    pub quote_count: u32,
    pub completion_rate: f64,
    pub watch_time: u32,
    pub loop_count: u32,
}

impl From<&ContentItem> for ContentFeatures {
    fn from(c: &ContentItem) -> Self {
        ContentFeatures {
            reply_count: c.reply_count,
            retweet_count: c.retweet_count,
            quote_count: c.quote_count,
            completion_rate: c.completion_rate.unwrap_or(0.0),
            watch_time: c.watch_time_seconds.unwrap_or(0),
            loop_count: c.loop_count.unwrap_or(0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContentRequest {
    pub user_id: UserId,
    pub content_id: ContentId,
    pub content_type: ContentType,
    pub user_metrics: UserFeatures,
    pub content_metrics: ContentFeatures,
    pub context: RequestContext,
}

impl ContentRequest {
    pub fn new(user: &User, item: &ContentItem, context: RequestContext) -> Self {
        ContentRequest {
            user_id: user.id.clone(),
            content_id: item.id.clone(),
            content_type: item.content_type,
            user_metrics: user.into(),
            content_metrics: item.into(),
            context,
        }
    }
}

/// Averages over the content shown in this tick's feed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeedFeatures {
    pub avg_reply_count: f64,
    pub avg_retweet_count: f64,
    pub avg_quote_count: f64,
    pub avg_completion: f64,
    pub avg_watch_time: f64,
}

impl FeedFeatures {
    pub fn from_items(items: &[ContentItem]) -> Self {
        if items.is_empty() {
            return FeedFeatures::default();
        }
        FeedFeatures {
            avg_reply_count: mean(items, |c| f64::from(c.reply_count)),
            avg_retweet_count: mean(items, |c| f64::from(c.retweet_count)),
            avg_quote_count: mean(items, |c| f64::from(c.quote_count)),
            avg_completion: mean(items, |c| c.completion_rate.unwrap_or(0.0)),
            avg_watch_time: mean(items, |c| f64::from(c.watch_time_seconds.unwrap_or(0))),
        }
    }
}

fn mean(items: &[ContentItem], f: impl Fn(&ContentItem) -> f64) -> f64 {
    items.iter().map(f).sum::<f64>() / items.len() as f64
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeedRequest {
    pub user_id: UserId,
    pub user_metrics: UserFeatures,
    pub feed_metrics: FeedFeatures,
    pub context: RequestContext,
}

impl FeedRequest {
    pub fn new(user: &User, feed: &[ContentItem], context: RequestContext) -> Self {
        FeedRequest {
            user_id: user.id.clone(),
            user_metrics: user.into(),
            feed_metrics: FeedFeatures::from_items(feed),
            context,
        }
    }
}

fn check_unit(model: &'static str, field: &str, v: f64) -> Result<(), PredictionError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(PredictionError::Malformed {
            model,
            message: format!("{field} = {v} is outside [0, 1]"),
        })
    }
}

fn check_non_negative(model: &'static str, field: &str, v: f64) -> Result<(), PredictionError> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(PredictionError::Malformed {
            model,
            message: format!("{field} = {v} must be finite and >= 0"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CtrPrediction {
    #[serde(alias = "click_probability", alias = "predicted_ctr")]
    pub ctr: f64,
}

impl CtrPrediction {
    pub const MODEL: &'static str = "ctr";
    pub const DEFAULT: CtrPrediction = CtrPrediction { ctr: 0.05 };

    pub fn check(self) -> Result<Self, PredictionError> {
        check_unit(Self::MODEL, "ctr", self.ctr)?;
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentPrediction {
    pub interaction_prob: f64,
    pub completion_prob: f64,
    pub engagement_score: f64,
}

impl ContentPrediction {
    pub const MODEL: &'static str = "content";
    pub const DEFAULT: ContentPrediction = ContentPrediction {
        interaction_prob: 0.3,
        completion_prob: 0.4,
        engagement_score: 0.5,
    };

    pub fn check(self) -> Result<Self, PredictionError> {
        check_unit(Self::MODEL, "interaction_prob", self.interaction_prob)?;
        check_unit(Self::MODEL, "completion_prob", self.completion_prob)?;
        check_non_negative(Self::MODEL, "engagement_score", self.engagement_score)?;
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedPrediction {
    pub engagement_prob: f64,
    pub scroll_depth: f64,
    /// Seconds.
    pub time_spent: f64,
}

impl FeedPrediction {
    pub const MODEL: &'static str = "feed";
    pub const DEFAULT: FeedPrediction = FeedPrediction {
        engagement_prob: 0.3,
        scroll_depth: 0.5,
        time_spent: 60.0,
    };

    pub fn check(self) -> Result<Self, PredictionError> {
        check_unit(Self::MODEL, "engagement_prob", self.engagement_prob)?;
        check_unit(Self::MODEL, "scroll_depth", self.scroll_depth)?;
        check_non_negative(Self::MODEL, "time_spent", self.time_spent)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn ctr_accepts_aliases() {
        for body in [
            r#"{"ctr":0.2}"#,
            r#"{"click_probability":0.2}"#,
            r#"{"predicted_ctr":0.2}"#,
        ] {
            let p: CtrPrediction = serde_json::from_str(body).unwrap();
            assert_eq!(p.ctr, 0.2);
        }
    }

    #[test]
    fn out_of_range_is_malformed() {
        assert!(CtrPrediction { ctr: 1.5 }.check().is_err());
        assert!(CtrPrediction { ctr: f64::NAN }.check().is_err());
        let feed = FeedPrediction {
            time_spent: -1.0,
            ..FeedPrediction::DEFAULT
        };
        assert!(matches!(
            feed.check(),
            Err(PredictionError::Malformed { model: "feed", .. })
        ));
        assert!(ContentPrediction::DEFAULT.check().is_ok());
    }

    #[test]
    fn context_marks_weekend() {
        let user = sim_core::User {
            region: "Oceania".into(),
            ..test_user()
        };
        // 2024-06-01 is a Saturday.
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap();
        let ctx = RequestContext::new(&user, now).at_position(2);
        assert_eq!(ctx.hour, 14);
        assert_eq!(ctx.day_of_week, 5);
        assert!(ctx.is_weekend);
        assert_eq!(ctx.position, Some(2));
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["region"], "Oceania");
        assert_eq!(json["device"], "mobile");
    }

    #[test]
    fn feed_features_average_items() {
        let mut a = test_item("c1");
        a.reply_count = 4;
        a.completion_rate = Some(0.5);
        let mut b = test_item("c2");
        b.reply_count = 2;
        let f = FeedFeatures::from_items(&[a, b]);
        assert_eq!(f.avg_reply_count, 3.0);
        assert_eq!(f.avg_completion, 0.25);
        assert_eq!(FeedFeatures::from_items(&[]), FeedFeatures::default());
    }

    proptest! {
        #[test]
        fn check_accepts_exactly_unit_ctr(ctr in -2.0f64..3.0) {
            let ok = CtrPrediction { ctr }.check().is_ok();
            prop_assert_eq!(ok, (0.0..=1.0).contains(&ctr));
        }
    }

    fn test_user() -> User {
        User {
            id: UserId::from("u1"),
            username: "u1".into(),
            age: 30,
            region: "Europe".into(),
            device: Device::Mobile,
            persona_id: 0,
            status: sim_core::UserStatus::Active,
            satisfaction: 0.5,
            engagement_rate: 0.5,
            network_density: 0.2,
            influence_score: 1.0,
            avg_scroll_depth: 0.5,
            avg_watch_time: 30.0,
            clicks_last_24h: 0,
            content_interactions: 0,
            video_views: 0,
            video_completion_rate: 0.5,
            follower_count: 0,
            following_count: 0,
            preferences: Default::default(),
        }
    }

    fn test_item(id: &str) -> ContentItem {
        ContentItem {
            id: ContentId::from(id),
            content_type: ContentType::Post,
            topic: "news".into(),
            reply_count: 0,
            retweet_count: 0,
            quote_count: 0,
            completion_rate: None,
            watch_time_seconds: None,
            loop_count: None,
        }
    }
}
