//! Step engine for the feed simulator.
//!
//! Sequences the auction, behavior model, moderation pipeline and network
//! growth for one user at a time, commits each user's result atomically, and
//! drives ticks until asked to stop.

pub mod metrics;
pub mod moderation;
pub mod network;
pub mod step;
pub mod tick;

pub use metrics::{MetricsSink, SimMetrics, TickSummary};
pub use moderation::{file_report, Filed};
pub use network::grow_network;
pub use step::{step_user, StepContext, StepOutcome, StepPhase};
pub use tick::{Simulator, StopFlag};

use rand::Rng;
use uuid::Uuid;

/// Random v4 id drawn from the simulator's RNG, so runs replay with a seed.
pub(crate) fn new_id<R: Rng + ?Sized>(rng: &mut R) -> Uuid {
    uuid::Builder::from_random_bytes(rng.gen()).into_uuid()
}

#[cfg(test)]
pub(crate) mod testing {
    use rust_decimal::Decimal;
    use sim_core::{
        Ad, AdCategory, ContentItem, ContentType, ContentTypePreference, Device, Preferences,
        TargetMetrics, User, UserId, UserStatus,
    };

    pub fn user(id: &str) -> User {
        User {
            id: UserId::from(id),
            username: format!("{id}_name"),
            age: 27,
            region: "Europe".into(),
            device: Device::Mobile,
            persona_id: 1,
            status: UserStatus::Active,
            satisfaction: 0.6,
            engagement_rate: 0.4,
            network_density: 0.3,
            influence_score: 1.0,
            avg_scroll_depth: 0.5,
            avg_watch_time: 30.0,
            clicks_last_24h: 0,
            content_interactions: 0,
            video_views: 0,
            video_completion_rate: 0.5,
            follower_count: 0,
            following_count: 0,
            preferences: Preferences {
                topics: vec!["news".into()],
                content_type: ContentTypePreference::All,
                categories: vec![AdCategory::Technology],
            },
        }
    }

    pub fn ad(id: &str, bid: Decimal, budget: Decimal) -> Ad {
        Ad {
            id: id.into(),
            title: format!("{id} title"),
            bid,
            budget,
            category: AdCategory::Travel,
            target: TargetMetrics::default(),
        }
    }

    pub fn item(id: &str, topic: &str) -> ContentItem {
        ContentItem {
            id: id.into(),
            content_type: ContentType::Post,
            topic: topic.into(),
            reply_count: 2,
            retweet_count: 1,
            quote_count: 0,
            completion_rate: None,
            watch_time_seconds: None,
            loop_count: None,
        }
    }
}
