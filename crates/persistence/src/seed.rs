//! Demo data for running the simulator end to end.

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use sim_core::{
    Ad, AdCategory, ContentItem, ContentType, ContentTypePreference, Device, PersistenceError,
    Preferences, TargetMetrics, User, UserStatus,
};
use tracing::info;

use crate::sqlite::SqliteRepository;

const REGIONS: &[&str] = &["US", "UK", "IN", "BR", "DE", "FR", "JP", "AU", "CA", "SG"];
const TOPICS: &[&str] = &["tech", "fashion", "gaming", "politics", "memes", "beauty"];

/// How much demo data to generate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeedSpec {
    pub users: usize,
    pub ads: usize,
    pub content: usize,
    pub rng_seed: u64,
}

impl Default for SeedSpec {
    fn default() -> Self {
        Self {
            users: 100,
            ads: 20,
            content: 200,
            rng_seed: 42,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedCounts {
    pub users: usize,
    pub ads: usize,
    pub content: usize,
}

/// Generated rows, not yet written anywhere.
#[derive(Clone, Debug, Default)]
pub struct DemoData {
    pub users: Vec<User>,
    pub ads: Vec<Ad>,
    pub content: Vec<(ContentItem, DateTime<Utc>)>,
}

fn short_id<R: Rng + ?Sized>(rng: &mut R, prefix: &str) -> String {
    let id = uuid::Builder::from_random_bytes(rng.gen()).into_uuid();
    format!("{prefix}-{}", &id.simple().to_string()[..12])
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, from: &'a [&'a str]) -> &'a str {
    from.choose(rng).copied().unwrap_or_default()
}

fn demo_user<R: Rng + ?Sized>(rng: &mut R) -> User {
    let id = short_id(rng, "user");
    let topic_count = rng.gen_range(1..=3);
    let topics = TOPICS
        .choose_multiple(rng, topic_count)
        .map(|t| t.to_string())
        .collect();
    let category_count = rng.gen_range(1..=2);
    let categories = AdCategory::ALL
        .choose_multiple(rng, category_count)
        .copied()
        .collect();
    let content_type = *[
        ContentTypePreference::All,
        ContentTypePreference::Text,
        ContentTypePreference::Video,
    ]
    .choose(rng)
    .unwrap_or(&ContentTypePreference::All);
    User {
        username: id.replace("user-", "u_"),
        id: id.as_str().into(),
        age: rng.gen_range(12..72),
        region: pick(rng, REGIONS).to_string(),
        device: *Device::ALL.choose(rng).unwrap_or(&Device::Mobile),
        persona_id: rng.gen_range(0..20),
        status: UserStatus::Active,
        satisfaction: rng.gen_range(0.4..=1.0),
        engagement_rate: rng.gen_range(0.1..0.8),
        network_density: rng.gen_range(0.0..0.5),
        influence_score: rng.gen_range(0.0..3.0),
        avg_scroll_depth: rng.gen_range(0.2..0.9),
        avg_watch_time: rng.gen_range(5.0..120.0),
        clicks_last_24h: 0,
        content_interactions: 0,
        video_views: 0,
        video_completion_rate: rng.gen_range(0.2..0.9),
        follower_count: 0,
        following_count: 0,
        preferences: Preferences {
            topics,
            content_type,
            categories,
        },
    }
}

fn demo_ad<R: Rng + ?Sized>(rng: &mut R) -> Ad {
    let id = short_id(rng, "ad");
    // roughly a third of campaigns target engaged audiences
    let target = if rng.gen_bool(0.3) {
        TargetMetrics {
            min_satisfaction: rng.gen_range(0.0..0.5),
            min_engagement: rng.gen_range(0.0..0.3),
            min_influence: 0.0,
        }
    } else {
        TargetMetrics::default()
    };
    Ad {
        title: format!("Ad for {id}"),
        id: id.as_str().into(),
        bid: Decimal::new(rng.gen_range(50..=300), 2),
        budget: Decimal::new(rng.gen_range(10_000..=50_000), 2),
        category: *AdCategory::ALL.choose(rng).unwrap_or(&AdCategory::Other),
        target,
    }
}

fn demo_content<R: Rng + ?Sized>(rng: &mut R, now: DateTime<Utc>) -> (ContentItem, DateTime<Utc>) {
    let content_type = *ContentType::ALL.choose(rng).unwrap_or(&ContentType::Post);
    let video = content_type == ContentType::Video;
    let item = ContentItem {
        id: short_id(rng, "content").as_str().into(),
        content_type,
        topic: pick(rng, TOPICS).to_string(),
        reply_count: rng.gen_range(0..50),
        retweet_count: rng.gen_range(0..30),
        quote_count: rng.gen_range(0..10),
        completion_rate: video.then(|| rng.gen_range(0.0..=1.0)),
        watch_time_seconds: video.then(|| rng.gen_range(30..330)),
        loop_count: video.then(|| rng.gen_range(0..5)),
    };
    let age = Duration::days(rng.gen_range(0..30)) + Duration::hours(rng.gen_range(0..24));
    (item, now - age)
}

/// Generate demo rows deterministically from `spec.rng_seed`.
pub fn generate(spec: &SeedSpec, now: DateTime<Utc>) -> DemoData {
    let mut rng = ChaCha8Rng::seed_from_u64(spec.rng_seed);
    DemoData {
        users: (0..spec.users).map(|_| demo_user(&mut rng)).collect(),
        ads: (0..spec.ads).map(|_| demo_ad(&mut rng)).collect(),
        content: (0..spec.content)
            .map(|_| demo_content(&mut rng, now))
            .collect(),
    }
}

/// Generate and insert demo rows in a single transaction.
pub async fn seed_demo(
    repo: &SqliteRepository,
    spec: &SeedSpec,
) -> Result<SeedCounts, PersistenceError> {
    let data = generate(spec, Utc::now());
    repo.insert_all(&data.users, &data.ads, &data.content).await?;
    let counts = SeedCounts {
        users: data.users.len(),
        ads: data.ads.len(),
        content: data.content.len(),
    };
    info!(
        users = counts.users,
        ads = counts.ads,
        content = counts.content,
        seed = spec.rng_seed,
        "demo data seeded"
    );
    Ok(counts)
}
