use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sim_core::{
    BehaviorConfig, ContentId, ContentItem, ContentType, ContentTypePreference, Device,
    Preferences, User, UserId, UserStatus,
};

fn build_user(i: usize) -> User {
    let f = (i % 10) as f64 / 10.0;
    User {
        id: UserId(format!("u{i}")),
        username: format!("user{i}"),
        age: 18 + (i % 50) as u32,
        region: "Europe".into(),
        device: Device::Mobile,
        persona_id: (i % 5) as u32,
        status: UserStatus::Active,
        satisfaction: f,
        engagement_rate: 1.0 - f,
        network_density: 0.3,
        influence_score: 1.0,
        avg_scroll_depth: 0.5,
        avg_watch_time: 20.0,
        clicks_last_24h: 0,
        content_interactions: 0,
        video_views: 0,
        video_completion_rate: 0.5,
        follower_count: 0,
        following_count: 0,
        preferences: Preferences {
            topics: vec!["tech".into(), "music".into()],
            content_type: ContentTypePreference::Text,
            categories: vec![],
        },
    }
}

fn bench_probabilities(c: &mut Criterion) {
    let cfg = BehaviorConfig::default();
    let users: Vec<User> = (0..1_000).map(build_user).collect();
    let item = ContentItem {
        id: ContentId("c1".into()),
        content_type: ContentType::Post,
        topic: "tech".into(),
        reply_count: 3,
        retweet_count: 1,
        quote_count: 0,
        completion_rate: None,
        watch_time_seconds: None,
        loop_count: None,
    };
    c.bench_function("behavior 1k users x 3 probabilities", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        b.iter(|| {
            let mut hits = 0usize;
            for u in &users {
                let p = sim_behavior::interaction_probability(&cfg, u, &item);
                let r = sim_behavior::report_probability(
                    &cfg,
                    u,
                    sim_behavior::ReportSubject::Content(&item),
                );
                let ch = sim_behavior::churn_probability(&cfg, u);
                hits += [p, r, ch]
                    .into_iter()
                    .filter(|p| sim_behavior::bernoulli(&mut rng, *p))
                    .count();
            }
            black_box(hits)
        })
    });
}

criterion_group!(benches, bench_probabilities);
criterion_main!(benches);
