//! SQLite-backed repository.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sim_core::{
    Ad, AdCategory, AdId, Candidate, ChurnEvent, ContentId, ContentItem, Neighborhood,
    PersistenceError, Preferences, Repository, RepositoryError, SimulationResult,
    TargetMetrics, User, UserId, ValidationError, INFLUENCE_CEILING,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

fn query_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| RepositoryError::Query {
        operation,
        message: e.to_string(),
    }
}

fn write_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> PersistenceError {
    move |e| PersistenceError::Write {
        operation,
        message: e.to_string(),
    }
}

fn invalid(entity: &'static str, id: &str) -> impl FnOnce(ValidationError) -> RepositoryError {
    let id = id.to_string();
    move |source| RepositoryError::InvalidRow { entity, id, source }
}

fn count(field: &'static str, v: i64) -> Result<u32, ValidationError> {
    u32::try_from(v).map_err(|_| ValidationError::OutOfRange {
        field,
        value: v as f64,
        min: 0.0,
        max: f64::from(u32::MAX),
    })
}

fn decimal(field: &'static str, raw: &str) -> Result<Decimal, ValidationError> {
    Decimal::from_str(raw.trim()).map_err(|e| ValidationError::Malformed {
        field,
        message: e.to_string(),
    })
}

fn json<T: serde::de::DeserializeOwned>(field: &'static str, raw: &str) -> Result<T, ValidationError> {
    serde_json::from_str(raw).map_err(|e| ValidationError::Malformed {
        field,
        message: e.to_string(),
    })
}

fn to_json<T: serde::Serialize>(operation: &'static str, v: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(v).map_err(|e| PersistenceError::Write {
        operation,
        message: e.to_string(),
    })
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    age: i64,
    region: String,
    device: String,
    persona_id: i64,
    status: String,
    satisfaction: f64,
    engagement_rate: f64,
    network_density: f64,
    influence_score: f64,
    avg_scroll_depth: f64,
    avg_watch_time: f64,
    clicks_last_24h: i64,
    content_interactions: i64,
    video_views: i64,
    video_completion_rate: f64,
    follower_count: i64,
    following_count: i64,
    preferences: String,
}

impl UserRow {
    fn into_user(self) -> Result<User, ValidationError> {
        let preferences: Preferences = if self.preferences.trim().is_empty() {
            Preferences::default()
        } else {
            json("preferences", &self.preferences)?
        };
        let user = User {
            id: UserId(self.id),
            username: self.username,
            age: count("age", self.age)?,
            region: self.region,
            device: self.device.parse()?,
            persona_id: count("persona_id", self.persona_id)?,
            status: self.status.parse()?,
            satisfaction: self.satisfaction,
            engagement_rate: self.engagement_rate,
            network_density: self.network_density,
            influence_score: self.influence_score,
            avg_scroll_depth: self.avg_scroll_depth,
            avg_watch_time: self.avg_watch_time,
            clicks_last_24h: count("clicks_last_24h", self.clicks_last_24h)?,
            content_interactions: count("content_interactions", self.content_interactions)?,
            video_views: count("video_views", self.video_views)?,
            video_completion_rate: self.video_completion_rate,
            follower_count: count("follower_count", self.follower_count)?,
            following_count: count("following_count", self.following_count)?,
            preferences,
        };
        user.validate()?;
        Ok(user)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AdRow {
    id: String,
    title: String,
    bid: String,
    budget: String,
    category: i64,
    target_metrics: String,
}

impl AdRow {
    fn into_ad(self) -> Result<Ad, ValidationError> {
        let ad = Ad {
            bid: decimal("bid", &self.bid)?,
            budget: decimal("budget", &self.budget)?,
            category: AdCategory::from_index(self.category)?,
            target: json::<TargetMetrics>("target_metrics", &self.target_metrics)?,
            id: AdId(self.id),
            title: self.title,
        };
        ad.validate()?;
        Ok(ad)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ContentRow {
    id: String,
    content_type: String,
    topic: String,
    reply_count: i64,
    retweet_count: i64,
    quote_count: i64,
    completion_rate: Option<f64>,
    watch_time_seconds: Option<i64>,
    loop_count: Option<i64>,
}

impl ContentRow {
    fn into_item(self) -> Result<ContentItem, ValidationError> {
        let item = ContentItem {
            content_type: self.content_type.parse()?,
            topic: self.topic,
            reply_count: count("reply_count", self.reply_count)?,
            retweet_count: count("retweet_count", self.retweet_count)?,
            quote_count: count("quote_count", self.quote_count)?,
            completion_rate: self.completion_rate,
            watch_time_seconds: self
                .watch_time_seconds
                .map(|v| count("watch_time_seconds", v))
                .transpose()?,
            loop_count: self.loop_count.map(|v| count("loop_count", v)).transpose()?,
            id: ContentId(self.id),
        };
        item.validate()?;
        Ok(item)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    id: String,
    network_density: f64,
    influence_score: f64,
}

/// Row counts per table, for CLI output and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub users: i64,
    pub active_users: i64,
    pub ads: i64,
    pub content: i64,
    pub connections: i64,
    pub impressions: i64,
    pub interactions: i64,
    pub reports: i64,
    pub actions: i64,
    pub flags: i64,
    pub sessions: i64,
    pub recommendations: i64,
    pub churn_events: i64,
}

const USER_COLUMNS: &str = "id, username, age, region, device, persona_id, status, \
     satisfaction, engagement_rate, network_density, influence_score, avg_scroll_depth, \
     avg_watch_time, clicks_last_24h, content_interactions, video_views, video_completion_rate, \
     follower_count, following_count, preferences";

/// Open a pool for `url`, creating the database file if needed.
///
/// In-memory URLs get a single never-recycled connection, since every
/// SQLite connection would otherwise see its own empty database.
pub async fn connect(url: &str) -> Result<SqlitePool, RepositoryError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| RepositoryError::Connection(e.to_string()))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    pool.connect_with(options)
        .await
        .map_err(|e| RepositoryError::Connection(e.to_string()))
}

/// Apply the embedded migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<(), RepositoryError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| RepositoryError::Connection(format!("migration failed: {e}")))?;
    info!("migrations applied");
    Ok(())
}

/// Repository over a migrated SQLite pool.
#[derive(Clone, Debug)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and migrate in one go.
    pub async fn open(url: &str) -> Result<Self, RepositoryError> {
        let pool = connect(url).await?;
        migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_user(&self, user: &User) -> Result<(), PersistenceError> {
        let mut tx = self.begin().await?;
        insert_user(&mut tx, user).await?;
        commit(tx).await
    }

    pub async fn insert_ad(&self, ad: &Ad) -> Result<(), PersistenceError> {
        let mut tx = self.begin().await?;
        insert_ad(&mut tx, ad).await?;
        commit(tx).await
    }

    pub async fn insert_content(
        &self,
        item: &ContentItem,
        created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.begin().await?;
        insert_content(&mut tx, item, created_at).await?;
        commit(tx).await
    }

    /// Insert a batch of demo rows in one transaction.
    pub async fn insert_all(
        &self,
        users: &[User],
        ads: &[Ad],
        content: &[(ContentItem, DateTime<Utc>)],
    ) -> Result<(), PersistenceError> {
        let mut tx = self.begin().await?;
        for u in users {
            insert_user(&mut tx, u).await?;
        }
        for a in ads {
            insert_ad(&mut tx, a).await?;
        }
        for (item, at) in content {
            insert_content(&mut tx, item, *at).await?;
        }
        commit(tx).await
    }

    pub async fn user(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("user"))?;
        row.map(|r| {
            let id = r.id.clone();
            r.into_user().map_err(invalid("user", &id))
        })
        .transpose()
    }

    pub async fn ad(&self, id: &AdId) -> Result<Option<Ad>, RepositoryError> {
        let row: Option<AdRow> = sqlx::query_as(
            "SELECT id, title, bid, budget, category, target_metrics FROM ads WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("ad"))?;
        row.map(|r| {
            let id = r.id.clone();
            r.into_ad().map_err(invalid("ad", &id))
        })
        .transpose()
    }

    pub async fn counts(&self) -> Result<TableCounts, RepositoryError> {
        let mut c = TableCounts::default();
        for (table, slot) in [
            ("users", &mut c.users),
            ("ads", &mut c.ads),
            ("content", &mut c.content),
            ("user_connections", &mut c.connections),
            ("ad_impressions", &mut c.impressions),
            ("content_interactions", &mut c.interactions),
            ("content_reports", &mut c.reports),
            ("moderation_actions", &mut c.actions),
            ("content_flags", &mut c.flags),
            ("user_sessions", &mut c.sessions),
            ("content_recommendations", &mut c.recommendations),
            ("churn_events", &mut c.churn_events),
        ] {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            *slot = sqlx::query_scalar::<_, i64>(&sql)
                .fetch_one(&self.pool)
                .await
                .map_err(query_err("count"))?;
        }
        c.active_users =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE status = 'active'")
                .fetch_one(&self.pool)
                .await
                .map_err(query_err("count"))?;
        Ok(c)
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, PersistenceError> {
        self.pool.begin().await.map_err(write_err("begin"))
    }
}

async fn commit(tx: Transaction<'_, Sqlite>) -> Result<(), PersistenceError> {
    tx.commit()
        .await
        .map_err(|e| PersistenceError::Commit(e.to_string()))
}

async fn insert_user(tx: &mut Transaction<'_, Sqlite>, u: &User) -> Result<(), PersistenceError> {
    u.validate()?;
    let preferences = to_json("insert_user", &u.preferences)?;
    sqlx::query(
        "INSERT INTO users (id, username, age, region, device, persona_id, status, \
         satisfaction, engagement_rate, network_density, influence_score, avg_scroll_depth, \
         avg_watch_time, clicks_last_24h, content_interactions, video_views, \
         video_completion_rate, follower_count, following_count, preferences, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(u.id.as_str())
    .bind(&u.username)
    .bind(i64::from(u.age))
    .bind(&u.region)
    .bind(u.device.as_str())
    .bind(i64::from(u.persona_id))
    .bind(u.status.as_str())
    .bind(u.satisfaction)
    .bind(u.engagement_rate)
    .bind(u.network_density)
    .bind(u.influence_score)
    .bind(u.avg_scroll_depth)
    .bind(u.avg_watch_time)
    .bind(i64::from(u.clicks_last_24h))
    .bind(i64::from(u.content_interactions))
    .bind(i64::from(u.video_views))
    .bind(u.video_completion_rate)
    .bind(i64::from(u.follower_count))
    .bind(i64::from(u.following_count))
    .bind(preferences)
    .bind(ts(Utc::now()))
    .execute(&mut **tx)
    .await
    .map_err(write_err("insert_user"))?;
    Ok(())
}

async fn insert_ad(tx: &mut Transaction<'_, Sqlite>, ad: &Ad) -> Result<(), PersistenceError> {
    ad.validate()?;
    let target = to_json("insert_ad", &ad.target)?;
    sqlx::query(
        "INSERT INTO ads (id, title, bid, budget, category, target_metrics) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(ad.id.as_str())
    .bind(&ad.title)
    .bind(ad.bid.to_string())
    .bind(ad.budget.to_string())
    .bind(i64::from(ad.category.index()))
    .bind(target)
    .execute(&mut **tx)
    .await
    .map_err(write_err("insert_ad"))?;
    Ok(())
}

async fn insert_content(
    tx: &mut Transaction<'_, Sqlite>,
    item: &ContentItem,
    created_at: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    item.validate()?;
    sqlx::query(
        "INSERT INTO content (id, content_type, topic, reply_count, retweet_count, quote_count, \
         completion_rate, watch_time_seconds, loop_count, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(item.id.as_str())
    .bind(item.content_type.as_str())
    .bind(&item.topic)
    .bind(i64::from(item.reply_count))
    .bind(i64::from(item.retweet_count))
    .bind(i64::from(item.quote_count))
    .bind(item.completion_rate)
    .bind(item.watch_time_seconds.map(i64::from))
    .bind(item.loop_count.map(i64::from))
    .bind(ts(created_at))
    .execute(&mut **tx)
    .await
    .map_err(write_err("insert_content"))?;
    Ok(())
}

async fn write_result(
    tx: &mut Transaction<'_, Sqlite>,
    r: &SimulationResult,
) -> Result<(), PersistenceError> {
    let at = ts(r.timestamp);
    let m = &r.metrics;
    let updated = sqlx::query(
        "UPDATE users SET satisfaction = ?, engagement_rate = ?, network_density = ?, \
         avg_scroll_depth = ?, avg_watch_time = ?, clicks_last_24h = ?, \
         content_interactions = ?, video_views = ?, video_completion_rate = ?, updated_at = ? \
         WHERE id = ? AND status = 'active'",
    )
    .bind(m.satisfaction)
    .bind(m.engagement_rate)
    .bind(m.network_density)
    .bind(m.avg_scroll_depth)
    .bind(m.avg_watch_time)
    .bind(i64::from(m.clicks_last_24h))
    .bind(i64::from(m.content_interactions))
    .bind(i64::from(m.video_views))
    .bind(m.video_completion_rate)
    .bind(&at)
    .bind(r.user_id.as_str())
    .execute(&mut **tx)
    .await
    .map_err(write_err("update_user_metrics"))?;
    if updated.rows_affected() == 0 {
        return Err(PersistenceError::UserNotActive(r.user_id.clone()));
    }

    let session = &r.session;
    sqlx::query(
        "INSERT INTO user_sessions (user_id, session_length_seconds, avg_scroll_depth, \
         avg_watch_time, clicks, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(r.user_id.as_str())
    .bind(session.length_secs)
    .bind(session.avg_scroll_depth)
    .bind(session.avg_watch_time)
    .bind(i64::from(session.clicks))
    .bind(&at)
    .execute(&mut **tx)
    .await
    .map_err(write_err("insert_session"))?;

    for rec in &r.recommendations {
        let reason = to_json("insert_recommendation", &rec.reason)?;
        sqlx::query(
            "INSERT INTO content_recommendations (user_id, content_id, recommendation_score, \
             recommendation_reason, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(r.user_id.as_str())
        .bind(rec.content_id.as_str())
        .bind(rec.score)
        .bind(reason)
        .bind(&at)
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_recommendation"))?;
    }

    for p in &r.placements {
        sqlx::query(
            "INSERT INTO ad_impressions (user_id, ad_id, position, predicted_ctr, score, spend, \
             clicked, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(r.user_id.as_str())
        .bind(p.ad_id.as_str())
        .bind(i64::from(p.position))
        .bind(p.predicted_ctr)
        .bind(p.score)
        .bind(p.spend.to_string())
        .bind(p.clicked)
        .bind(&at)
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_impression"))?;
        sqlx::query("UPDATE ads SET budget = ? WHERE id = ?")
            .bind(p.budget_after.to_string())
            .bind(p.ad_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(write_err("update_ad_budget"))?;
    }

    for i in &r.interactions {
        sqlx::query(
            "INSERT INTO content_interactions (user_id, content_id, interaction_type, \
             engagement_score, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(r.user_id.as_str())
        .bind(i.content_id.as_str())
        .bind(i.kind.as_str())
        .bind(i.engagement_score)
        .bind(&at)
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_interaction"))?;
    }

    for rep in &r.reports {
        sqlx::query(
            "INSERT INTO content_reports (id, reporter_id, target_id, target_type, reason, \
             details, severity, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rep.id.to_string())
        .bind(rep.reporter_id.as_str())
        .bind(&rep.target.id)
        .bind(rep.target.kind.as_str())
        .bind(rep.reason.as_str())
        .bind(&rep.details)
        .bind(rep.severity)
        .bind(rep.status.as_str())
        .bind(ts(rep.created_at))
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_report"))?;
    }

    for a in &r.actions {
        let details = to_json("insert_action", &a.details)?;
        sqlx::query(
            "INSERT INTO moderation_actions (id, report_id, moderator_id, action_type, details, \
             created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(a.id.to_string())
        .bind(a.report_id.to_string())
        .bind(&a.moderator_id)
        .bind(a.action_type.as_str())
        .bind(details)
        .bind(ts(a.created_at))
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_action"))?;
    }

    for f in &r.flags {
        sqlx::query(
            "INSERT INTO content_flags (id, action_id, target_id, target_type, flag_type, reason, \
             score, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(f.id.to_string())
        .bind(f.action_id.to_string())
        .bind(&f.target.id)
        .bind(f.target.kind.as_str())
        .bind(f.flag_type.as_str())
        .bind(f.reason.as_str())
        .bind(f.score)
        .bind(ts(f.created_at))
        .bind(ts(f.expires_at))
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_flag"))?;
    }

    for c in &r.connections {
        let (a, b) = c.pair();
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO user_connections (user_a, user_b, initiator, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(c.initiator.as_str())
        .bind(ts(c.created_at))
        .execute(&mut **tx)
        .await
        .map_err(write_err("insert_connection"))?;
        if inserted.rows_affected() == 0 {
            debug!(a = %a, b = %b, "connection already present");
            continue;
        }
        sqlx::query("UPDATE users SET following_count = following_count + 1 WHERE id = ?")
            .bind(c.initiator.as_str())
            .execute(&mut **tx)
            .await
            .map_err(write_err("update_following"))?;
        sqlx::query(
            "UPDATE users SET influence_score = MIN(influence_score + ?, ?), \
             follower_count = follower_count + 1 WHERE id = ?",
        )
        .bind(c.influence_delta)
        .bind(INFLUENCE_CEILING)
        .bind(c.target.as_str())
        .execute(&mut **tx)
        .await
        .map_err(write_err("update_influence"))?;
    }
    Ok(())
}

impl Repository for SqliteRepository {
    async fn load_active_users(&self, limit: usize) -> Result<Vec<User>, RepositoryError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE status = 'active' ORDER BY RANDOM() LIMIT ?"
        );
        let rows: Vec<UserRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("load_active_users"))?;
        rows.into_iter()
            .map(|r| {
                let id = r.id.clone();
                r.into_user().map_err(invalid("user", &id))
            })
            .collect()
    }

    async fn load_budgeted_ads(
        &self,
        limit: usize,
        min_budget: Decimal,
    ) -> Result<Vec<Ad>, RepositoryError> {
        // The REAL cast only pre-filters; eligibility is decided on exact decimals.
        let floor = min_budget.to_f64().unwrap_or(0.0);
        let rows: Vec<AdRow> = sqlx::query_as(
            "SELECT id, title, bid, budget, category, target_metrics FROM ads \
             WHERE CAST(budget AS REAL) >= ? ORDER BY RANDOM() LIMIT ?",
        )
        .bind(floor - 1e-9)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("load_budgeted_ads"))?;
        let mut ads = Vec::with_capacity(rows.len());
        for r in rows {
            let id = r.id.clone();
            let ad = r.into_ad().map_err(invalid("ad", &id))?;
            if ad.budget >= min_budget {
                ads.push(ad);
            }
        }
        Ok(ads)
    }

    async fn load_recent_content(&self, limit: usize) -> Result<Vec<ContentItem>, RepositoryError> {
        let rows: Vec<ContentRow> = sqlx::query_as(
            "SELECT id, content_type, topic, reply_count, retweet_count, quote_count, \
             completion_rate, watch_time_seconds, loop_count FROM content \
             ORDER BY created_at DESC, id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("load_recent_content"))?;
        rows.into_iter()
            .map(|r| {
                let id = r.id.clone();
                r.into_item().map_err(invalid("content", &id))
            })
            .collect()
    }

    async fn load_network(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Neighborhood, RepositoryError> {
        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT CASE WHEN user_a = ? THEN user_b ELSE user_a END \
             FROM user_connections WHERE user_a = ? OR user_b = ?",
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("load_connections"))?;

        let rows: Vec<CandidateRow> = sqlx::query_as(
            "SELECT id, network_density, influence_score FROM users \
             WHERE status = 'active' AND id != ? \
             AND id NOT IN (SELECT user_b FROM user_connections WHERE user_a = ? \
                            UNION SELECT user_a FROM user_connections WHERE user_b = ?) \
             ORDER BY RANDOM() LIMIT ?",
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("load_candidates"))?;

        Ok(Neighborhood {
            existing: existing.into_iter().map(UserId).collect(),
            candidates: rows
                .into_iter()
                .map(|r| Candidate {
                    id: UserId(r.id),
                    network_density: r.network_density,
                    influence_score: r.influence_score,
                })
                .collect(),
        })
    }

    async fn persist_step_result(&self, result: &SimulationResult) -> Result<(), PersistenceError> {
        result.check_consistency()?;
        let mut tx = self.begin().await?;
        // Dropping `tx` on any error below rolls the whole step back.
        write_result(&mut tx, result).await?;
        commit(tx).await?;
        debug!(
            user = %result.user_id,
            impressions = result.placements.len(),
            interactions = result.interactions.len(),
            reports = result.reports.len(),
            recommendations = result.recommendations.len(),
            connections = result.connections.len(),
            "step result committed"
        );
        Ok(())
    }

    async fn record_churn(&self, event: &ChurnEvent) -> Result<(), PersistenceError> {
        let mut tx = self.begin().await?;
        let at = ts(event.at);
        let updated = sqlx::query(
            "UPDATE users SET status = 'inactive', updated_at = ? WHERE id = ? AND status = 'active'",
        )
        .bind(&at)
        .bind(event.user_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(write_err("deactivate_user"))?;
        if updated.rows_affected() == 0 {
            return Err(PersistenceError::UserNotActive(event.user_id.clone()));
        }
        sqlx::query(
            "INSERT INTO churn_events (user_id, reason, probability, satisfaction, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.user_id.as_str())
        .bind(event.reason.as_str())
        .bind(event.probability)
        .bind(event.satisfaction)
        .bind(&at)
        .execute(&mut *tx)
        .await
        .map_err(write_err("insert_churn_event"))?;
        commit(tx).await
    }

    async fn count_active_flags(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM content_flags WHERE expires_at > ?",
        )
        .bind(ts(now))
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("count_active_flags"))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}
