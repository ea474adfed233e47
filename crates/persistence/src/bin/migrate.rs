#![deny(warnings)]

use persistence::{default_sqlite_url, init_db};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| default_sqlite_url().to_string());
    let repo = init_db(&url).await?;
    let counts = repo.counts().await?;
    println!(
        "DB migrated at {url} ({} users, {} ads, {} content items)",
        counts.users, counts.ads, counts.content
    );
    Ok(())
}
