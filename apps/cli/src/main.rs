#![deny(warnings)]

//! Headless CLI: prepare the database and drive the simulation loop.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use persistence::{init_db, seed_demo, SeedSpec, SqliteRepository};
use sim_core::SimConfig;
use sim_predict::{FixedPredictor, HttpPredictor, Predictor};
use sim_runtime::{SimMetrics, Simulator, StopFlag};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sim-cli", version)]
#[command(about = "Stochastic social feed simulator")]
struct Cli {
    /// YAML config file; every field is optional
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run simulation ticks until done or interrupted
    Run(RunArgs),
    /// Insert demo users, ads and content
    Seed(SeedArgs),
    /// Create the database and apply migrations
    Migrate,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Number of ticks; defaults to `ticks` from the config
    #[arg(long)]
    ticks: Option<u64>,

    /// Use static predictions instead of the model endpoints
    #[arg(long)]
    offline: bool,
}

#[derive(Args, Debug)]
struct SeedArgs {
    #[arg(long, default_value_t = 100)]
    users: usize,

    #[arg(long, default_value_t = 20)]
    ads: usize,

    #[arg(long, default_value_t = 200)]
    content: usize,
}

fn load_config(path: Option<&Path>) -> Result<SimConfig> {
    let mut cfg = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            SimConfig::from_yaml_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SimConfig::default(),
    };
    cfg.apply_env().context("applying environment overrides")?;
    cfg.validate().context("validating config")?;
    Ok(cfg)
}

async fn open_repo(cfg: &SimConfig) -> Result<SqliteRepository> {
    init_db(&cfg.database_url)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))
}

async fn drive<P: Predictor>(
    cfg: SimConfig,
    repo: SqliteRepository,
    predictor: P,
    ticks: u64,
) -> SimMetrics {
    let stop = StopFlag::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current tick");
            on_signal.stop();
        }
    });

    let mut sim = Simulator::new(cfg, repo, predictor, SimMetrics::default());
    sim.run(ticks, &stop).await;
    sim.into_metrics()
}

async fn run(cfg: SimConfig, args: RunArgs) -> Result<()> {
    let repo = open_repo(&cfg).await?;
    let ticks = args.ticks.unwrap_or(cfg.ticks);
    info!(
        ticks,
        users_per_tick = cfg.users_per_tick,
        seed = cfg.rng_seed,
        offline = args.offline,
        "starting simulation"
    );
    let metrics = if args.offline {
        drive(cfg, repo, FixedPredictor::default(), ticks).await
    } else {
        let predictor =
            HttpPredictor::new(cfg.endpoints.clone()).context("building prediction client")?;
        drive(cfg, repo, predictor, ticks).await
    };

    info!(
        ticks = metrics.ticks,
        users = metrics.users,
        churned = metrics.churned,
        failed = metrics.failed_steps,
        impressions = metrics.impressions,
        clicks = metrics.clicks,
        spend = %metrics.spend,
        ctr = metrics.ctr(),
        actions = metrics.actions,
        active_flags = metrics.active_flags,
        avg_satisfaction = metrics.avg_satisfaction,
        avg_engagement = metrics.avg_engagement,
        avg_density = metrics.avg_density,
        fallbacks = metrics.prediction_fallbacks,
        "run complete"
    );
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

async fn seed(cfg: SimConfig, args: SeedArgs) -> Result<()> {
    let repo = open_repo(&cfg).await?;
    let spec = SeedSpec {
        users: args.users,
        ads: args.ads,
        content: args.content,
        rng_seed: cfg.rng_seed,
    };
    let counts = seed_demo(&repo, &spec).await.context("seeding demo data")?;
    println!(
        "Seeded {} | users: {} | ads: {} | content: {}",
        cfg.database_url, counts.users, counts.ads, counts.content
    );
    Ok(())
}

async fn migrate(cfg: SimConfig) -> Result<()> {
    let repo = open_repo(&cfg).await?;
    let counts = repo.counts().await?;
    println!(
        "DB migrated at {} | users: {} ({} active) | ads: {} | content: {}",
        cfg.database_url, counts.users, counts.active_users, counts.ads, counts.content
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => run(cfg, args).await,
        Command::Seed(args) => seed(cfg, args).await,
        Command::Migrate => migrate(cfg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from(["sim-cli", "run", "--ticks", "3", "--offline"]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.ticks, Some(3));
                assert!(args.offline);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn seed_defaults_apply() {
        let cli = Cli::parse_from(["sim-cli", "--config", "sim.yaml", "seed", "--users", "7"]);
        assert_eq!(cli.config, Some(PathBuf::from("sim.yaml")));
        match cli.command {
            Command::Seed(args) => {
                assert_eq!((args.users, args.ads, args.content), (7, 20, 200));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/sim.yaml"))).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }
}
