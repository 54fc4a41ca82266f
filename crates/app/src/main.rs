mod demo;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use journey_core::geo::Coordinate;
use journey_core::model::{
    JourneyId, ReportedLocation, StepId, UserId, ValidationAttempt, ValidationMethod,
};
use services::{Clock, EngineConfig, JourneyServices};
use storage::repository::StepCatalog;
use storage::sqlite::SqliteRepository;

#[derive(Debug, Parser)]
#[command(name = "journey", version)]
#[command(about = "Track and validate progress through location-based journeys")]
struct Cli {
    /// SQLite database URL or path
    #[arg(
        long = "db",
        global = true,
        env = "JOURNEY_DB_URL",
        default_value = "sqlite://journeys.sqlite3"
    )]
    db_url: String,

    /// Repeat attempts for the same step inside this window are dropped
    #[arg(long, global = true, env = "JOURNEY_DUPLICATE_WINDOW_MS", default_value_t = 3_000)]
    duplicate_window_ms: u64,

    /// Minimum spacing between heartbeat writes for one session
    #[arg(long, global = true, env = "JOURNEY_HEARTBEAT_WINDOW_MS", default_value_t = 2_000)]
    heartbeat_window_ms: u64,

    /// Upper bound on a single validation, storage included
    #[arg(long, global = true, env = "JOURNEY_STORE_TIMEOUT_MS", default_value_t = 10_000)]
    store_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or upgrade the database schema
    Migrate,
    /// Load the demo three-step journey
    Seed,
    /// Validate a step attempt
    Validate(ValidateArgs),
    /// Show progress for a user on a journey
    Progress(SessionArgs),
    /// Record user activity on a journey
    Heartbeat(SessionArgs),
    /// End a journey without completing it
    Abandon(SessionArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// User UUID
    #[arg(long)]
    user: Uuid,

    /// Journey ID
    #[arg(long)]
    journey: u64,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Step ID
    #[arg(long)]
    step: u64,

    #[arg(long, value_enum)]
    method: MethodArg,

    /// Reported latitude in degrees
    #[arg(long, allow_negative_numbers = true, requires = "lon")]
    lat: Option<f64>,

    /// Reported longitude in degrees
    #[arg(long, allow_negative_numbers = true, requires = "lat")]
    lon: Option<f64>,

    /// Reported GPS accuracy in meters
    #[arg(long, requires = "lat")]
    accuracy: Option<f64>,

    /// Skip the duplicate window
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MethodArg {
    Geolocation,
    Manual,
    QrCode,
}

impl From<MethodArg> for ValidationMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::Geolocation => ValidationMethod::Geolocation,
            MethodArg::Manual => ValidationMethod::Manual,
            MethodArg::QrCode => ValidationMethod::QrCode,
        }
    }
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_duplicate_window(Duration::from_millis(self.duplicate_window_ms))
            .with_heartbeat_window(Duration::from_millis(self.heartbeat_window_ms))
            .with_store_timeout(Duration::from_millis(self.store_timeout_ms))
    }
}

impl ValidateArgs {
    fn attempt(&self, clock: &Clock) -> Result<ValidationAttempt> {
        let location = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(ReportedLocation::new(
                Coordinate::new(lat, lon).context("invalid --lat/--lon")?,
                self.accuracy,
            )),
            _ => None,
        };

        Ok(ValidationAttempt {
            step_id: StepId::new(self.step),
            location,
            method: self.method.into(),
            requested_at: clock.now(),
            force: self.force,
        })
    }
}

fn normalize_sqlite_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "sqlite::memory:" || trimmed.starts_with("sqlite://") {
        return trimmed.to_string();
    }

    let path_str = trimmed.strip_prefix("sqlite:").unwrap_or(trimmed);
    let path = Path::new(path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<()> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let Some(path) = db_url.strip_prefix("sqlite://") else {
        bail!("invalid --db value: {db_url}");
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        bail!("invalid --db value: {db_url}");
    }

    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("creating {}", path.display()))?;
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open(db_url: &str, clock: &Clock, config: EngineConfig) -> Result<JourneyServices> {
    JourneyServices::new_sqlite(db_url, clock.clone(), config)
        .await
        .with_context(|| format!("opening {db_url}"))
}

async fn run(cli: Cli) -> Result<()> {
    let db_url = normalize_sqlite_url(&cli.db_url);
    prepare_sqlite_file(&db_url)?;
    let config = cli.engine_config();
    let clock = Clock::default_clock();

    match cli.command {
        Command::Migrate => {
            let repo = SqliteRepository::connect(&db_url)
                .await
                .with_context(|| format!("opening {db_url}"))?;
            repo.migrate().await.context("running migrations")?;
            tracing::info!(db = %db_url, "migrations applied");
            print_json(&serde_json::json!({ "migrated": db_url }))
        }
        Command::Seed => {
            let services = open(&db_url, &clock, config).await?;
            let journey = demo::demo_journey()?;
            services.storage().steps.upsert_journey(&journey).await?;
            tracing::info!(journey_id = %journey.id(), "demo journey seeded");
            print_json(&serde_json::json!({
                "seeded": journey.id(),
                "name": journey.name(),
                "steps": journey.step_count(),
            }))
        }
        Command::Validate(args) => {
            let engine = open(&db_url, &clock, config).await?.engine();
            let attempt = args.attempt(&clock)?;
            let result = engine
                .validate_step(
                    UserId::new(args.session.user),
                    JourneyId::new(args.session.journey),
                    attempt,
                )
                .await?;
            print_json(&result)
        }
        Command::Progress(args) => {
            let engine = open(&db_url, &clock, config).await?.engine();
            let progress = engine
                .get_progress(UserId::new(args.user), JourneyId::new(args.journey))
                .await?;
            print_json(&progress)
        }
        Command::Heartbeat(args) => {
            let engine = open(&db_url, &clock, config).await?.engine();
            let disposition = engine
                .heartbeat(UserId::new(args.user), JourneyId::new(args.journey))
                .await?;
            engine.flush().await?;
            print_json(&serde_json::json!({ "heartbeat": disposition }))
        }
        Command::Abandon(args) => {
            let engine = open(&db_url, &clock, config).await?.engine();
            let progress = engine
                .abandon_journey(UserId::new(args.user), JourneyId::new(args.journey))
                .await?;
            print_json(&progress)
        }
    }
}

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{err:#}");
        std::process::exit(2);
    }
}
