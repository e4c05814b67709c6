use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use dismissal_queue::config::{ActorArgs, Settings};
use dismissal_queue::error::{AddCarResponse, ClearAllResponse, RemoveCarResponse};
use dismissal_queue::models::{month_of, Scope};
use dismissal_queue::roster::{parse_roster_csv, Campus, CampusDirectory};
use dismissal_queue::store::{MetricStore, PgStore};
use dismissal_queue::{
    parse_car_number, Clock, DismissalEngine, Lane, MetricsAggregator, QueueError, SystemClock,
    TopArrivalsCalculator,
};

#[derive(Parser)]
#[command(name = "dismissal-queue")]
#[command(about = "Car-pickup dismissal queues for school campuses", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo campuses and roster
    Seed,
    /// Register or update a campus
    AddCampus {
        id: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long, default_value = "UTC")]
        timezone: chrono_tz::Tz,
    },
    /// Import roster rows from a CSV file
    ImportRoster {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Queue a car at the tail of a lane
    Add {
        car: String,
        #[arg(long)]
        campus: String,
        #[arg(long)]
        lane: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Dispatch a queued car by entry id
    Remove {
        entry_id: Uuid,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Dispatch every car queued at a campus
    Clear {
        campus: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Print the current queue of a campus
    Queue {
        campus: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Print active car counts per campus
    Counts {
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Stream queue snapshots for a campus as they are committed
    Watch {
        campus: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Metric rollup jobs
    Metrics {
        #[command(subcommand)]
        command: MetricsCommand,
    },
    /// Recompute top arrivals for a month (default: current)
    TopArrivals {
        #[arg(long)]
        month: Option<String>,
    },
    /// Generate a markdown dashboard
    Report {
        #[arg(long)]
        campus: Option<String>,
        #[arg(long)]
        month: Option<String>,
        #[arg(long, default_value = "dashboard.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum MetricsCommand {
    /// Fold ledger records newer than the watermark
    CatchUp,
    /// Rebuild every metric row from the full ledger
    Init,
    /// Delete all metric rows and the watermark
    Reset,
    /// Print the metric rows of one scope
    Show {
        #[arg(long)]
        campus: Option<String>,
        #[arg(long)]
        month: Option<String>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn rejection(err: QueueError) -> anyhow::Result<serde_json::Value> {
    match err {
        QueueError::Rejected(code) => Ok(serde_json::json!({ "success": false, "error": code })),
        QueueError::Store(err) => Err(err).context("store unavailable"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .with_context(|| format!("invalid log level: {}", settings.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let store = Arc::new(
        PgStore::connect(&settings.database_url, settings.max_connections)
            .await
            .context("failed to connect to Postgres")?,
    );
    let clock = Arc::new(SystemClock);
    let engine = DismissalEngine::new(store.clone(), store.clone(), store.clone(), clock.clone());

    match cli.command {
        Commands::InitDb => {
            store.migrate().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let written = store.seed().await?;
            println!("Seeded {written} roster rows.");
        }
        Commands::AddCampus {
            id,
            label,
            timezone,
        } => {
            let label = label.unwrap_or_else(|| id.clone());
            store
                .upsert_campus(&Campus::new(&id, &label, timezone))
                .await?;
            println!("Campus {id} ready ({timezone}).");
        }
        Commands::ImportRoster { csv } => {
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("failed to open {}", csv.display()))?;
            let rows = parse_roster_csv(file)?;
            let written = store.import_roster(&rows).await?;
            println!("Imported {written} roster rows from {}.", csv.display());
        }
        Commands::Add {
            car,
            campus,
            lane,
            actor,
        } => {
            let result = match (parse_car_number(&car), lane.parse::<Lane>()) {
                (Ok(car), Ok(lane)) => {
                    engine
                        .add_car(&actor.actor(), i64::from(car), &campus, lane)
                        .await
                }
                (Err(code), _) | (_, Err(code)) => Err(code.into()),
            };
            print_json(&AddCarResponse::from_result(result)?)?;
        }
        Commands::Remove { entry_id, actor } => {
            match engine.remove_car(&actor.actor(), entry_id).await {
                Ok(car_number) => print_json(&RemoveCarResponse { car_number })?,
                Err(err) => print_json(&rejection(err)?)?,
            }
        }
        Commands::Clear { campus, actor } => {
            match engine.clear_all_cars(&actor.actor(), &campus).await {
                Ok(cleared_count) => print_json(&ClearAllResponse {
                    success: true,
                    cleared_count,
                })?,
                Err(err) => print_json(&rejection(err)?)?,
            }
        }
        Commands::Queue { campus, actor } => {
            match engine.get_current_queue(&actor.actor(), &campus).await {
                Ok(snapshot) => print_json(&snapshot)?,
                Err(err) => print_json(&rejection(err)?)?,
            }
        }
        Commands::Counts { actor } => {
            print_json(&engine.get_car_counts_by_campus(&actor.actor()).await?)?;
        }
        Commands::Watch { campus, actor } => {
            let listener = store
                .listen()
                .await
                .context("failed to listen for queue commits")?;
            let relay_store = store.clone();
            let publisher = engine.publisher();
            let mut relay = tokio::spawn(async move {
                relay_store.relay_notifications(listener, publisher).await
            });

            let (snapshot, mut updates) = match engine.subscribe(&actor.actor(), &campus).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    relay.abort();
                    return print_json(&rejection(err)?);
                }
            };
            print_json(&snapshot)?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, stopping watch");
                        break;
                    }
                    stopped = &mut relay => {
                        stopped
                            .context("queue relay task failed")?
                            .context("queue relay stopped")?;
                        break;
                    }
                    update = updates.recv() => match update {
                        Ok(snapshot) => print_json(snapshot.as_ref())?,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "watch fell behind, next snapshot is current");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            relay.abort();
        }
        Commands::Metrics { command } => {
            let aggregator = MetricsAggregator::new(store.clone(), store.clone(), clock.clone());
            match command {
                MetricsCommand::CatchUp => print_json(&aggregator.catch_up().await?)?,
                MetricsCommand::Init => {
                    print_json(&aggregator.initialize_dashboard_metrics().await?)?
                }
                MetricsCommand::Reset => {
                    aggregator.reset().await?;
                    println!("Metrics reset.");
                }
                MetricsCommand::Show { campus, month } => {
                    let scope = Scope { campus, month };
                    print_json(&aggregator.dashboard(&scope).await?)?;
                }
            }
        }
        Commands::TopArrivals { month } => {
            let calculator = TopArrivalsCalculator::new(
                store.clone(),
                store.clone(),
                store.clone(),
                clock.clone(),
                settings.top_arrivals,
            );
            let written = calculator.run(month.as_deref()).await?;
            print_json(&written)?;
        }
        Commands::Report { campus, month, out } => {
            let rollup = store.load_rollup().await?;
            let now = clock.now();
            let mut top_arrivals = Vec::new();
            for known in store.campuses().await? {
                let arrival_month = month
                    .clone()
                    .unwrap_or_else(|| month_of(known.local_date(now)));
                if let Some(record) = store.top_arrivals(&known.id, &arrival_month).await? {
                    top_arrivals.push(record);
                }
            }
            let report = dismissal_queue::report::build_report(
                campus.as_deref(),
                month.as_deref(),
                &rollup,
                &top_arrivals,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
