use chrono::DateTime;
use clap::Parser;
use ladder_processor::{
    args::{Args, RunMode},
    database::DbClient,
    messaging::{RabbitMqConfig, RabbitMqPublisher},
    model::{constants::Params, replay_executor::ReplayExecutor, stabilization::run_nightly_stabilization}
};
use tracing::{error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    let db = match DbClient::connect(&args.connection_string).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            error!("Application cannot start without a valid database connection");
            std::process::exit(1);
        }
    };

    if args.apply_schema {
        db.apply_schema().await.expect("Schema must apply before processing");
    }

    let params = Params::default();

    match args.mode {
        RunMode::Queue => {
            let executor = ReplayExecutor::new(db, params, connect_publisher().await);
            let reports = executor
                .process_queue(args.limit, args.dry_run)
                .await
                .expect("Replay queue pass failed");
            for report in &reports {
                info!(
                    "ladder {}: {} matches, {} players{}",
                    report.ladder_id,
                    report.matches_processed,
                    report.players_touched,
                    if report.dry_run { " [dry run]" } else { "" }
                );
            }
            info!("{} ladder(s) replayed", reports.len());
        }
        RunMode::Replay => {
            let ladder_id = args.ladder_id.expect("--ladder-id is required in replay mode");
            let from = args
                .from
                .as_deref()
                .map(|s| DateTime::parse_from_rfc3339(s).expect("--from must be a valid RFC 3339 timestamp"));
            let executor = ReplayExecutor::new(db, params, connect_publisher().await);
            let report = executor
                .replay_ladder(&ladder_id, from, args.dry_run)
                .await
                .expect("Replay failed");
            info!(
                "ladder {}: {} matches, {} players, {} pair updates{}",
                report.ladder_id,
                report.matches_processed,
                report.players_touched,
                report.pair_updates,
                if report.dry_run { " [dry run]" } else { "" }
            );
        }
        RunMode::Nightly => {
            let as_of = args
                .as_of
                .as_deref()
                .map(|s| DateTime::parse_from_rfc3339(s).expect("--as-of must be a valid RFC 3339 timestamp"));
            run_nightly_stabilization(&db, &params, as_of, args.horizon_days)
                .await
                .expect("Nightly stabilization failed");
            info!("nightly stabilization complete");
        }
    }
}

/// Insight refreshes are best-effort: a missing or unreachable broker is a
/// warning, not a startup failure.
async fn connect_publisher() -> Option<RabbitMqPublisher> {
    let config = match RabbitMqConfig::from_env() {
        Ok(config) if config.enabled => config,
        Ok(_) => {
            info!("message publishing disabled via RABBITMQ_ENABLED");
            return None;
        }
        Err(_) => {
            warn!("RabbitMQ not configured, insight refresh messages will be skipped");
            return None;
        }
    };

    match RabbitMqPublisher::connect_from_config(&config).await {
        Ok(publisher) => Some(publisher),
        Err(e) => {
            warn!("Failed to connect to RabbitMQ, continuing without it: {}", e);
            None
        }
    }
}
