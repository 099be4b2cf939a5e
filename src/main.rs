use clap::{Parser, Subcommand};
use gridfeed::config::AppConfig;
use gridfeed::error::Result;
use gridfeed::service::NflDataService;
use gridfeed::services::{HealthServer, HealthState, Metrics};
use gridfeed::sources::{
    EspnClient, FantasyDataClient, NflOfficialClient, SourceClient, SportsDataClient,
};
use gridfeed::store::PostgresStore;
use gridfeed::sync::{SyncEvent, SyncService};
use gridfeed::{CacheManager, SourceOrchestrator};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridfeed", about = "Resilient multi-source NFL data service")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync loop and health server (default)
    Serve,
    /// Print the current schedule week
    Week {
        #[arg(long, default_value_t = 2025)]
        season: u16,
    },
    /// Print the slate for a week
    Games {
        #[arg(long)]
        week: u8,
        #[arg(long, default_value_t = 2025)]
        season: u16,
    },
    /// Print games currently in progress
    Live,
    /// Print per-source health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config);

    for problem in config.validate() {
        warn!(%problem, "configuration issue");
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(config).await,
        Commands::Week { season } => {
            let service = build_service(&config, None).await?;
            let result = service.current_week(season).await?;
            println!(
                "week {} (provider: {})",
                result.data,
                result.successful_provider.as_deref().unwrap_or("fallback")
            );
            Ok(())
        }
        Commands::Games { week, season } => {
            let service = build_service(&config, None).await?;
            let result = service.games_by_week(week, season).await?;
            println!("{}", serde_json::to_string_pretty(&result.data)?);
            Ok(())
        }
        Commands::Live => {
            let service = build_service(&config, None).await?;
            let result = service.live_games().await?;
            println!("{}", serde_json::to_string_pretty(&result.data)?);
            Ok(())
        }
        Commands::Status => {
            let service = build_service(&config, None).await?;
            for status in service.source_status() {
                println!(
                    "{:<14} healthy={} circuit={:?} in_flight={} avg_ms={:.0}",
                    status.name,
                    status.health.healthy,
                    status.health.circuit_breaker.state,
                    status.in_flight,
                    status.avg_response_ms
                );
            }
            Ok(())
        }
    }
}

async fn run_serve(config: AppConfig) -> Result<()> {
    let store = match &config.database {
        Some(db) => {
            let store = PostgresStore::new(&db.url, db.max_connections).await?;
            store.migrate().await?;
            info!("database connected and migrated");
            Some(Arc::new(store))
        }
        None => {
            warn!("no database configured, store tier disabled");
            None
        }
    };

    let cache = Arc::new(CacheManager::new(config.cache.max_entries));
    let orchestrator = build_orchestrator(&config)?;
    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(
        NflDataService::new(
            Arc::clone(&orchestrator),
            Arc::clone(&cache),
            store.clone(),
            config.fallback.chain_config(),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    let sync = Arc::new(SyncService::new(
        config.sync.sync_config(),
        Arc::clone(&orchestrator),
        Arc::clone(&cache),
        store.clone(),
    ));
    sync.start();

    spawn_event_counter(&sync, Arc::clone(&metrics));

    let health_state = Arc::new(
        HealthState::new(Arc::clone(&orchestrator), Arc::clone(&cache))
            .with_sync(Arc::clone(&sync))
            .with_metrics(Arc::clone(&metrics)),
    );
    health_state.set_db_connected(store.is_some());

    let port = config.health_port.unwrap_or(8080);
    let health_server = HealthServer::new(Arc::clone(&health_state), port);
    let health_handle = tokio::spawn(async move {
        if let Err(err) = health_server.run().await {
            error!(error = %err, "health server exited");
        }
    });

    // Prime the week cache so the first consumer does not pay the cold cost.
    match service.current_week(current_season()).await {
        Ok(result) => info!(week = result.data, "resolved current schedule week"),
        Err(err) => warn!(error = %err, "could not resolve current week at startup"),
    }

    info!(port, "gridfeed running, press Ctrl+C to stop");
    shutdown_signal().await;

    info!("shutting down");
    sync.stop().await;
    health_handle.abort();
    Ok(())
}

async fn build_service(
    config: &AppConfig,
    store: Option<Arc<PostgresStore>>,
) -> Result<NflDataService> {
    let cache = Arc::new(CacheManager::new(config.cache.max_entries));
    let orchestrator = build_orchestrator(config)?;
    Ok(NflDataService::new(
        orchestrator,
        cache,
        store,
        config.fallback.chain_config(),
    ))
}

/// Register every enabled source that has the credentials it needs.
/// Keyed sources without a key are skipped with a warning rather than
/// failing startup.
fn build_orchestrator(config: &AppConfig) -> Result<Arc<SourceOrchestrator>> {
    let orchestrator = Arc::new(SourceOrchestrator::new(
        config.orchestrator.load_balancing(),
        config.orchestrator.set_retries,
    ));

    let sources = &config.sources;

    if sources.espn.enabled {
        let client = EspnClient::new(sources.espn.base_url.as_deref(), sources.espn.resilience())?;
        orchestrator.register(Arc::new(client) as Arc<dyn SourceClient>, sources.espn.priority);
    }

    if sources.sportsdata.enabled {
        match &sources.sportsdata.api_key {
            Some(key) => {
                let client = SportsDataClient::new(
                    sources.sportsdata.base_url.as_deref(),
                    key.clone(),
                    sources.sportsdata.resilience(),
                )?;
                orchestrator.register(Arc::new(client), sources.sportsdata.priority);
            }
            None => warn!("sportsdata enabled but no api_key set, skipping"),
        }
    }

    if sources.nfl_official.enabled {
        let client = NflOfficialClient::new(
            sources.nfl_official.base_url.as_deref(),
            sources.nfl_official.api_key.clone(),
            sources.nfl_official.resilience(),
        )?;
        orchestrator.register(Arc::new(client), sources.nfl_official.priority);
    }

    if sources.fantasydata.enabled {
        match &sources.fantasydata.api_key {
            Some(key) => {
                let client = FantasyDataClient::new(
                    sources.fantasydata.base_url.as_deref(),
                    key.clone(),
                    sources.fantasydata.resilience(),
                )?;
                orchestrator.register(Arc::new(client), sources.fantasydata.priority);
            }
            None => warn!("fantasydata enabled but no api_key set, skipping"),
        }
    }

    Ok(orchestrator)
}

fn spawn_event_counter(sync: &Arc<SyncService>, metrics: Arc<Metrics>) {
    let mut events = sync.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Changed(_)) => metrics.record_change().await,
                Ok(SyncEvent::Rebroadcast(_)) => metrics.record_rebroadcast(),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event counter lagged behind sync channel");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn current_season() -> u16 {
    use chrono::Datelike;
    let now = chrono::Utc::now();
    // The NFL season is named for the year it starts in; January games
    // belong to the previous season.
    if now.month() < 3 {
        (now.year() - 1) as u16
    } else {
        now.year() as u16
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},gridfeed=debug,sqlx=warn", config.logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
