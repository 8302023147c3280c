//! Sentinel service binary.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use amp_client::{AgentExecutor, AmpClient};
use notify::WebhookNotifier;
use sentinel_config::SentinelConfig;

use sentinel::admin::{self, AdminState};
use sentinel::intake::{self, IntakeState, RateLimiter, SuppressionMap};
use sentinel::{DiagnosisEngine, FileStore, MemoryStore, Scheduler, SourceManager, Store};

/// Hard cap on distinct suppression entries.
const SUPPRESSION_MAP_CAP: usize = 100_000;

/// Automated production-incident diagnosis service
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Automated production-incident diagnosis service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the intake server and worker pool
    Run {
        /// Path to the YAML configuration file
        #[arg(long, short, default_value = "sentinel.yaml")]
        config: String,
    },
    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to the YAML configuration file
        #[arg(long, short, default_value = "sentinel.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::CheckConfig { config } => {
            let loaded = SentinelConfig::load(&config)
                .with_context(|| format!("invalid configuration: {config}"))?;
            println!(
                "ok: {} projects, {} skills",
                loaded.projects.len(),
                loaded.skills.len()
            );
            Ok(())
        }
    }
}

async fn run(config_path: &str) -> Result<()> {
    let config = Arc::new(
        SentinelConfig::load(config_path)
            .with_context(|| format!("failed to load configuration: {config_path}"))?,
    );
    info!(
        projects = config.projects.len(),
        workers = config.scheduler.max_concurrency,
        "starting sentinel"
    );

    let store: Arc<dyn Store> = if config.store.path.is_empty() {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!(path = %config.store.path, "using file store");
        Arc::new(
            FileStore::open(&config.store.path)
                .await
                .context("failed to open file store")?,
        )
    };

    let source = Arc::new(SourceManager::new(
        config.source.base_dir.clone(),
        Some(config.source.git_ssh_key.clone()),
    ));
    let agent: Arc<dyn AgentExecutor> = Arc::new(AmpClient::new(
        config.amp.binary.clone(),
        config.amp.api_key.clone(),
        config.amp.default_mode.clone(),
    ));
    let notifier = Arc::new(WebhookNotifier::new(
        Some(config.notify.secret.clone()),
        config.notify.retry_count,
        config.notify.retry_delay,
    ));

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), Arc::clone(&store)));
    let engine = Arc::new(DiagnosisEngine::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&source),
        agent,
        notifier,
    ));
    scheduler.start(Arc::clone(&engine) as Arc<dyn sentinel::Diagnose>);

    let suppression = Arc::new(SuppressionMap::new(SUPPRESSION_MAP_CAP));
    let sweeper = suppression.spawn_sweeper();

    let intake_state = Arc::new(IntakeState {
        config: Arc::clone(&config),
        scheduler: Arc::clone(&scheduler),
        store: Arc::clone(&store),
        suppression,
        ratelimit: RateLimiter::new(config.intake.rate_limit_per_hour),
    });
    let admin_state = Arc::new(AdminState {
        store: Arc::clone(&store),
        scheduler: Arc::clone(&scheduler),
    });

    let app = intake::build_router(intake_state)
        .merge(admin::build_router(admin_state))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.intake.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.intake.listen))?;
    info!(listen = %config.intake.listen, "intake listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down: draining scheduler");
    sweeper.abort();
    scheduler.stop().await;
    store.close().await.ok();
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
