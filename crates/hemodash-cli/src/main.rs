use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hemodash_query::{IndicatorExecutor, NullExecutor, SqlIndicatorExecutor};
use hemodash_report::{
    build_scheduler, scheduler_status, HttpRelayTransport, MailTransport, Orchestrator,
    ReportConfig, RunOptions,
};
use hemodash_storage::{PreferenceStore, StoreConfig, TemplateStore};
use hemodash_web::{AppState, TokenVerifier};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hemodash")]
#[command(about = "Blood-donation indicator reporting backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the API server and, when enabled, the report scheduler.
    Serve,
    /// Execute one delivery run and print its summary.
    Run {
        /// Target a single user instead of all eligible subscribers.
        #[arg(long)]
        user: Option<String>,
        /// Redirect all deliveries to this address.
        #[arg(long)]
        test_email: Option<String>,
        /// Assemble reports but simulate delivery.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the scheduler projection as JSON.
    Status,
}

struct Components {
    store: Arc<PreferenceStore>,
    templates: Arc<TemplateStore>,
    executor: Arc<dyn IndicatorExecutor>,
    transport: Arc<dyn MailTransport>,
    config: ReportConfig,
}

async fn build_components() -> Result<Components> {
    let store_config = StoreConfig::from_env();
    let config = ReportConfig::from_env();

    let executor: Arc<dyn IndicatorExecutor> = match std::env::var("DATABASE_URL") {
        Ok(url) => Arc::new(
            SqlIndicatorExecutor::connect(&url)
                .await
                .context("connecting to aggregation database")?,
        ),
        Err(_) => {
            warn!("DATABASE_URL not set, indicator data will be unavailable");
            Arc::new(NullExecutor)
        }
    };
    let transport: Arc<dyn MailTransport> =
        Arc::new(HttpRelayTransport::new(&config).context("building mail transport")?);

    Ok(Components {
        store: Arc::new(PreferenceStore::new(&store_config)),
        templates: Arc::new(TemplateStore::new(&store_config)),
        executor,
        transport,
        config,
    })
}

fn orchestrator_from(components: &Components) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        components.store.clone(),
        components.templates.clone(),
        components.executor.clone(),
        components.transport.clone(),
        components.config.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let verifier = TokenVerifier::from_env()?;
            let components = build_components().await?;
            let orchestrator = orchestrator_from(&components);

            if let Some(mut scheduler) =
                build_scheduler(orchestrator.clone(), &components.config).await?
            {
                scheduler.start().await.context("starting scheduler")?;
            }

            let port: u16 = std::env::var("HEMODASH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let state = AppState {
                store: components.store.clone(),
                templates: components.templates.clone(),
                orchestrator,
                transport: components.transport.clone(),
                executor: components.executor.clone(),
                config: components.config.clone(),
                verifier,
            };
            hemodash_web::serve(state, port).await?;
        }
        Commands::Run {
            user,
            test_email,
            dry_run,
        } => {
            let components = build_components().await?;
            let orchestrator = orchestrator_from(&components);
            let options = RunOptions {
                target_username: user,
                test_email,
                dry_run,
                scheduled: false,
            };
            let summary = orchestrator.run(&options).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Status => {
            let components = build_components().await?;
            let status = scheduler_status(
                &components.store,
                &components.config,
                chrono::Utc::now(),
            )
            .await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
