#![allow(missing_docs)]

//! minka daemon: wires the stores, the catalog, the LLM client and the
//! WhatsApp gateway into the message router, then long-polls the gateway
//! and dispatches each inbound payload as its own task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use minka::availability::AvailabilityCoordinator;
use minka::catalog::ServiceCatalog;
use minka::config::Config;
use minka::consent::ConsentRepository;
use minka::customers::CustomerRepository;
use minka::flow::repository::FlowRepository;
use minka::interpret::NeedInterpreter;
use minka::kv::memory::MemoryKv;
use minka::kv::KvStore;
use minka::llm::openai::OpenAiClient;
use minka::llm::LlmClient;
use minka::media::{ObjectStore, StorageClient};
use minka::resilience::GuardedLlm;
use minka::router::{Router, RouterConfig, RouterDeps};
use minka::safety::ContentGate;
use minka::search::ProviderSearch;
use minka::sessions::SessionLog;
use minka::transport::gateway::GatewayClient;
use minka::transport::Transport;
use minka::{db, logging};

/// Pause before retrying a failed gateway poll.
const POLL_BACKOFF_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "minka", about = "Conversational marketplace bot", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot (default).
    Start,
    /// Create the database schema and exit.
    Migrate,
    /// Print a redacted configuration summary and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start(config).await,
        Command::Migrate => {
            logging::init_cli();
            let pool = db::connect(&config.database_path, config.store_timeout)
                .await
                .context("failed to open database")?;
            db::migrate(&pool).await.context("migration failed")?;
            info!("migrations applied");
            Ok(())
        }
        Command::CheckConfig => {
            logging::init_cli();
            println!("{config}");
            Ok(())
        }
    }
}

async fn start(config: Config) -> Result<()> {
    let _logging_guard = logging::init_production(&PathBuf::from(&config.logs_dir))?;
    info!("minka starting");

    let pool = db::connect(&config.database_path, config.store_timeout)
        .await
        .context("failed to open database")?;
    db::migrate(&pool).await.context("migration failed")?;

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let llm: Option<Arc<dyn LlmClient>> = match &config.openai_api_key {
        Some(key) => {
            info!(model = %config.llm_model, "llm client configured");
            let client = Arc::new(OpenAiClient::new(
                &config.llm_base_url,
                key,
                &config.llm_model,
                config.max_llm_concurrency,
                config.llm_timeout,
            ));
            Some(Arc::new(GuardedLlm::new(client)))
        }
        None => {
            warn!("OPENAI_API_KEY not set -- interpretation and moderation degrade to catalog-only");
            None
        }
    };

    let media: Option<Arc<dyn ObjectStore>> =
        match (&config.storage_url, &config.storage_service_key) {
            (Some(url), Some(key)) => Some(Arc::new(StorageClient::new(
                url,
                &config.storage_bucket,
                key,
            ))),
            _ => {
                warn!("storage not configured -- provider photos limited to absolute URLs");
                None
            }
        };

    let gateway = Arc::new(GatewayClient::new(
        &config.gateway_url,
        &config.gateway_account_id,
    ));
    if !gateway.health_check().await {
        warn!(url = %config.gateway_url, "gateway not reachable yet, continuing");
    }
    let transport: Arc<dyn Transport> = Arc::clone(&gateway) as Arc<dyn Transport>;

    let catalog = Arc::new(ServiceCatalog::new(
        pool.clone(),
        Arc::clone(&kv),
        config.catalog_ttl,
    ));
    catalog.refresh().await;

    let router = Router::new(RouterDeps {
        customers: CustomerRepository::new(pool.clone()),
        consents: ConsentRepository::new(pool.clone()),
        flows: FlowRepository::new(Arc::clone(&kv), config.flow_ttl),
        sessions: Arc::new(SessionLog::new(
            Arc::clone(&kv),
            config.session_log_ttl,
            config.session_log_max_messages,
        )),
        catalog: Arc::clone(&catalog),
        gate: ContentGate::new(Arc::clone(&kv), llm.clone()),
        interpreter: NeedInterpreter::new(Arc::clone(&catalog), llm),
        search: Arc::new(ProviderSearch::new(pool.clone(), Arc::clone(&catalog))),
        availability: Arc::new(AvailabilityCoordinator::new(
            Arc::clone(&kv),
            Arc::clone(&transport),
            config.availability_timeout,
            config.availability_ttl,
            config.availability_poll_interval,
        )),
        transport: Arc::clone(&transport),
        media,
        config: RouterConfig {
            session_timeout: config.session_timeout,
            max_confirm_attempts: config.max_confirm_attempts,
            search_limit: minka::search::DEFAULT_SEARCH_LIMIT,
        },
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    info!("minka ready -- polling gateway for inbound messages");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            polled = gateway.poll_inbound() => match polled {
                Ok(payloads) => {
                    for payload in payloads {
                        let router = Arc::clone(&router);
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            let phone = payload.from_number.clone();
                            let replies = router.handle_safe(payload).await;
                            for reply in replies {
                                if let Err(e) = transport.send(&phone, &reply).await {
                                    error!(phone, error = %e, "failed to send reply");
                                }
                            }
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "gateway poll failed, backing off");
                    tokio::time::sleep(Duration::from_secs(POLL_BACKOFF_SECS)).await;
                }
            },
        }
    }

    info!("minka shutting down");
    Ok(())
}
