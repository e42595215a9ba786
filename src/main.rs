mod analysis;
mod backend;
mod config;
mod executor;
mod llm;
mod prompts;
mod server;
mod store;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use axum::Router;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::analysis::audit::ReportAuditor;
use crate::analysis::{AnalysisRegistry, AnalysisService};
use crate::backend::SqliteBackend;
use crate::backend::schema::SchemaCatalog;
use crate::config::Config;
use crate::executor::ScriptExecutor;
use crate::executor::http::HttpExecutorClient;
use crate::llm::catalog::ModelCatalog;
use crate::prompts::PromptSet;
use crate::store::ExecutionStore;
use crate::store::lua::LuaRuntime;

#[derive(Parser)]
#[command(name = "table-analyst", about = "Natural-language analysis over SQL tables")]
enum Cli {
    /// Start the analysis API (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Start the script executor host
    Executor {
        /// Port to listen on, overriding EXECUTOR_PORT
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow
    // --help and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = Config::from_env();
    let _guard = init_tracing(&config);

    match cli {
        Cli::Serve => run_server(config).await?,
        Cli::Executor { port } => run_executor(config, port).await?,
    }
    Ok(())
}

fn init_tracing(config: &Config) -> sentry::ClientInitGuard {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("table_analyst=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ))
}

fn open_backend(config: &Config) -> Result<Option<Arc<SqliteBackend>>> {
    let Some(path) = &config.database_path else {
        tracing::warn!("DATABASE_PATH not set, analyses will be rejected");
        return Ok(None);
    };
    let backend = SqliteBackend::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(Some(Arc::new(backend)))
}

async fn serve(app: Router, port: u16) -> Result<()> {
    let app = app
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    // Completions stream for minutes; only connecting is bounded tightly.
    let http_client = Arc::new(
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build HTTP client")?,
    );

    let backend = open_backend(&config)?;
    let schema = Arc::new(SchemaCatalog::new());
    if let Some(backend) = &backend {
        schema.refresh(backend).context("failed to read database schema")?;
    }

    let models = Arc::new(ModelCatalog::new());
    if let Some(base_url) = &config.llm_base_url {
        models.discover(&http_client, base_url, &config.llm_api_key).await;
    }

    let executor: Arc<dyn ScriptExecutor> = match &config.executor_url {
        Some(url) => {
            let client = HttpExecutorClient::new((*http_client).clone(), url.as_str());
            match client.status().await {
                Ok(que) => tracing::info!(url = %url, que, "executor host reachable"),
                Err(e) => tracing::warn!(url = %url, error = %e, "executor host not reachable yet"),
            }
            Arc::new(client)
        }
        None => {
            tracing::info!("running scripts in-process");
            Arc::new(ExecutionStore::new(Arc::new(
                LuaRuntime::new(backend.clone()).with_wall_clock(config.script_time_limit),
            )))
        }
    };

    let service = AnalysisService::new(
        Arc::new(AnalysisRegistry::new()),
        models.clone(),
        schema.clone(),
        executor,
        PromptSet::new(config.compact_prompt_models.clone()),
        ReportAuditor::new(config.report_export_dir.clone()),
    );

    let app_state = server::AppState {
        service: Arc::new(service),
        models,
        schema,
        backend,
        http_client,
    };

    serve(server::create_app(app_state), config.port).await
}

async fn run_executor(config: Config, port: Option<u16>) -> Result<()> {
    let backend = open_backend(&config)?;
    let state = server::ExecutorState {
        store: Arc::new(ExecutionStore::new(Arc::new(
            LuaRuntime::new(backend.clone()).with_wall_clock(config.script_time_limit),
        ))),
        backend_ready: backend.is_some(),
    };

    serve(server::create_executor_app(state), port.unwrap_or(config.executor_port)).await
}
