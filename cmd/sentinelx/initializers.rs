use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use sentinelx::advisor::{Advisor, HttpAdvisor, HttpAdvisorConfig, RuleAdvisor};
use sentinelx::api::{self, AppState};
use sentinelx::clock::{Clock, SystemClock};
use sentinelx::config::SentinelConfig;
use sentinelx::evaluator::{EvaluatorSettings, MonitorEvaluator};
use sentinelx::execution::{ChainWriter, ExecutionGateway, RpcChainWriter, RpcWriterConfig};
use sentinelx::incidents::IncidentDesk;
use sentinelx::intents::ActionIntentService;
use sentinelx::oracle::{OracleGateway, OracleSource, RouterOracle};
use sentinelx::registry::MonitorRegistry;
use sentinelx::rpc::{EthRpcClient, RpcConfig};
use sentinelx::storage::{Repository, SqliteRepository};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::level_filters::LevelFilter;
use tracing::{Level, error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(LevelFilter::from_level(opts.log_level)))
        .from_env_lossy();

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);
    let fmt_layer = fmt::layer().with_target(include_target);

    tracing_subscriber::registry()
        .with(log_filter)
        .with(fmt_layer)
        .init();
}

pub fn load_config(opts: &Options) -> eyre::Result<SentinelConfig> {
    let config = SentinelConfig::load(opts.config.as_deref()).wrap_err("failed to load configuration")?;
    info!(
        storage = %config.storage.path.display(),
        rpc = config.chain.rpc_url.is_some(),
        demo = config.evaluator.demo_mode,
        "configuration loaded"
    );
    Ok(config)
}

/// Services shared by the poller, the HTTP surface and one-shot commands.
#[derive(Clone)]
pub struct Components {
    pub registry: Arc<MonitorRegistry>,
    pub evaluator: Arc<MonitorEvaluator>,
    pub incidents: Arc<IncidentDesk>,
    pub intents: Arc<ActionIntentService>,
}

impl Components {
    pub fn app_state(&self) -> AppState {
        AppState {
            evaluator: self.evaluator.clone(),
            intents: self.intents.clone(),
            incidents: self.incidents.clone(),
            registry: self.registry.clone(),
        }
    }
}

pub fn init_components(config: &SentinelConfig) -> eyre::Result<Components> {
    let repository: Arc<dyn Repository> = Arc::new(
        SqliteRepository::open(&config.storage.path)
            .wrap_err_with(|| format!("failed to open {}", config.storage.path.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let rpc = config.chain.rpc_url.as_deref().map(|url| {
        Arc::new(EthRpcClient::with_config(
            url,
            RpcConfig {
                timeout: Duration::from_millis(config.chain.rpc_timeout_ms),
                max_retries: config.chain.max_retries,
                ..RpcConfig::default()
            },
        ))
    });

    let live = rpc
        .clone()
        .map(|rpc| Arc::new(RouterOracle::new(rpc)) as Arc<dyn OracleSource>);
    let oracle = Arc::new(OracleGateway::new(
        live,
        config.evaluator.demo_policy(),
        config.default_router()?,
        config.evaluator.read_timeout(),
    ));

    let advisor: Arc<dyn Advisor> = match &config.advisor.url {
        Some(url) => Arc::new(HttpAdvisor::new(HttpAdvisorConfig {
            url: url.clone(),
            timeout: Duration::from_millis(config.advisor.timeout_ms),
        })),
        None => Arc::new(RuleAdvisor),
    };

    let writer = match (config.signer()?, rpc) {
        (Some(signer), Some(rpc)) => {
            info!(address = ?signer.address(), "execution signer loaded");
            let writer = RpcChainWriter::new(
                rpc,
                signer,
                RpcWriterConfig {
                    chain_id: config.chain.chain_id,
                    gas_headroom_percent: config.execution.gas_headroom_percent,
                },
            );
            Some(Arc::new(writer) as Arc<dyn ChainWriter>)
        }
        (Some(_), None) => {
            warn!("signer key set without an RPC endpoint, on-chain execution disabled");
            None
        }
        (None, _) => {
            info!("no signer key configured, intents cannot be executed");
            None
        }
    };
    let execution = Arc::new(ExecutionGateway::new(
        writer,
        config.execution.receipt_timeout(),
        config.execution.receipt_poll(),
    ));

    let evaluator = Arc::new(MonitorEvaluator::new(
        repository.clone(),
        oracle,
        advisor,
        clock.clone(),
        EvaluatorSettings::from(&config.evaluator),
    ));

    Ok(Components {
        registry: Arc::new(MonitorRegistry::new(repository.clone(), clock.clone())),
        incidents: Arc::new(IncidentDesk::new(repository.clone())),
        intents: Arc::new(ActionIntentService::new(repository, execution, clock)),
        evaluator,
    })
}

/// Runs the periodic evaluation loop next to the operator HTTP surface until
/// Ctrl+C.
pub async fn serve(components: Components, config: &SentinelConfig, listen: &str) -> eyre::Result<()> {
    let poll_interval = config.evaluator.poll_interval();
    let evaluator = components.evaluator.clone();
    let poller = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = evaluator.evaluate_all().await {
                error!(%error, "evaluation pass failed");
            }
        }
    });
    info!(poll_seconds = poll_interval.as_secs(), "evaluation loop started");

    // All origins, methods and headers allowed.
    let cors = CorsLayer::permissive();
    let router = api::router(components.app_state()).layer(cors);
    let listener = TcpListener::bind(listen)
        .await
        .wrap_err_with(|| format!("failed to bind {listen}"))?;
    info!("Starting HTTP server at {listen}");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    poller.abort();
    info!("server stopped");
    served.wrap_err("HTTP server failed")
}

/// Completes when SIGINT (Ctrl+C) is received.
pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}
