//! Process wiring for the `switchyard` binary: the serve loop plus the
//! `doctor`, `status` and `init` subcommands.

use crate::backends::LlmBackendFactory;
use crate::compaction::{CompactionPolicy, Compactor};
use crate::config::{CONFIG_TEMPLATE, SwitchyardConfig, default_config_path};
use crate::failover::state::RouteStateStore;
use crate::failover::{BackendFactory, FailoverPolicy, FailoverRouter};
use crate::gateway::Gateway;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::plan::PlanStore;
use crate::routes;
use crate::session::{FileSessionStore, HistoryStore};
use crate::turns::TurnRegistry;
use crate::usage::{self, UsageFilter, UsageLedger, UsageSink};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use yard_channels::{ChannelAdapter, TelegramAdapter, WebChatAdapter};
use yard_tools::{
    ExecTool, ListDirTool, ReadFileTool, SleepTool, ToolExecutor, ToolRegistry, Workspace,
    WriteFileTool,
};

/// Read-only view the HTTP control surface serves from.
pub struct AppState {
    pub started_at: Instant,
    pub router: Arc<FailoverRouter>,
    pub turns: Arc<TurnRegistry>,
    pub channels: Vec<String>,
}

fn model_chain(cfg: &SwitchyardConfig) -> Vec<String> {
    let mut chain = vec![cfg.general.model.trim().to_string()];
    for model in &cfg.general.fallback_models {
        let model = model.trim();
        if !model.is_empty() && !chain.iter().any(|m| m == model) {
            chain.push(model.to_string());
        }
    }
    chain
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path).await?;
    let factory = LlmBackendFactory::new(cfg.keys.clone());
    let mut failures = Vec::new();
    for model in model_chain(&cfg) {
        match factory.build(&model) {
            Ok(backend) => {
                println!("ok    {model} ({})", backend.provider().as_str());
            }
            Err(e) => {
                println!("error {model}: {e}");
                failures.push(model);
            }
        }
    }
    tracing::info!(
        model = %cfg.general.model,
        fallback_count = cfg.general.fallback_models.len(),
        data_dir = %cfg.data_dir().display(),
        failures = failures.len(),
        "doctor finished"
    );
    if !failures.is_empty() {
        return Err(anyhow::anyhow!(
            "no backend could be built for: {}",
            failures.join(", ")
        ));
    }
    println!("config ok");
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path).await?;
    let store = RouteStateStore::new(cfg.failover_state_path());
    match store.load()? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!(
            "no persisted route state at {}; routing starts on {}",
            store.path().display(),
            cfg.general.model
        ),
    }

    let ledger = UsageLedger::open(cfg.usage_path());
    let today = usage::today_key();
    let records = ledger.query(&UsageFilter {
        day_key: Some(today.clone()),
        ..UsageFilter::default()
    });
    let totals = usage::aggregate(&records);
    println!(
        "usage {today}: calls={} known={} unknown={} prompt={} completion={} total={}",
        totals.calls,
        totals.known_calls,
        totals.unknown_calls,
        usage::grouped_int(totals.prompt_tokens),
        usage::grouped_int(totals.completion_tokens),
        usage::grouped_int(totals.total_tokens),
    );
    Ok(())
}

/// Writes the config template unless a config already exists.
pub async fn init(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);
    if tokio::fs::try_exists(&path).await? {
        println!("switchyard init: config already present at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, CONFIG_TEMPLATE).await?;
    println!("switchyard init: wrote {}", path.display());
    println!("next: add an API key under [keys] or export OPENAI_API_KEY / ANTHROPIC_API_KEY");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.channels.webchat.port));
    tracing::info!(
        model = %cfg.general.model,
        fallback_models = ?cfg.general.fallback_models,
        data_dir = %cfg.data_dir().display(),
        failover_enabled = cfg.failover.enabled,
        failover_hold_minutes = cfg.failover.hold_minutes,
        failover_probe_interval_minutes = cfg.failover.probe_interval_minutes,
        failover_probe_success_threshold = cfg.failover.probe_success_threshold,
        switchback_requires_approval = cfg.failover.switchback_requires_approval,
        plan_enabled = cfg.plan.enabled,
        plan_min_steps = cfg.plan.min_steps,
        plan_max_steps = cfg.plan.max_steps,
        max_tool_iterations = cfg.agent.max_tool_iterations,
        webchat_enabled = cfg.channels.webchat.enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        bind_addr = %addr,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    tokio::fs::create_dir_all(cfg.plans_dir()).await?;
    tokio::fs::create_dir_all(cfg.workspace_root()).await?;

    let ledger = Arc::new(UsageLedger::open(cfg.usage_path()));
    let usage_sink: Arc<dyn UsageSink> = ledger.clone();

    let router = Arc::new(
        FailoverRouter::new(
            &cfg.general.model,
            &cfg.general.fallback_models,
            FailoverPolicy::from(&cfg.failover),
            Arc::new(LlmBackendFactory::new(cfg.keys.clone())),
            Some(RouteStateStore::new(cfg.failover_state_path())),
        )
        .with_usage_sink(usage_sink.clone()),
    );
    let route = router.resolve_route()?;
    tracing::info!(
        active_model = %route.model,
        switch_epoch = route.epoch,
        "model route resolved"
    );

    let tools = build_tools(&cfg)?;
    let history: Arc<dyn HistoryStore> = Arc::new(FileSessionStore::new(cfg.sessions_dir()));
    let compactor = Arc::new(Compactor::new(
        CompactionPolicy::from(&cfg.agent),
        router.clone(),
        history.clone(),
        Some(usage_sink.clone()),
    ));
    let turns = TurnRegistry::new();
    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig::from(&cfg),
        router.clone(),
        tools,
        history,
        turns.clone(),
    )
    .with_usage_sink(usage_sink)
    .with_compactor(compactor);
    if cfg.plan.persist {
        orchestrator = orchestrator.with_plan_store(PlanStore::new(cfg.plans_dir()));
    }
    let orchestrator = Arc::new(orchestrator);

    // Channels.
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    let mut webchat_router = None;
    if cfg.channels.webchat.enabled {
        let webchat = Arc::new(WebChatAdapter::new());
        webchat.start(inbound_tx.clone()).await?;
        webchat_router = Some(webchat.clone().router());
        channels.insert(webchat.channel_id().to_string(), webchat);
    }
    if cfg.channels.telegram.enabled {
        let telegram = Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?);
        telegram.start(inbound_tx.clone()).await?;
        channels.insert(telegram.channel_id().to_string(), telegram);
    }
    drop(inbound_tx);
    if channels.is_empty() {
        tracing::warn!("no chat channels enabled; only the HTTP control surface is served");
    }

    let gateway = Arc::new(Gateway::new(
        started_at,
        orchestrator,
        Some(ledger),
        channels,
        inbound_rx,
    ));
    let channel_names = gateway.channel_names().to_vec();
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(
        channel_count = channel_names.len(),
        channels = ?channel_names,
        "gateway started"
    );

    let state = Arc::new(AppState {
        started_at,
        router,
        turns,
        channels: channel_names,
    });
    let mut api = routes::router().layer(Extension(state));
    if let Some(webchat_router) = webchat_router {
        api = api.merge(webchat_router);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = api
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "switchyard serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

fn build_tools(cfg: &SwitchyardConfig) -> Result<Arc<dyn ToolExecutor>> {
    let workspace = Workspace::new(cfg.workspace_root())?;
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool::new(workspace.clone())))?;
    registry.register(Arc::new(WriteFileTool::new(workspace.clone())))?;
    registry.register(Arc::new(ListDirTool::new(workspace.clone())))?;
    if cfg.tools.exec_enabled {
        registry.register(Arc::new(ExecTool::new(
            workspace,
            Duration::from_secs(cfg.tools.exec_timeout_seconds),
            cfg.tools.exec_output_max_chars,
        )))?;
    }
    registry.register(Arc::new(SleepTool))?;
    tracing::info!(tools = ?registry.names(), "tool registry built");
    Ok(Arc::new(registry))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_chain_dedupes_and_keeps_primary_first() {
        let cfg: SwitchyardConfig = toml::from_str(
            "[general]\nmodel = \"gpt-4o\"\nfallback_models = [\"gpt-4o\", \" \", \"gpt-4o-mini\"]\n",
        )
        .unwrap();
        assert_eq!(
            model_chain(&cfg),
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]
        );
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().unwrap());
        assert_eq!(request_id_from_headers(&headers), "abc");
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        init(Some(path.clone())).await.unwrap();
        std::fs::write(&path, "[general]\nmodel = \"custom\"\n").unwrap();
        init(Some(path.clone())).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("custom"));
    }
}
