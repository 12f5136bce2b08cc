use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use tracing::{error, info, warn};

use tether_client::format_websocket_url;
use tether_core::provider::LlmProvider;
use tether_engine::{build_system_prompt, create_default_registry, AgentConfig, SkillLoader};
use tether_llm::{EchoProvider, OpenAiConfig, OpenAiProvider, ReliableConfig, ReliableProvider};
use tether_server::{CloudflareTunnel, ServerConfig, Tunnel, TunnelEvent, TurnOrchestrator};
use tether_settings::{LlmSettings, TetherSettings};
use tether_telemetry::{init_telemetry, TelemetryConfig};

use crate::ServeArgs;

pub async fn run(mut settings: TetherSettings, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if args.tunnel {
        settings.server.enable_tunnel = true;
    }

    let data_dir = settings.server.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.clone(),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist,
        ..TelemetryConfig::in_dir(&data_dir)
    });

    info!(version = env!("CARGO_PKG_VERSION"), "starting tether server");

    let provider = build_provider(&settings.llm).await?;
    let skills = Arc::new(SkillLoader::discover(Path::new(&settings.tools.skills_dir)));
    let system_prompt =
        build_system_prompt(Path::new(&settings.agent.system_prompt_path), &skills);
    let tools = Arc::new(create_default_registry(Arc::clone(&skills)));
    info!(
        provider = provider.name(),
        model = provider.model(),
        skills = skills.count(),
        tools = ?tools.names(),
        "agent ready"
    );

    let orchestrator = Arc::new(
        TurnOrchestrator::new(
            provider,
            tools,
            system_prompt,
            AgentConfig {
                max_steps: settings.agent.max_steps,
                tool_timeout: Duration::from_secs(settings.agent.tool_timeout_secs),
            },
        )
        .with_metrics(telemetry.metrics()),
    );

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
        ws_ping_interval: Duration::from_secs(settings.server.ws_ping_interval_secs),
        metrics_interval: Duration::from_secs(settings.server.metrics_interval_secs),
    };
    let handle = tether_server::start(
        config,
        orchestrator,
        telemetry.client_log_sink(),
        telemetry.metrics(),
    )
    .await
    .context("failed to start server")?;

    let port = handle.port();
    info!(
        local = %format_websocket_url(&format!("localhost:{port}")),
        "accepting connections"
    );

    let tunnel = if settings.server.enable_tunnel {
        start_tunnel(port).await
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");

    if let Some(tunnel) = tunnel {
        tunnel.stop().await;
    }
    handle.shutdown().await;
    Ok(())
}

/// The configured model, or the echo provider when no API key is set.
async fn build_provider(llm: &LlmSettings) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let Some(key) = llm.effective_api_key() else {
        warn!("no LLM API key configured, replies will echo the input");
        return Ok(Arc::new(EchoProvider::new()));
    };

    let provider = OpenAiProvider::new(OpenAiConfig {
        api_base: llm.api_base.clone(),
        api_key: SecretString::from(key.to_string()),
        model: llm.model.clone(),
        max_tokens: llm.max_tokens,
        request_timeout: Duration::from_secs(llm.request_timeout_secs),
    })
    .context("failed to build LLM client")?;
    match provider.check_connection().await {
        Ok(()) => info!(model = %llm.model, "LLM endpoint reachable"),
        Err(e) => warn!(error = %e, kind = e.error_kind(), "LLM endpoint check failed"),
    }

    if !llm.retry.enabled {
        return Ok(Arc::new(provider));
    }
    Ok(Arc::new(ReliableProvider::new(
        provider,
        ReliableConfig {
            max_retries: llm.retry.max_retries,
            ..Default::default()
        },
    )))
}

/// Start the tunnel, logging its lifecycle. Failure leaves the server
/// reachable locally only.
async fn start_tunnel(port: u16) -> Option<CloudflareTunnel> {
    let tunnel = CloudflareTunnel::new(port);
    let mut events = tunnel.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TunnelEvent::Url(url) => info!(url = %url, "tunnel url"),
                TunnelEvent::Error(message) => error!(error = %message, "tunnel failed"),
                TunnelEvent::Closed => info!("tunnel closed"),
            }
        }
    });

    match tunnel.start().await {
        Ok(url) => {
            info!(public = %format_websocket_url(&url), "tunnel ready");
            Some(tunnel)
        }
        Err(e) => {
            error!(error = %e, "tunnel unavailable, serving locally only");
            None
        }
    }
}
