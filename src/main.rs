//! Tracksocks - Entry Point
//!
//! Starts the proxy listeners and the configuration refresh services, and
//! waits for a shutdown signal or a listener failure.

use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tracksocks::config::{Config, LogConfig};
use tracksocks::proxy::{ListenerConfig, ProxyServer, Scheme};
use tracksocks::services::{HttpDocumentSource, RulesRefreshService, UpstreamRefreshService};
use tracksocks::shutdown::ExitSignal;
use tracksocks::tls::{insecure_client_config, install_trust_anchors, CertificateMinter, SystemTrustStore};
use tracksocks::ProxyContext;

const SIGNAL_REASON: &str = "shutdown signal";

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tracksocks={}", log.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("pretty") {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;
    init_tracing(&config.log);

    info!("Starting Tracksocks");

    let minter = Arc::new(
        CertificateMinter::embedded().context("Embedded CA material is unusable")?,
    );
    let exit = ExitSignal::new();
    let ctx = Arc::new(ProxyContext::new(
        minter,
        insecure_client_config().context("Failed to build upstream TLS config")?,
        exit.clone(),
    ));

    if config.install_ca {
        tokio::task::spawn_blocking(|| {
            let installed = install_trust_anchors(&SystemTrustStore::default());
            info!(installed, "Trust store installation finished");
        });
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    match &config.remote.rules_url {
        Some(url) => {
            let source = Arc::new(HttpDocumentSource::new(
                url.clone(),
                config.remote.fetch_timeout,
            )?);
            let service = Arc::new(RulesRefreshService::new(
                source,
                ctx.clone(),
                config.remote.rules_refresh_interval,
            ));
            service.load_initial().await;
            tasks.push(tokio::spawn(async move { service.run().await }));
        }
        None => warn!("RULES_URL not set, running without rules"),
    }

    match &config.remote.upstream_url {
        Some(url) => {
            let source = Arc::new(HttpDocumentSource::new(
                url.clone(),
                config.remote.fetch_timeout,
            )?);
            let service = UpstreamRefreshService::new(
                source,
                ctx.pool().clone(),
                exit.clone(),
                config.remote.upstream_refresh_interval,
            );
            tasks.push(tokio::spawn(async move { service.run().await }));
        }
        None => info!("UPSTREAM_SETTINGS_URL not set, dialing origins directly"),
    }

    let mut listeners = vec![(Scheme::Http, config.http_addr())];
    if let Some(addr) = config.https_addr() {
        listeners.push((Scheme::Https, addr));
    }

    for (scheme, addr) in listeners {
        let server = ProxyServer::new(
            ctx.clone(),
            ListenerConfig {
                addr: addr.clone(),
                scheme,
                obfuscate: config.proxy.obfuscation,
            },
            config.proxy.failure_policy,
            config.proxy.restart_max_backoff,
        )?;
        info!(%scheme, %addr, obfuscation = config.proxy.obfuscation, "Starting proxy listener");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(%scheme, error = %e, "Proxy listener stopped");
            }
        }));
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            exit.trigger(SIGNAL_REASON);
        }
        reason = exit.wait() => {
            error!(%reason, "Exit requested");
        }
    }

    join_all(tasks).await;
    info!("Tracksocks stopped");

    match exit.reason() {
        Some(reason) if reason != SIGNAL_REASON => anyhow::bail!(reason),
        _ => Ok(()),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
