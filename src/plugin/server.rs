// src/plugin/server.rs

//! The plugin bootstrap: turns a configured plugin into a running,
//! mTLS-secured HTTP service discoverable by the registry.
//!
//! The ordering below is the only valid one: the multiplexed listener
//! serves plaintext (liveness included) immediately, TLS is installed once
//! gossip delivers the CA, the registry is discovered from the membership
//! view, and readiness is announced last.

use crate::config::Config;
use crate::core::BeskarError;
use crate::gossip::{Gossip, GossipEvent, MemberMeta, NodeKind};
use crate::mtls::{self, CaBundle};
use crate::mux::{ClientConn, MuxListener};
use crate::plugin::Descriptor;
use crate::plugin::endpoints::{self, CoreState, EventSink};
use crate::plugin::registry::RegistryClient;
use crate::plugin::transport;
use crate::repository::handler::Handler;
use crate::repository::manager::RepositoryManager;
use crate::storage::{self, Store};
use anyhow::{Context, Result};
use axum::Router;
use axum::middleware;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// Platform-specific signal handling imports
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(windows)]
use tokio::signal;

/// Shared handles the plugin builder wires its manager and API router from.
pub struct PluginContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<RegistryClient>,
}

/// What a plugin contributes to the runtime: its manager, its
/// repository-management API router (TLS-gated by the bootstrap), and an
/// optional public web router served without the TLS gate.
pub struct PluginRuntime<H: Handler> {
    pub manager: Arc<RepositoryManager<H>>,
    pub api_router: Router,
    pub web_router: Router,
}

/// Waits for a shutdown signal based on the operating system.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// Runs a plugin to completion. `build` receives the shared handles and
/// returns the plugin's manager and API router.
pub async fn serve<H, F>(config: Config, descriptor: Descriptor, build: F) -> Result<()>
where
    H: Handler,
    F: FnOnce(&PluginContext) -> Result<PluginRuntime<H>, BeskarError>,
{
    // Several TLS providers may be linked in; pin the process default so
    // rustls config builders are unambiguous.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Arc::new(config);
    let store = storage::new_store(&config.storage)?;
    let registry = Arc::new(RegistryClient::new_pending());
    let plugin_ctx = PluginContext {
        config: config.clone(),
        store: store.clone(),
        registry: registry.clone(),
    };
    let runtime = build(&plugin_ctx)?;
    let manager = runtime.manager.clone();

    // Webhook events resolve their repository's worker through the manager
    // and are durably recorded before the 2xx acknowledgement.
    let events: EventSink = {
        let manager = manager.clone();
        Arc::new(move |event| {
            let manager = manager.clone();
            Box::pin(async move {
                let handler = manager.get(&event.repository).await?;
                handler.queue_event(event, true).await
            })
        })
    };

    let core_state = CoreState {
        info: Arc::new(descriptor.encode()?),
        events,
        profiling: config.profiling,
    };
    let api_router = runtime
        .api_router
        .layer(middleware::from_fn(endpoints::require_tls));
    let app = endpoints::core_router(core_state)
        .merge(api_router)
        .merge(runtime.web_router);

    // 1-2: multiplex the listener and start serving plaintext immediately.
    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind service address '{}'", config.addr))?;
    let mux = MuxListener::new(listener);
    let tls_slot = mux.tls_slot();
    info!(
        "Plugin '{}' listening on {} (plaintext until the cluster CA arrives).",
        descriptor.name, config.addr
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut http_shutdown = shutdown_tx.subscribe();
    let mut server_task = Some(tokio::spawn(async move {
        axum::serve(mux, app.into_make_service_with_connect_info::<ClientConn>())
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    }));

    // 3: join gossip and derive or receive the CA.
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let gossip_port = config
        .gossip
        .addr
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid gossip address '{}'", config.gossip.addr))?;
    let meta = MemberMeta {
        id: uuid::Uuid::new_v4().to_string(),
        kind: NodeKind::Plugin,
        hostname: hostname.clone(),
        addr: format!("{hostname}:{gossip_port}"),
        service_port: config.service_port()?,
        registry_port: 0,
        ready: false,
    };
    let (gossip, mut gossip_events) = Gossip::start(&config.gossip, meta, None)
        .await
        .context("Failed to join the gossip fabric")?;

    let ca = match gossip.remote_state() {
        Some(bytes) => {
            let ca = CaBundle::decode(&bytes)?;
            info!("Adopted cluster CA from the fleet.");
            ca
        }
        None => {
            let ca = mtls::generate_ca()?;
            gossip.set_local_state(ca.encode()?);
            info!("Generated a new cluster CA for the fleet.");
            ca
        }
    };

    let sans = mtls::local_sans(&hostname).await;
    let identity = mtls::issue_identity(&ca, &hostname, sans)?;
    tls_slot.install(Arc::new(mtls::server_config(&ca, &identity)?));
    info!("Cluster TLS configuration installed; TLS connections now accepted.");

    // 4-5: discover the registry and build the mTLS transport to it.
    let endpoint = transport::discover_registry(
        &gossip,
        &mut gossip_events,
        transport::REGISTRY_DISCOVERY_TIMEOUT,
    )
    .await?;
    registry.install(&endpoint, transport::registry_http_client(&ca, &identity)?);

    // 8: announce readiness.
    gossip.mark_as_ready().await?;
    info!("Plugin '{}' is ready.", descriptor.name);

    // Keep draining gossip events so liveness changes are observed.
    let events_task = tokio::spawn(async move {
        while let Some(event) = gossip_events.recv().await {
            match event {
                GossipEvent::Error(e) => warn!("Gossip error: {e}"),
                GossipEvent::Leave(meta) => debug!("Member {} left.", meta.id),
                _ => {}
            }
        }
    });

    // 9: block until the server errors or the process is told to stop.
    tokio::select! {
        result = server_task.as_mut().expect("server task present") => {
            match result {
                Ok(Ok(())) => info!("HTTP server stopped."),
                Ok(Err(e)) => error!("HTTP server failed: {e}"),
                Err(e) => error!("HTTP server task panicked: {e:?}"),
            }
            server_task = None;
        }
        _ = await_shutdown_signal() => {}
    }

    info!("Shutting down. Stopping repository workers.");
    let _ = shutdown_tx.send(());
    manager.stop_all().await;
    info!("All repository workers stopped.");

    gossip.shutdown().await;
    events_task.abort();

    if let Some(handle) = server_task {
        if tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .is_err()
        {
            warn!("Timed out waiting for the HTTP server to finish cleanly.");
        }
    }
    info!("Plugin '{}' shutdown complete.", descriptor.name);
    Ok(())
}
