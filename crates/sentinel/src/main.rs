//! SRE Sentinel - autonomous container monitoring and self-healing daemon
//!
//! Discovers containers labelled `sre-sentinel.monitor=true`, streams their
//! logs and metrics, gates anomalies through a fast classifier, and drives
//! confirmed incidents through root-cause analysis, gateway remediation, and
//! health verification.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_lib::bus::EventBus;
use sentinel_lib::engine::docker::DockerEngine;
use sentinel_lib::engine::ContainerEngine;
use sentinel_lib::executor::RemediationExecutor;
use sentinel_lib::gate::AnomalyGate;
use sentinel_lib::gateway::GatewaySession;
use sentinel_lib::incident::driver::IncidentDriver;
use sentinel_lib::incident::IncidentStore;
use sentinel_lib::inference::analyzer::DeepAnalyzer;
use sentinel_lib::inference::classifier::FastClassifier;
use sentinel_lib::ingest::{IngestConfig, LogIngester};
use sentinel_lib::registry::{ContainerRegistry, DiscoveryConfig, DiscoveryLoop, MonitorSpawner};
use sentinel_lib::rootcause::RootCauseEngine;
use sentinel_lib::sampler::{MetricsSampler, SamplerConfig};
use sentinel_lib::verifier::Verifier;

use sentinel::{api, config};

/// Fatal initialization error (missing configuration)
const EXIT_CONFIG: i32 = 1;
/// Unrecoverable container engine disconnect
const EXIT_ENGINE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting SRE Sentinel");

    let config = match config::SentinelConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration invalid");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let engine: Arc<dyn ContainerEngine> = match DockerEngine::connect() {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "Container engine unreachable");
            std::process::exit(EXIT_ENGINE);
        }
    };
    if let Err(e) = engine.ping().await {
        error!(error = %e, "Container engine did not answer ping");
        std::process::exit(EXIT_ENGINE);
    }

    let bus = EventBus::with_history(config.event_bus_history);
    let registry = Arc::new(ContainerRegistry::new());
    let store = IncidentStore::new(bus.clone());

    let classifier = Arc::new(FastClassifier::new(config.classifier_endpoint()));
    let analyzer = Arc::new(DeepAnalyzer::new(config.analyzer_endpoint()));
    let gateway = Arc::new(GatewaySession::new(config.tool_gateway_url.clone()));

    let rootcause = Arc::new(RootCauseEngine::new(
        engine.clone(),
        registry.clone(),
        analyzer,
        gateway.clone(),
    ));
    let remediation = Arc::new(RemediationExecutor::new(gateway));
    let verifier = Arc::new(Verifier::new(engine.clone()));
    let driver = Arc::new(IncidentDriver::new(
        rootcause,
        remediation,
        verifier,
        config.auto_heal_enabled,
    ));

    let root_cancel = CancellationToken::new();

    // windows flow ingester -> gate over a bounded channel
    let (window_tx, window_rx) = mpsc::channel(64);
    let gate = AnomalyGate::new(classifier, registry.clone(), store.clone(), driver);
    let gate_task = {
        let cancel = root_cancel.child_token();
        tokio::spawn(async move { gate.run(window_rx, cancel).await })
    };

    let ingester = Arc::new(LogIngester::new(
        engine.clone(),
        bus.clone(),
        window_tx,
        IngestConfig {
            window_size: config.log_lines_per_check,
            ..IngestConfig::default()
        },
    ));
    let sampler = Arc::new(MetricsSampler::new(
        engine.clone(),
        registry.clone(),
        bus.clone(),
        SamplerConfig {
            interval: config.sampling_interval(),
        },
    ));

    let spawner: MonitorSpawner = Arc::new(move |descriptor, cancel| {
        let ingester = ingester.clone();
        let sampler = sampler.clone();
        let sampler_descriptor = descriptor.clone();
        let sampler_cancel = cancel.clone();
        tokio::spawn(async move { ingester.run(descriptor, cancel).await });
        tokio::spawn(async move { sampler.run(sampler_descriptor, sampler_cancel).await });
    });

    let discovery = DiscoveryLoop::new(
        engine,
        registry.clone(),
        bus.clone(),
        DiscoveryConfig::default(),
        spawner,
    );
    let mut discovery_task = {
        let cancel = root_cancel.child_token();
        tokio::spawn(async move { discovery.run(cancel).await })
    };

    let state = Arc::new(api::AppState::new(
        registry,
        store,
        bus,
        config.event_bus_capacity,
    ));
    let mut api_task = tokio::spawn(api::serve(config.api_port, state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        result = &mut discovery_task => {
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "Container engine lost");
                    root_cancel.cancel();
                    std::process::exit(EXIT_ENGINE);
                }
                Ok(Ok(())) => info!("Discovery loop stopped"),
                Err(e) => error!(error = %e, "Discovery task panicked"),
            }
        }
        result = &mut api_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Ok(Ok(())) => info!("API server stopped"),
                Err(e) => error!(error = %e, "API task panicked"),
            }
        }
    }

    // cancelled tasks drain buffered windows and in-flight calls briefly
    root_cancel.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        let _ = gate_task.await;
        discovery_task.abort();
        api_task.abort();
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
