mod aggregate;
mod alert;
mod broadcast;
mod config;
mod coordinator;
mod http;
mod ingest;
mod mqtt;
mod runtime;
mod store;
mod sync;
mod telemetry;

use crate::aggregate::AggregationEngine;
use crate::alert::{AlertTrigger, LogNotifier, Notifier, SoundNotifier, WebhookNotifier};
use crate::broadcast::SnapshotBus;
use crate::config::{BroadcastMode, Config};
use crate::coordinator::CoordinatorService;
use crate::http::HttpState;
use crate::ingest::Ingestor;
use crate::mqtt::LatestMessages;
use crate::runtime::{Instance, RuntimeSettings};
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::sync::SnapshotSync;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future;
use std::sync::Arc;

const WEBHOOK_QUEUE: usize = 32;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,smoke_telemetry=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "smoke-telemetry"),
                KeyValue::new("service.instance.id", config.instance_id.clone()),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn open_store(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    match &config.store_dir {
        Some(dir) => {
            let store = FileStore::open(dir, config.store_quota_bytes)
                .with_context(|| format!("failed to open store at {}", dir.display()))?;
            tracing::info!(dir = %store.dir().display(), "using file store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "SMOKE_STORE_DIR not set; state is in-memory and not shared with other instances"
            );
            Ok(Arc::new(MemoryStore::new(config.store_quota_bytes)))
        }
    }
}

fn build_notifiers(config: &Config) -> Vec<Box<dyn Notifier>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(url) = &config.alert_webhook_url {
        notifiers.push(Box::new(WebhookNotifier::spawn(url.clone(), WEBHOOK_QUEUE)));
    }
    if let Some(command) = config.alert_sound_command.as_deref() {
        match SoundNotifier::from_command_line(command) {
            Some(sound) => notifiers.push(Box::new(sound)),
            None => tracing::warn!("SMOKE_ALERT_SOUND_COMMAND is empty; ignoring"),
        }
    }
    notifiers
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let store = open_store(&config)?;
    let sources = config.active_sources();
    let now = Utc::now();

    let mqtt_topics = config.mqtt_source_topics();
    let (latest, source_listener) = if config.mqtt_enabled && !mqtt_topics.is_empty() {
        let latest = LatestMessages::default();
        let handle = mqtt::spawn_source_listener(config.clone(), mqtt_topics, latest.clone());
        (Some(latest), Some(handle))
    } else {
        (None, None)
    };
    let ingestor = Ingestor::new(config.http_timeout(), latest, config.mqtt_stale_after())?;

    let (sync, bus_handle) = match config.broadcast {
        BroadcastMode::Mqtt => {
            let (bus, handle) = SnapshotBus::mqtt(&config);
            (
                SnapshotSync::push(store.clone(), bus, config.instance_id.clone()),
                Some(handle),
            )
        }
        BroadcastMode::Local => (
            SnapshotSync::push(store.clone(), SnapshotBus::local(), config.instance_id.clone()),
            None,
        ),
        BroadcastMode::Off => (
            SnapshotSync::poll(store.clone(), config.instance_id.clone()),
            None,
        ),
    };

    let engine = runtime::shared(
        AggregationEngine::load(
            store.clone(),
            config.aggregation_policy(),
            config.thresholds(),
            now,
        ),
        AlertTrigger::new(
            config.thresholds(),
            config.alert_cooldown(),
            build_notifiers(&config),
            store.clone(),
        ),
    );

    let instance = Instance::start(
        CoordinatorService::new(store, config.instance_id.clone(), config.lease_timeout()),
        engine,
        ingestor,
        sources,
        sync,
        RuntimeSettings::from_config(&config),
    );

    let app = http::router(HttpState {
        engine: instance.engine(),
        coordinator: instance.coordinator(),
        roles: instance.roles(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "read API listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error=%err, "read API exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = async {
            match bus_handle {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        } => {
            if let Err(err) = res { tracing::error!(error=%err, "snapshot bus task failed"); }
        }
    }

    http_handle.abort();
    if let Some(handle) = source_listener {
        handle.abort();
    }
    instance.shutdown().await;

    Ok(())
}
