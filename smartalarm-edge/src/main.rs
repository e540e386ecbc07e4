use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use smartalarm_edge::alarm::AlarmEngine;
use smartalarm_edge::config::EdgeConfig;
use smartalarm_edge::events::JsonEventStore;
use smartalarm_edge::fitbit::FitbitClient;
use smartalarm_edge::http::{self, AppState};
use smartalarm_edge::model::LocalQualityModel;
use smartalarm_edge::monitor::{MonitorTopics, SleepMonitor};
use smartalarm_edge::mqtt::{MqttLink, Topics};
use smartalarm_edge::ports::{
    AlarmEventSink, AlertPublisher, NoopAlertPublisher, NullDataProvider, TwinTransport,
    WearableDataProvider,
};
use smartalarm_edge::state::StatusFlags;
use smartalarm_edge::twin::{TwinSettings, TwinSyncClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let config = EdgeConfig::load()?;
    info!("smartalarm edge starting (device {:?})", config.device.device_id);

    let flags = Arc::new(StatusFlags::new());
    let engine = Arc::new(AlarmEngine::new());
    let events: Arc<dyn AlarmEventSink> = Arc::new(
        JsonEventStore::new(config.device.data_dir.join("alarm_events.json"))
            .context("opening alarm event log")?,
    );

    let (twin_tx, twin_rx) = mpsc::channel();
    let link = match MqttLink::start(&config.mqtt, &config.device.device_id, twin_tx).await {
        Ok(link) => Some(link),
        Err(e) => {
            warn!("mqtt disabled: {e:#}");
            None
        }
    };

    let provider: Arc<dyn WearableDataProvider> = match FitbitClient::from_config(&config.fitbit) {
        Some(client) => {
            flags.set_fitbit_connected(true);
            Arc::new(client)
        }
        None => {
            warn!("no fitbit credentials, sleep data disabled");
            Arc::new(NullDataProvider)
        }
    };

    let topics = link
        .as_ref()
        .map(|l| l.topics().clone())
        .unwrap_or_else(|| Topics::new(&config.mqtt.topic_base, "local"));
    let publisher: Arc<dyn AlertPublisher> = match &link {
        Some(link) => Arc::clone(link) as Arc<dyn AlertPublisher>,
        None => Arc::new(NoopAlertPublisher),
    };

    let monitor = Arc::new(SleepMonitor::new(
        Arc::clone(&engine),
        provider,
        Arc::new(LocalQualityModel::new()),
        Arc::clone(&publisher),
        Arc::clone(&events),
        Arc::clone(&flags),
        Duration::from_secs(config.monitor.fetch_interval_secs),
        MonitorTopics {
            predictions: topics.predictions.clone(),
            alerts: topics.alerts.clone(),
        },
    ));

    let twin = Arc::new(TwinSyncClient::new(
        link.as_ref()
            .map(|l| Arc::clone(l) as Arc<dyn TwinTransport>),
        Arc::clone(&engine),
        Arc::clone(&monitor),
        Arc::clone(&flags),
        TwinSettings {
            min_send_interval: Duration::from_secs(config.twin.min_send_interval_secs),
            flush_tick: Duration::from_secs(config.twin.flush_tick_secs),
            max_sends_per_minute: config.twin.max_sends_per_minute,
            breaker_cooldown: Duration::from_secs(config.twin.breaker_cooldown_secs),
        },
    ));
    twin.init();
    twin.start(twin_rx);

    let state = AppState {
        engine,
        monitor: Arc::clone(&monitor),
        twin: Arc::clone(&twin),
        events,
        publisher,
        flags,
        alerts_topic: topics.alerts.clone(),
    };
    let app = http::router(state);

    let addr = format!("0.0.0.0:{}", config.monitor.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("http api listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;

    monitor.stop();
    twin.stop();
    Ok(())
}
