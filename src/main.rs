use std::path::Path;
use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use site_safety_monitor::alerts::{BroadcastNotifier, FanoutNotifier, LogNotifier, Notifier};
use site_safety_monitor::analysis::{Analyzer, GeminiAnalyzer};
use site_safety_monitor::api::{self, ApiState};
use site_safety_monitor::config::Config;
use site_safety_monitor::monitor::MonitorSettings;
use site_safety_monitor::mqtt::MqttAlertPublisher;
use site_safety_monitor::persistence::JsonFileStore;
use site_safety_monitor::sources::ConfiguredDevices;
use site_safety_monitor::SafetyMonitorBuilder;

#[derive(Parser, Debug)]
#[command(name = "site-safety-monitor", about = "Construction site camera hazard monitor")]
struct Args {
    /// Path to the configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "site_safety_monitor=debug,info".into()),
        )
        .init();

    let args = Args::parse();

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        warn!("Could not find {}, using default configuration", args.config);
        Config::default()
    };

    let media = Arc::new(ConfiguredDevices::from_config(&config.devices)?);
    info!("Configured {} capture device(s)", config.devices.len());

    let analyzer: Option<Arc<dyn Analyzer>> = match config.analysis.resolve_api_key() {
        Some(key) => {
            info!("Hazard analysis enabled using model '{}'", config.analysis.model);
            Some(Arc::new(GeminiAnalyzer::new(&config.analysis, key)?))
        }
        None => {
            warn!("No analysis API key configured (set {}), analysis cycles will be skipped", config.analysis.api_key_env);
            None
        }
    };

    let broadcast = BroadcastNotifier::new(64);
    let mut notifier = FanoutNotifier::new()
        .with(Arc::new(LogNotifier))
        .with(Arc::new(broadcast.clone()));

    if let Some(mqtt_config) = config.mqtt.as_ref().filter(|m| m.enabled) {
        match MqttAlertPublisher::start(mqtt_config) {
            Ok(publisher) => notifier = notifier.with(Arc::new(publisher)),
            Err(e) => error!("Failed to start MQTT alert publisher: {}", e),
        }
    }
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);

    let store = Arc::new(JsonFileStore::new(&config.monitor.state_dir)?);

    let monitor = SafetyMonitorBuilder::new()
        .media(media)
        .analyzer(analyzer)
        .notifier(notifier)
        .store(store)
        .settings(MonitorSettings::from_config(&config)?)
        .build()?;

    if let Err(e) = monitor.scan_devices().await {
        warn!("Initial device scan failed: {}", e);
    }
    monitor.restore().await;

    let app = api::router(ApiState::new(monitor.clone(), broadcast))
        .layer(api::cors_layer(config.server.cors_allow_origin.as_deref()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    monitor.shutdown().await;
    Ok(())
}
