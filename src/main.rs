use color_eyre::{eyre::eyre, Result};
use dormlink::config::{ensure_default_config, AppConfig};
use dormlink::mqtt::transport::RumqttTransport;
use dormlink::registry::{ConnectionType, DeviceFilter, DeviceId, DeviceKind, DeviceRegistry, FileRegistry, NewDevice};
use dormlink::telemetry::router::{RefreshOutcome, SlotReading, TelemetryConsumer};
use dormlink::telemetry::topic_state::SlotId;
use dormlink::telemetry::TelemetryBus;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = AppConfig::default_path();
    ensure_default_config(&config_path).await?;
    let config = AppConfig::load(&config_path).await?;

    let registry = Arc::new(FileRegistry::new(config.registry.path.clone()));
    info!("Device registry at {}", registry.path().display());
    let bus = TelemetryBus::spawn(
        &config.mqtt,
        &config.bus,
        registry.clone(),
        RumqttTransport::new(),
    )
    .map_err(|e| eyre!("Failed to start telemetry bus: {}", e))?;
    let _logger = bus.attach(LogConsumer);

    // Result is logged by the consumer
    bus.request_refresh();

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            ctrl_c.cancel();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        match handle_command(line.trim(), &bus, registry.as_ref()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!("{}", e),
        }
    }

    bus.shutdown().await;
    Ok(())
}

/// Returns `false` when the user asked to quit
async fn handle_command(line: &str, bus: &TelemetryBus, registry: &FileRegistry) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    match parts.next().unwrap_or_default() {
        "" => {}
        "quit" | "exit" => return Ok(false),
        "refresh" => {
            bus.request_refresh();
        }
        "state" => {
            let status = bus.session_status();
            info!(
                "Session {:?}, {} received, {} published",
                bus.session_state(),
                status.messages_received,
                status.messages_published
            );
        }
        "readings" => {
            let table = bus.readings();
            for (n, view) in table.slots.iter().enumerate() {
                match &view.latest {
                    Some((reading, at)) => {
                        info!("{} {} {} at {}", SlotId(n), view.topic, reading, at.format("%H:%M:%S"))
                    }
                    None => info!("{} {} no reading yet", SlotId(n), view.topic),
                }
            }
        }
        "devices" => {
            for record in registry.list_devices(DeviceFilter::all()).await? {
                info!(
                    "{} {} sensor={} location={}",
                    record.id,
                    record.topic,
                    record.is_sensor,
                    record.location.as_deref().unwrap_or_default()
                );
            }
        }
        "add" => {
            let usage = || eyre!("usage: add <wifi|nbiot>/<kind>/<device id>");
            let mut fields = parts.next().ok_or_else(usage)?.splitn(3, '/');
            let connection: ConnectionType = fields.next().ok_or_else(usage)?.parse()?;
            let kind: DeviceKind = fields.next().ok_or_else(usage)?.parse()?;
            let device_id = fields.next().ok_or_else(usage)?;
            let record = registry
                .add_device(NewDevice::new(connection, kind, device_id))
                .await?;
            info!("Added {} as {}", record.topic, record.id);
            bus.request_refresh();
        }
        "remove" => {
            let id = parts.next().ok_or_else(|| eyre!("usage: remove <id>"))?;
            registry.delete_device(&DeviceId(id.to_string())).await?;
            bus.request_refresh();
        }
        "publish" => {
            let topic = parts.next().ok_or_else(|| eyre!("usage: publish <topic> <payload>"))?;
            let payload = parts.next().unwrap_or_default().to_string();
            bus.publish(topic, payload).await?;
        }
        other => warn!("Unknown command: {}", other),
    }
    Ok(true)
}

struct LogConsumer;

impl TelemetryConsumer for LogConsumer {
    fn on_reading(&mut self, slot: SlotId, reading: &SlotReading) {
        info!("{} {}: {}", slot, reading.topic, reading.reading);
    }

    fn on_refresh_result(&mut self, result: &RefreshOutcome) {
        match result {
            Ok(report) => {
                info!("Subscribed to {} topic(s)", report.subscribed.len());
                for (topic, e) in &report.failed {
                    warn!("No telemetry for {}: {}", topic, e);
                }
            }
            Err(e) => error!("{}", e),
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
