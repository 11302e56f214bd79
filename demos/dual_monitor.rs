use tokio::time::{interval, Instant};
use tracing::{error, info};
use dualbms::{BmsConfig, BmsService, HealthStatus, Result};

const DEFAULT_PRIMARY: &str = "A4:C1:38:7C:2D:F0";
const DEFAULT_SECONDARY: &str = "E0:9F:2A:E4:94:1D";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let primary = std::env::var("DUALBMS_PRIMARY").unwrap_or_else(|_| DEFAULT_PRIMARY.to_string());
    let secondary =
        std::env::var("DUALBMS_SECONDARY").unwrap_or_else(|_| DEFAULT_SECONDARY.to_string());
    let config = BmsConfig::with_addresses(&primary, &secondary)?;

    info!("🔋 Dual BMS monitor");
    info!("Primary track: {}, secondary track: {}", primary, secondary);

    let mut service = match BmsService::start_ble(config).await {
        Ok(service) => service,
        Err(e) => {
            if e.is_fatal() {
                error!("❌ Bluetooth is not usable on this host");
            }
            error!("❌ Failed to start: {}", e);
            return Err(e);
        }
    };

    info!("Press Ctrl+C to stop monitoring");

    let poll_interval = service.config().poll_interval();
    let mut ticker = interval(poll_interval);
    let start_time = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        let elapsed = start_time.elapsed().as_secs();
        let status = service.get_connection_status();
        let readings = service.read_battery_data().await;

        println!("\n📊 Status ({:02}:{:02})", elapsed / 60, elapsed % 60);
        println!(
            "Primary: {}  Secondary: {}",
            if status.primary_connected { "connected" } else { "waiting" },
            if status.secondary_connected { "connected" } else { "waiting" }
        );

        for reading in &readings {
            let marker = match reading.status {
                HealthStatus::Normal => "  ",
                HealthStatus::Warning => "⚠️",
                HealthStatus::Critical => "🛑",
            };
            println!(
                "{} #{} {} {:5.2}V {:5.2}A {:3}°C {:3}%",
                marker,
                reading.battery_number,
                reading.track,
                reading.voltage,
                reading.amperage,
                reading.temperature,
                reading.charge_level
            );
        }

        if readings.is_empty() {
            for (address, entry) in service.get_device_status() {
                println!(
                    "   {} ({}) {} attempts={} {}",
                    address,
                    entry.track,
                    entry.state,
                    entry.reconnect_attempts,
                    entry.last_error.unwrap_or_default()
                );
            }
        }
    }

    info!("Shutting down...");
    service.shutdown().await?;
    info!("✅ Monitor stopped");

    Ok(())
}
