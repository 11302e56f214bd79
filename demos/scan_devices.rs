use std::time::Duration;
use tracing::{info, warn};
use dualbms::{BmsConfig, BtleRadio, DeviceRegistry, Result, Track};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = match (std::env::var("DUALBMS_PRIMARY"), std::env::var("DUALBMS_SECONDARY")) {
        (Ok(primary), Ok(secondary)) => BmsConfig::with_addresses(&primary, &secondary)?,
        _ => BmsConfig::default(),
    };
    let registry = DeviceRegistry::from_config(&config)?;

    info!("🔍 Scanning for registered BMS devices...");
    let radio = BtleRadio::with_config(&config).await?;
    let found = radio
        .scan_registered(&registry, Duration::from_secs(10))
        .await?;

    for track in Track::ALL {
        let expected = registry.by_track(track).address();
        match found.iter().find(|d| d.track == track) {
            Some(device) => println!(
                "✅ {}: {} rssi={} name={}",
                track,
                device.address,
                device.rssi.map_or_else(|| "?".to_string(), |r| r.to_string()),
                device.local_name.as_deref().unwrap_or("-")
            ),
            None => {
                warn!("{} track BMS {} not advertising", track, expected);
                println!("❌ {track}: {expected} not found");
            }
        }
    }

    Ok(())
}
