use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};

mod address;
mod cache;
mod config;
mod distance;
mod error;
mod identity;
mod manager;
mod messages;
mod mqtt;
mod scanner;
mod scheduler;
mod telemetry;
#[cfg(test)]
mod testing;
mod watchdog;
mod whitelist;

/// Relays whitelisted BLE beacon sightings to an MQTT broker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Scan and log flushes without connecting to the broker.
    #[arg(long)]
    no_publish: bool,

    /// Print the device id this scanner reports, then exit.
    #[arg(long)]
    print_identity: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "beacon_relay=debug" } else { "beacon_relay=info" };
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()))
        .init();

    let config = config::AppConfig::from_file(&args.config)?;

    let device_id = identity::IdentityResolver::from_config(&config.identity()).resolve();
    if args.print_identity {
        println!("{device_id}");
        return Ok(());
    }

    let scan = config.scan();
    let whitelist = if scan.whitelist_enabled() {
        for device in config.devices() {
            info!(
                "Whitelisted {} ({})",
                device.address,
                device.name.as_deref().unwrap_or("unnamed")
            );
        }
        if config.devices().is_empty() {
            warn!("Whitelist is enabled but empty, no sightings will be published");
        }
        whitelist::Whitelist::from_addresses(config.devices().iter().map(|d| d.address.to_string()))
    } else {
        info!("Whitelist disabled, all sightings are accepted");
        whitelist::Whitelist::allow_all()
    };

    if let Some(entries) = whitelist.entries() {
        info!("Whitelist holds {entries} devices");
    }

    let distance = config.distance();
    let estimator =
        distance::DistanceEstimator::new(distance.reference_power(), distance.path_loss_exponent());

    let broker = (config.mqtt.enabled() && !args.no_publish).then(|| {
        let transport = mqtt::MqttTransport::new(&config.mqtt);
        mqtt::BrokerConnectionManager::new(transport, config.mqtt.topic())
    });

    let source = scanner::BtleScanSource::first_adapter()
        .await
        .context("initializing bluetooth")?;

    let pipeline = manager::Pipeline::new(
        source,
        whitelist,
        estimator,
        telemetry::TelemetryPublisher::new(device_id),
        manager::PipelineSettings::from(&scan),
    )
    .spawn(broker);

    if !pipeline.start().await {
        pipeline.shutdown().await;
        anyhow::bail!("scanning could not be started");
    }

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut user1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut user2 = signal(SignalKind::user_defined2()).context("installing SIGUSR2 handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                break;
            }
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                info!("SIGHUP received, restarting scan");
                pipeline.restart();
            }
            _ = user1.recv() => {
                info!("SIGUSR1 received, stopping scan");
                pipeline.stop().await;
            }
            _ = user2.recv() => {
                info!("SIGUSR2 received, starting scan");
                if !pipeline.start().await {
                    warn!("Scanning could not be started");
                }
            }
        }
    }

    info!("Shutting down");
    pipeline.shutdown().await;

    Ok(())
}
