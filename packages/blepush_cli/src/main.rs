mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use blepush::ble::simulated::{SimBleDevice, SimBleNetwork};
use blepush::ble::transport::{BleCentral, GattClient};
use blepush::probe::scan_for_pusher;
use blepush::{run_probe, ProbeConfig, PusherConfig, PusherPeripheral, TransferEvent};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;

use cli::{Cli, Command, ProbeArgs, ServeArgs, TransferOverrides};

/// A transfer event with the wall-clock time it was observed.
#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a TransferEvent,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(cli.config.as_deref(), args).await,
        Command::Probe(args) => probe(cli.config.as_deref(), args).await,
    }
}

fn load_config(
    path: Option<&std::path::Path>,
    overrides: &TransferOverrides,
) -> Result<PusherConfig> {
    let mut config = PusherConfig::load(path).context("loading config")?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Start a pusher on `network` and begin advertising.
async fn start_pusher(
    network: &Arc<SimBleNetwork>,
    config: &PusherConfig,
) -> Result<Arc<PusherPeripheral>> {
    let payload = config.payload.load()?;
    let device = Arc::new(network.create_device());
    log::info!("Peripheral address {}", device.address());

    let pusher = PusherPeripheral::new(
        device.clone(),
        device,
        config.transfer_config()?,
        payload,
    );
    pusher.open().await?;
    pusher.start_advertising().await?;
    Ok(pusher)
}

/// A simulated central: find the pusher, connect, collect `expected` bytes.
async fn run_central(central: SimBleDevice, expected: usize) -> Result<Vec<u8>> {
    let address = scan_for_pusher(&central, Duration::from_secs(5))
        .await?
        .context("pusher not found")?;
    let client: Box<dyn GattClient> = central.connect(&address).await?;
    log::info!("Central {} connected to {}", central.address(), address);

    let mut received = Vec::with_capacity(expected);
    while received.len() < expected {
        let notification = client.next_notification().await?;
        log::debug!(
            "Central {} got {} bytes: {}",
            central.address(),
            notification.value.len(),
            hex::encode(&notification.value)
        );
        received.extend_from_slice(&notification.value);
    }
    client.disconnect().await?;
    Ok(received)
}

async fn serve(config_path: Option<&std::path::Path>, args: ServeArgs) -> Result<()> {
    let config = load_config(config_path, &args.transfer)?;
    let payload = config.payload.load()?;

    let network = SimBleNetwork::new();
    let pusher = start_pusher(&network, &config).await?;
    let mut events = pusher.subscribe();

    let mut centrals = Vec::with_capacity(args.centrals);
    for i in 0..args.centrals {
        if i > 0 && args.join_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.join_delay_ms)).await;
        }
        let central = network.create_device();
        centrals.push(tokio::spawn(run_central(central, payload.len())));
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Event stream: {}", e);
                        continue;
                    }
                };
                if args.json {
                    let line = EventLine { timestamp: Utc::now(), event: &event };
                    println!("{}", serde_json::to_string(&line)?);
                } else {
                    log::info!("{:?}", event);
                }
                if let TransferEvent::Completed { .. } = event {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                pusher.stop_advertising().await?;
                pusher.shutdown();
                return Ok(());
            }
        }
    }

    // Late joiners only see blocks sent after they connected.
    let mut complete = 0;
    for (i, handle) in centrals.into_iter().enumerate() {
        match tokio::time::timeout(Duration::from_secs(1), handle).await {
            Ok(Ok(Ok(received))) if received == payload => complete += 1,
            Ok(Ok(Ok(received))) => {
                log::warn!("Central {} received {} mismatched bytes", i, received.len())
            }
            Ok(Ok(Err(e))) => log::warn!("Central {} failed: {}", i, e),
            Ok(Err(e)) => log::warn!("Central {} panicked: {}", i, e),
            Err(_) => log::info!("Central {} joined late and missed earlier blocks", i),
        }
    }
    println!(
        "All data sent: {} bytes, {} of {} centrals received everything",
        payload.len(),
        complete,
        args.centrals
    );

    pusher.stop_advertising().await?;
    pusher.shutdown();
    Ok(())
}

async fn probe(config_path: Option<&std::path::Path>, args: ProbeArgs) -> Result<()> {
    let config = load_config(config_path, &args.transfer)?;
    let network = SimBleNetwork::new();
    let pusher = start_pusher(&network, &config).await?;

    let central = network.create_device();
    let probe_config = ProbeConfig {
        scan_window: Duration::from_secs(args.scan_secs),
        settle: Duration::from_secs(args.settle_secs),
        ..ProbeConfig::default()
    };
    let report = match run_probe(&central, &probe_config).await? {
        Some(report) => report,
        None => bail!("Target device not found"),
    };

    println!("Connected to {}", report.address);
    for round in &report.rounds {
        println!("Written value: {}", hex::encode(&round.written));
        println!("Read value: {}", hex::encode(&round.read));
    }

    pusher.stop_advertising().await?;
    pusher.shutdown();

    if !report.all_echoed() {
        bail!("characteristic did not echo the written values");
    }
    Ok(())
}
