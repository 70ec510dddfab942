use std::io::{self, BufRead};

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tokio::sync::mpsc;

use poweredup_rs::ble::BleTransport;
use poweredup_rs::hub::{Hub, HubConfig};
use poweredup_rs::scanner::Scanner;
use poweredup_rs::types::{Color, HubEvent};

/// Hub events printed as JSON lines.
const HUB_EVENTS: &[&str] = &[
    "attach",
    "detach",
    "button",
    "batteryLevel",
    "rssi",
    "disconnect",
];

/// Device readings printed as JSON lines.  Listening subscribes every
/// attached device that reports one of them.
const READINGS: &[&str] = &["rotate", "tilt", "color", "remoteButton", "speed", "force"];

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=poweredup_rs=debug cargo run --features ble
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = HubConfig {
        name_filter: std::env::args().nth(1),
        ..HubConfig::default()
    };

    // ── Connect ───────────────────────────────────────────────────────────────
    let mut scanner = Scanner::new(config);
    info!("Looking for a hub …");
    let discovered = scanner.find_first().await?;
    info!(
        "Found {} {} ({})",
        discovered.variant,
        discovered.id,
        discovered.name.as_deref().unwrap_or("unnamed")
    );
    let hub = scanner.connect(discovered).await?;
    println!("{}", serde_json::to_string(&hub.properties())?);

    // ── Event fan-in ──────────────────────────────────────────────────────────
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<HubEvent>();
    for name in HUB_EVENTS.iter().chain(READINGS) {
        let mut rx = hub.on(name).await?;
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }
    drop(event_tx);

    info!("Commands (type + Enter):");
    info!("  q                  – disconnect and quit");
    info!("  i                  – print hub properties");
    info!("  d                  – list attached devices");
    info!("  power <port> <n>   – motor power −100..100");
    info!("  stop <port>        – stop a motor");
    info!("  led <0-10>         – hub LED color");
    info!("  name <name>        – rename the hub");
    info!("  off                – switch the hub off\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so no StdinLock is held across
    // await points.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let hub_cmd = hub.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            if line == "q" {
                info!("Quit requested.");
                hub_cmd.disconnect().await.ok();
                std::process::exit(0);
            }
            if let Err(e) = run_command(&hub_cmd, &line).await {
                error!("{line}: {e}");
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = event_rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("could not serialize {event:?}: {e}"),
        }
        if event == HubEvent::Disconnect {
            info!("Disconnected from hub.");
            break;
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}

async fn run_command(hub: &Hub<BleTransport>, line: &str) -> Result<()> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    match (command, args.as_slice()) {
        ("i", []) => println!("{}", serde_json::to_string(&hub.properties())?),
        ("d", []) => {
            for device in hub.get_devices() {
                println!("{}", serde_json::to_string(&device.info()?)?);
            }
        }
        ("power", [port, power]) => {
            let motor = hub
                .get_device_at_port(port)
                .ok_or_else(|| anyhow!("nothing attached to {port}"))?;
            motor.set_power(power.parse()?).await?;
        }
        ("stop", [port]) => {
            let motor = hub
                .get_device_at_port(port)
                .ok_or_else(|| anyhow!("nothing attached to {port}"))?;
            motor.stop().await?;
        }
        ("led", [code]) => {
            let color =
                Color::from_code(code.parse()?).ok_or_else(|| anyhow!("unknown color {code}"))?;
            let led = hub
                .get_device_at_port("HUB_LED")
                .ok_or_else(|| anyhow!("this hub has no LED"))?;
            led.set_led_color(color).await?;
        }
        ("name", [name]) => hub.set_name(name).await?,
        ("off", []) => hub.shutdown().await?,
        _ => return Err(anyhow!("unknown command")),
    }
    Ok(())
}
