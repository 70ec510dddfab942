//! BLE discovery of Powered Up hubs and bookkeeping of connected ones.
//!
//! A [`Scanner`] owns its adapter and its lifecycle:
//!
//! | State | Meaning |
//! |---|---|
//! | `Unstarted` | no adapter acquired yet |
//! | `Scanning` | adapter is scanning for LPF2 / WeDo 2.0 services |
//! | `Stopped` | scan stopped; may be restarted |
//!
//! Every peripheral seen is classified from its advertisement before a hub
//! handle is built for it, so unknown peripherals never become hubs.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::ble::BleTransport;
use crate::error::{Error, Result};
use crate::hub::{Hub, HubConfig};
use crate::protocol::{LPF2_HUB_SERVICE, WEDO2_SMART_HUB_SERVICE};
use crate::types::{ConnectionState, HubVariant};
use crate::util::wait_for;

/// Scanner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Unstarted,
    Scanning,
    Stopped,
}

/// A classified hub seen during a scan, not yet connected.
#[derive(Clone, Debug)]
pub struct DiscoveredHub {
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    pub name: Option<String>,
    pub variant: HubVariant,
    pub rssi: Option<i16>,
    pub(crate) peripheral: Peripheral,
    pub(crate) adapter: Adapter,
}

pub struct Scanner {
    config: HubConfig,
    state: ScannerState,
    adapter: Option<Adapter>,
    connected: Vec<Hub<BleTransport>>,
}

impl Scanner {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            state: ScannerState::Unstarted,
            adapter: None,
            connected: Vec::new(),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("No Bluetooth adapter found".into()))?;

        // CBCentralManager starts in an "unknown" state; scanning before it
        // reports PoweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start scanning.  Does nothing when already scanning.
    pub async fn start(&mut self) -> Result<()> {
        if self.state == ScannerState::Scanning {
            return Ok(());
        }
        let adapter = self.adapter().await?;
        let filter = ScanFilter {
            services: vec![LPF2_HUB_SERVICE, WEDO2_SMART_HUB_SERVICE],
        };
        adapter.start_scan(filter).await?;
        self.state = ScannerState::Scanning;
        info!("Scanning for hubs …");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if self.state != ScannerState::Scanning {
            return Ok(());
        }
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.stop_scan().await {
                warn!("stop_scan failed: {e}");
            }
        }
        self.state = ScannerState::Stopped;
        Ok(())
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Scan for the configured duration and return every hub found.
    pub async fn scan_all(&mut self) -> Result<Vec<DiscoveredHub>> {
        self.start().await?;
        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        let found = self.discovered().await?;
        self.stop().await?;
        info!("scan_all: {} hub(s) found", found.len());
        Ok(found)
    }

    /// Scan until the first hub shows up, or fail after the configured
    /// duration.
    pub async fn find_first(&mut self) -> Result<DiscoveredHub> {
        self.start().await?;
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let this = &*self;
        let found = wait_for(timeout, Duration::from_millis(250), || async move {
            match this.discovered().await {
                Ok(hubs) => hubs.into_iter().next(),
                Err(e) => {
                    warn!("listing peripherals failed: {e}");
                    None
                }
            }
        })
        .await;
        self.stop().await?;
        found
    }

    /// Classify every peripheral the adapter has seen so far.
    async fn discovered(&self) -> Result<Vec<DiscoveredHub>> {
        let Some(adapter) = &self.adapter else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for peripheral in adapter.peripherals().await? {
            if let Some(hub) = self.classify(adapter, peripheral).await {
                found.push(hub);
            }
        }
        Ok(found)
    }

    async fn classify(&self, adapter: &Adapter, peripheral: Peripheral) -> Option<DiscoveredHub> {
        let props = peripheral.properties().await.ok().flatten()?;
        let mut advertisement = Advertisement::new(props.services.clone(), Vec::new());
        if let Some((company, data)) = props.manufacturer_data.iter().next() {
            advertisement = advertisement.with_manufacturer(*company, data);
        }
        let variant = match advertisement.hub_variant() {
            Ok(variant) => variant,
            Err(_) => {
                debug!("skipping unrecognized peripheral {}", peripheral.id());
                return None;
            }
        };

        let name = match props.local_name {
            Some(name) => Some(name),
            None => self.wait_for_name(&peripheral).await,
        };
        if let Some(prefix) = &self.config.name_filter {
            if !name.as_deref().is_some_and(|n| n.starts_with(prefix.as_str())) {
                return None;
            }
        }

        let id = peripheral.id().to_string();
        debug!("found {variant} {id} ({})", name.as_deref().unwrap_or("unnamed"));
        Some(DiscoveredHub {
            id,
            name,
            variant,
            rssi: props.rssi,
            peripheral,
            adapter: adapter.clone(),
        })
    }

    /// Some hubs advertise their name in a second packet shortly after the
    /// first one.
    async fn wait_for_name(&self, peripheral: &Peripheral) -> Option<String> {
        wait_for(
            Duration::from_millis(self.config.name_timeout_ms),
            Duration::from_millis(self.config.name_retry_ms),
            || async move {
                peripheral
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|p| p.local_name)
            },
        )
        .await
        .ok()
    }

    // ── Connected hubs ───────────────────────────────────────────────────────

    /// Connect to a discovered hub and keep track of it.
    pub async fn connect(&mut self, discovered: DiscoveredHub) -> Result<Hub<BleTransport>> {
        let transport =
            BleTransport::new(discovered.peripheral, discovered.adapter, discovered.name);
        let hub = Hub::new(transport, discovered.variant, self.config.clone());
        hub.connect().await?;
        self.connected.retain(|h| h.id() != hub.id());
        self.connected.push(hub.clone());
        Ok(hub)
    }

    /// Hubs connected through this scanner that are still connected.
    pub fn connected_hubs(&mut self) -> Vec<Hub<BleTransport>> {
        self.connected
            .retain(|h| h.connection_state() != ConnectionState::Disconnected);
        self.connected.clone()
    }

    pub fn get_hub_by_id(&mut self, id: &str) -> Option<Hub<BleTransport>> {
        self.connected_hubs().into_iter().find(|h| h.id() == id)
    }

    pub fn get_hub_by_name(&mut self, name: &str) -> Option<Hub<BleTransport>> {
        self.connected_hubs()
            .into_iter()
            .find(|h| h.name().as_deref() == Some(name))
    }

    pub fn get_hubs_by_variant(&mut self, variant: HubVariant) -> Vec<Hub<BleTransport>> {
        self.connected_hubs()
            .into_iter()
            .filter(|h| h.variant() == variant)
            .collect()
    }
}
