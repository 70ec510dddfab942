//! [`HubTransport`] over a btleplug peripheral.
//!
//! Characteristics are looked up once per connection and cached by UUID.
//! The notification stream ends when the adapter reports the peripheral
//! disconnected, which is how a [`Hub`](crate::hub::Hub) learns that the
//! link dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{lock, HubTransport, Notification, NotificationStream};

/// BlueZ can block forever in `Connect` when the device is out of range.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

pub struct BleTransport {
    peripheral: Peripheral,
    adapter: Adapter,
    name: Option<String>,
    services_discovered: Mutex<bool>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
}

impl BleTransport {
    pub fn new(peripheral: Peripheral, adapter: Adapter, name: Option<String>) -> Self {
        Self {
            peripheral,
            adapter,
            name,
            services_discovered: Mutex::new(false),
            characteristics: Mutex::new(HashMap::new()),
        }
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        lock(&self.characteristics)
            .get(&uuid)
            .cloned()
            .ok_or(Error::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl HubTransport for BleTransport {
    async fn connect(&self) -> Result<()> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.peripheral.connect())
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "BLE connect() timed out after {} s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })??;
        *lock(&self.services_discovered) = false;
        lock(&self.characteristics).clear();
        info!("BLE link up: {}", self.id());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_service(&self, service: Uuid) -> Result<()> {
        let discovered = *lock(&self.services_discovered);
        if !discovered {
            // BlueZ signals the connection before its GATT cache is filled.
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            tokio::time::timeout(DISCOVER_TIMEOUT, self.peripheral.discover_services())
                .await
                .map_err(|_| {
                    Error::Transport(format!(
                        "discover_services() timed out after {} s",
                        DISCOVER_TIMEOUT.as_secs()
                    ))
                })??;
            *lock(&self.services_discovered) = true;
        }

        let found = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| Error::Transport(format!("service {service} not found")))?;

        let mut cache = lock(&self.characteristics);
        for characteristic in found.characteristics {
            debug!("{service}: characteristic {}", characteristic.uuid);
            cache.insert(characteristic.uuid, characteristic);
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&c).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let kind = if c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral.write(&c, data, kind).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let raw = self.peripheral.notifications().await?;

        let mut events = self.adapter.events().await?;
        let peripheral_id = self.peripheral.id();
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Disconnect watcher: device {id:?} disconnected.");
                        return;
                    }
                }
            }
            warn!("Disconnect watcher: adapter event stream ended");
        };

        let stream = raw
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .take_until(Box::pin(disconnected));
        Ok(Box::pin(stream))
    }

    fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }
}
