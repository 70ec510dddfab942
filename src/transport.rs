//! The seam between the protocol core and a BLE binding.
//!
//! A [`Hub`](crate::hub::Hub) only ever talks to its peripheral through
//! [`HubTransport`]: GATT connect/disconnect, service discovery,
//! characteristic subscribe/read/write and a stream of notifications.
//!
//! | Implementation | Where | Use |
//! |---|---|---|
//! | [`MockTransport`] | always built | tests and host-side simulation |
//! | [`BleTransport`](crate::ble::BleTransport) | feature `ble` | real hardware via btleplug |

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::Stream;
use log::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One value notification from a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Notifications in arrival order.  The stream ends when the link drops.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// GATT operations the hub driver needs from a peripheral connection.
#[async_trait]
pub trait HubTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Make the characteristics of `service` available.  Fails if the
    /// peripheral does not expose the service.
    async fn discover_service(&self, service: Uuid) -> Result<()>;

    /// Enable notifications on `characteristic`.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Notifications from every subscribed characteristic.
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Platform identifier (a UUID on macOS/Windows, a MAC on Linux).
    fn id(&self) -> String;

    /// Advertised name, once known.
    fn name(&self) -> Option<String>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MockTransport ────────────────────────────────────────────────────────────

type Responder = Box<dyn Fn(Uuid, &[u8]) -> Vec<Notification> + Send + Sync>;

#[derive(Default)]
struct MockState {
    connected: bool,
    services: Vec<Uuid>,
    subscriptions: Vec<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    reads: HashMap<Uuid, Vec<u8>>,
    sender: Option<mpsc::UnboundedSender<Notification>>,
}

/// An in-memory peripheral.
///
/// Records every write, serves reads from a preset table and lets the test
/// push notifications with [`inject`](Self::inject).  An optional responder
/// turns writes into notifications, which is how a simulated hub answers
/// property requests.  Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    id: String,
    name: Option<String>,
    state: Arc<Mutex<MockState>>,
    responder: Arc<Mutex<Option<Responder>>>,
}

impl MockTransport {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: id.to_owned(),
            name: name.map(str::to_owned),
            state: Arc::new(Mutex::new(MockState::default())),
            responder: Arc::new(Mutex::new(None)),
        }
    }

    /// Answer future writes with the notifications `responder` returns.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(Uuid, &[u8]) -> Vec<Notification> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Value returned by later reads of `characteristic`.
    pub fn set_read(&self, characteristic: Uuid, value: &[u8]) {
        lock(&self.state).reads.insert(characteristic, value.to_vec());
    }

    /// Deliver a notification.  Returns `false` when nobody is listening.
    pub fn inject(&self, characteristic: Uuid, value: &[u8]) -> bool {
        let state = lock(&self.state);
        match &state.sender {
            Some(tx) => tx
                .unbounded_send(Notification {
                    characteristic,
                    value: value.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral dropping the link: the notification stream
    /// ends.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.sender = None;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Every write so far, oldest first.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    /// Payloads written to `characteristic`, oldest first.
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn discovered_services(&self) -> Vec<Uuid> {
        lock(&self.state).services.clone()
    }
}

#[async_trait]
impl HubTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        lock(&self.state).connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.drop_link();
        Ok(())
    }

    async fn discover_service(&self, service: Uuid) -> Result<()> {
        lock(&self.state).services.push(service);
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        lock(&self.state).subscriptions.push(characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        lock(&self.state)
            .reads
            .get(&characteristic)
            .cloned()
            .ok_or(Error::CharacteristicNotFound(characteristic))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let replies = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(Error::NotConnected);
            }
            state.writes.push((characteristic, data.to_vec()));
            match lock(&self.responder).as_ref() {
                Some(respond) => respond(characteristic, data),
                None => Vec::new(),
            }
        };
        for reply in replies {
            debug!("mock reply on {}: {:02x?}", reply.characteristic, reply.value);
            self.inject(reply.characteristic, &reply.value);
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.state).sender = Some(tx);
        Ok(Box::pin(rx))
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const CHAR: Uuid = Uuid::from_u128(0x1624);

    #[tokio::test]
    async fn test_mock_records_writes_and_answers() {
        let mock = MockTransport::new("mock-1", Some("Hub"));
        mock.respond_with(|characteristic, data| {
            vec![Notification {
                characteristic,
                value: data.iter().rev().copied().collect(),
            }]
        });
        mock.connect().await.unwrap();
        let mut stream = mock.notifications().await.unwrap();

        mock.write(CHAR, &[1, 2, 3]).await.unwrap();
        assert_eq!(mock.writes_to(CHAR), vec![vec![1, 2, 3]]);

        let reply = stream.next().await.unwrap();
        assert_eq!(reply.value, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let mock = MockTransport::new("mock-2", None);
        let err = mock.write(CHAR, &[0]).await.unwrap_err();
        assert!(err.is_transport_error());
    }

    #[tokio::test]
    async fn test_drop_link_ends_stream() {
        let mock = MockTransport::new("mock-3", None);
        mock.connect().await.unwrap();
        let mut stream = mock.notifications().await.unwrap();
        assert!(mock.inject(CHAR, &[0x01]));
        mock.drop_link();
        assert_eq!(stream.next().await.map(|n| n.value), Some(vec![0x01]));
        assert!(stream.next().await.is_none());
        assert!(!mock.inject(CHAR, &[0x02]));
    }

    #[tokio::test]
    async fn test_unknown_read_is_an_error() {
        let mock = MockTransport::new("mock-4", None);
        mock.set_read(CHAR, &[0x64]);
        assert_eq!(mock.read(CHAR).await.unwrap(), vec![0x64]);
        assert!(matches!(
            mock.read(Uuid::nil()).await,
            Err(Error::CharacteristicNotFound(_))
        ));
    }
}
