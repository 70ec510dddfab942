//! Named event fan-out.
//!
//! Devices and hubs publish readings under string names ("tilt",
//! "batteryLevel", …).  Listeners register per name and receive every
//! matching event on an unbounded channel.  Dropping the receiver
//! unregisters the listener the next time that name is emitted or counted.

use std::collections::HashMap;

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct Emitter<E> {
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `name`.
    pub fn on(&mut self, name: &str) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.entry(name.to_owned()).or_default().push(tx);
        rx
    }

    /// Live listeners for `name`.
    pub fn listener_count(&mut self, name: &str) -> usize {
        match self.listeners.get_mut(name) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Names that currently have at least one live listener.
    pub fn names(&mut self) -> Vec<String> {
        self.listeners.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        self.listeners.keys().cloned().collect()
    }

    /// Deliver `event` to every listener of `name`; returns how many got it.
    pub fn emit(&mut self, name: &str, event: E) -> usize {
        let Some(senders) = self.listeners.get_mut(name) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    /// Drop every listener, closing their channels.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_only_matching_name() {
        let mut emitter = Emitter::new();
        let mut tilt = emitter.on("tilt");
        let mut color = emitter.on("color");

        assert_eq!(emitter.emit("tilt", 7u8), 1);
        assert_eq!(tilt.try_recv().ok(), Some(7));
        assert!(color.try_recv().is_err());
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let mut emitter = Emitter::<u8>::new();
        let rx = emitter.on("rssi");
        assert_eq!(emitter.listener_count("rssi"), 1);
        drop(rx);
        assert_eq!(emitter.listener_count("rssi"), 0);
        assert!(emitter.names().is_empty());
    }

    #[test]
    fn test_clear_closes_channels() {
        let mut emitter = Emitter::<u8>::new();
        let mut rx = emitter.on("detach");
        emitter.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
