//! # poweredup-rs
//!
//! Async Rust driver for LEGO Powered Up Bluetooth Low Energy hubs: Powered
//! Up Hub, Boost Move Hub, Remote Control, Duplo Train Base, Technic Small
//! and Medium hubs, Mario and the legacy WeDo 2.0 Smart Hub.
//!
//! ## Supported hubs
//!
//! | Hub | Protocol | Ports |
//! |---|---|---|
//! | WeDo 2.0 Smart Hub | WeDo 2.0 | A, B |
//! | Boost Move Hub | LPF2 | A, B, C, D + internal tilt |
//! | Powered Up Hub | LPF2 | A, B |
//! | Powered Up Remote | LPF2 | LEFT, RIGHT |
//! | Duplo Train Base | LPF2 | MOTOR, COLOR, SPEEDOMETER |
//! | Technic Medium Hub | LPF2 | A, B, C, D + accelerometer, gyro, tilt |
//! | Technic Small Hub | LPF2 | A, B + accelerometer, gyro, tilt |
//! | Mario | LPF2 | reported at runtime |
//!
//! The hub variant is decided from the advertisement before connecting.
//!
//! ## Quick start
//!
//! ```no_run
//! # #[cfg(feature = "ble")]
//! # async fn run() -> anyhow::Result<()> {
//! use poweredup_rs::prelude::*;
//!
//! let mut scanner = Scanner::new(HubConfig::default());
//! let found = scanner.find_first().await?;
//! let hub = scanner.connect(found).await?;
//!
//! let motor = hub.wait_for_device_at_port("A").await?;
//! motor.set_power(50).await?;
//!
//! let mut rotations = motor.on("rotate").await?;
//! while let Some(DeviceEvent::Rotate { degrees }) = rotations.recv().await {
//!     println!("{degrees}°");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Without the `ble` feature the crate still builds the full protocol core
//! and [`transport::MockTransport`], so a [`hub::Hub`] can be driven by a
//! simulated peripheral.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`advertisement`] | Hub variant classification from advertisement data |
//! | [`hub`] | Connection state machine, [`hub::Hub`] and [`hub::DeviceRef`] |
//! | [`registry`] | Port name maps and the live port → device registry |
//! | [`device`] | Device kinds, mode tables and per-device state |
//! | [`decode`] | Sensor payload decoders |
//! | [`commands`] | Outbound command encoders |
//! | [`protocol`] | GATT UUIDs, message constants and frame builders |
//! | [`parse`] | Byte readers, message framer, version helpers |
//! | [`transport`] | The [`transport::HubTransport`] seam and an in-memory mock |
//! | `ble` | btleplug transport (feature `ble`) |
//! | `scanner` | BLE discovery and connected-hub lookup (feature `ble`) |
//! | [`events`] | Named, multi-listener event channels |
//! | [`types`] | Hub variants, colors, events and other shared types |
//! | [`util`] | Speed, angle and ramp helpers, bounded waits |
//! | [`error`] | [`error::Error`] and the crate `Result` alias |

pub mod advertisement;
#[cfg(feature = "ble")]
pub mod ble;
pub mod commands;
pub mod decode;
pub mod device;
pub mod error;
pub mod events;
pub mod hub;
pub mod parse;
pub mod protocol;
pub mod registry;
#[cfg(feature = "ble")]
pub mod scanner;
pub mod transport;
pub mod types;
pub mod util;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Hubs and devices ──────────────────────────────────────────────────────
    pub use crate::hub::{DeviceRef, Hub, HubConfig, HubProperties};
    pub use crate::device::DeviceType;
    pub use crate::commands::{Matrix, MotorTarget, Pixel};

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::{HubTransport, MockTransport, Notification};
    #[cfg(feature = "ble")]
    pub use crate::ble::BleTransport;
    #[cfg(feature = "ble")]
    pub use crate::scanner::{DiscoveredHub, Scanner, ScannerState};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        BrakingStyle, ButtonState, Color, ConnectionState, DeviceEvent, DeviceInfo,
        DuploTrainBaseSound, HubEvent, HubVariant, PfOutput,
    };

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{Error, Result};
}
