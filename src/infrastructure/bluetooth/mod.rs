//! Bluetooth Module
//!
//! Heart rate sensor discovery and data acquisition over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (async driver - commands, radio events, scan timer)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!              ┌───────────────────┐
//!              │ ConnectionSession │
//!              │  (state machine)  │
//!              └─────────┬─────────┘
//!         ┌──────────────┼──────────────┐
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌───────────┐   ┌────────────┐  ┌──────────┐
//! │  Scanner  │   │   Radio    │  │ Protocol │
//! │           │   │            │  │          │
//! │ - scan    │   │ - host BLE │  │ - UUIDs  │
//! │ - registry│   │   adapter  │  │ - decode │
//! └───────────┘   └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Heart Rate Service assigned numbers and measurement decoding
//! - [`radio`] - Interface to the host radio and its callbacks
//! - [`scanner`] - Scan lifecycle and device registry
//! - [`connection`] - Session state machine
//! - [`service`] - Async driver and observer fan-out
//! - [`simulated`] - In-process radio for demos and tests

pub mod connection;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod service;
pub mod simulated;

// Re-export main service for convenience
pub use service::{BluetoothService, MonitorHandle};
