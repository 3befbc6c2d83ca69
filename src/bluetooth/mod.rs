//! Bluetooth headset supervision.

pub mod controller;
pub mod monitor;

pub use controller::{
    BluetoothController, BlueutilController, MockBluetoothController, PairedDevice, parse_paired,
};
pub use monitor::{LinkEvent, LinkMonitor, LinkMonitorConfig};
