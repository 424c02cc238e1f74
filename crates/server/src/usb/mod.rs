//! USB subsystem
//!
//! Device registry, transfer adapter, the rusb host controller, and the
//! dedicated worker thread that owns it.

pub mod adapter;
pub mod host;
pub mod registry;
pub mod worker;

pub use adapter::TransferAdapter;
pub use registry::{DeviceClaim, DeviceRegistry, RegistryError};
pub use worker::spawn_usb_worker;
