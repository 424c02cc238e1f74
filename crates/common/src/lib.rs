//! Common utilities for rust-usbip
//!
//! This crate provides shared functionality for the server: error
//! handling, logging setup, host-side transfer abstractions, the async
//! channel bridge to the USB worker thread, and test utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    HostBridge, HostCommand, HostEvent, HostWorker, TransferCompletion, create_host_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    TransferKind, TransferOutcome, TransferSpec, TransferStatus, TransferTicket,
    UsbHostController,
};
