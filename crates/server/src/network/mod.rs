//! Network layer: the TCP listener and per-connection sessions

pub mod server;
pub mod session;

pub use server::UsbIpServer;
pub use session::Session;
