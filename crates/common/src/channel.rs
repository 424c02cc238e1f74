//! Async channel bridge between the Tokio runtime and the USB worker thread
//!
//! Sessions hand transfers to the blocking USB thread through
//! [`HostBridge`] and receive completions on a per-session queue. A shared
//! cancel set makes best-effort cancellation visible to the worker without
//! waiting for the command queue to drain.

use crate::usb_types::{TransferOutcome, TransferSpec, TransferTicket};
use async_channel::{Receiver, Sender, bounded};
use protocol::ExportedDevice;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Completion report delivered to the owning session's queue
#[derive(Debug)]
pub struct TransferCompletion {
    pub ticket: TransferTicket,
    pub outcome: TransferOutcome,
}

/// Commands from the Tokio runtime to the USB worker thread
#[derive(Debug)]
pub enum HostCommand {
    /// Snapshot all exportable devices
    Enumerate {
        /// Channel to send the snapshot back
        response: tokio::sync::oneshot::Sender<crate::Result<Vec<ExportedDevice>>>,
    },

    /// Execute a transfer; the completion goes to the session's queue
    Submit {
        ticket: TransferTicket,
        spec: TransferSpec,
        /// The submitting session's completion queue
        completion: tokio::sync::mpsc::Sender<TransferCompletion>,
    },

    /// Wake the worker so a freshly cancelled ticket is noticed promptly
    Cancel { ticket: TransferTicket },

    /// Shut the worker down gracefully
    Shutdown,
}

/// Events from the worker that are not tied to a single transfer
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A device disappeared while being serviced
    DeviceGone { busid: String },
}

/// Tickets cancelled by sessions, visible to the worker mid-queue
#[derive(Debug, Clone, Default)]
struct CancelSet(Arc<Mutex<HashSet<TransferTicket>>>);

impl CancelSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<TransferTicket>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark(&self, ticket: TransferTicket) {
        self.lock().insert(ticket);
    }

    fn contains(&self, ticket: TransferTicket) -> bool {
        self.lock().contains(&ticket)
    }

    fn clear(&self, ticket: TransferTicket) {
        self.lock().remove(&ticket);
    }
}

/// Handle for the Tokio runtime (async side)
#[derive(Clone)]
pub struct HostBridge {
    cmd_tx: Sender<HostCommand>,
    event_rx: Receiver<HostEvent>,
    cancelled: CancelSet,
    next_ticket: Arc<AtomicU64>,
}

impl HostBridge {
    /// Snapshot exportable devices from the live host controller
    pub async fn enumerate(&self) -> crate::Result<Vec<ExportedDevice>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HostCommand::Enumerate { response: tx }).await?;
        rx.await
            .map_err(|e| crate::Error::Channel(e.to_string()))?
    }

    /// Hand a transfer to the worker. Returns as soon as the command is
    /// queued; the completion arrives later on `completion`.
    pub async fn submit(
        &self,
        spec: TransferSpec,
        completion: tokio::sync::mpsc::Sender<TransferCompletion>,
    ) -> crate::Result<TransferTicket> {
        let ticket = TransferTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        self.send(HostCommand::Submit {
            ticket,
            spec,
            completion,
        })
        .await?;
        Ok(ticket)
    }

    /// Best-effort cancellation. The transfer may still complete; the
    /// worker then reports it as cancelled, never as a late success.
    pub async fn cancel(&self, ticket: TransferTicket) -> crate::Result<()> {
        self.cancelled.mark(ticket);
        self.send(HostCommand::Cancel { ticket }).await
    }

    /// Receive a host event (device removal)
    pub async fn recv_event(&self) -> crate::Result<HostEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the worker to exit after draining queued commands
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send(HostCommand::Shutdown).await
    }

    async fn send(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB worker thread (blocking side)
pub struct HostWorker {
    cmd_rx: Receiver<HostCommand>,
    /// Event sender (public for the worker thread to access)
    pub event_tx: Sender<HostEvent>,
    cancelled: CancelSet,
}

impl HostWorker {
    /// Receive the next command (blocking)
    pub fn recv_command(&self) -> crate::Result<HostCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether a session cancelled this ticket
    pub fn is_cancelled(&self, ticket: TransferTicket) -> bool {
        self.cancelled.contains(ticket)
    }

    /// Drop bookkeeping for a resolved ticket
    pub fn clear_cancelled(&self, ticket: TransferTicket) {
        self.cancelled.clear(ticket);
    }

    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: HostEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the USB worker thread
///
/// Returns (HostBridge for Tokio, HostWorker for the USB thread)
pub fn create_host_bridge() -> (HostBridge, HostWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);
    let cancelled = CancelSet::default();

    (
        HostBridge {
            cmd_tx,
            event_rx,
            cancelled: cancelled.clone(),
            next_ticket: Arc::new(AtomicU64::new(1)),
        },
        HostWorker {
            cmd_rx,
            event_tx,
            cancelled,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_types::TransferKind;
    use protocol::Direction;
    use std::time::Duration;

    fn dummy_spec() -> TransferSpec {
        TransferSpec {
            busid: "1-1".to_string(),
            endpoint: 0x81,
            direction: Direction::In,
            kind: TransferKind::Interrupt,
            setup: [0; 8],
            data: vec![],
            length: 8,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_submit_reaches_worker() {
        let (bridge, worker) = create_host_bridge();

        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, HostCommand::Submit { .. })
        });

        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ticket = bridge.submit(dummy_spec(), tx).await.unwrap();
        assert_eq!(ticket, TransferTicket(1));

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_tickets_are_unique() {
        let (bridge, worker) = create_host_bridge();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);

        let first = bridge.submit(dummy_spec(), tx.clone()).await.unwrap();
        let second = bridge.submit(dummy_spec(), tx).await.unwrap();
        assert_ne!(first, second);

        drop(worker);
    }

    #[tokio::test]
    async fn test_cancel_marks_ticket_for_worker() {
        let (bridge, worker) = create_host_bridge();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);

        let ticket = bridge.submit(dummy_spec(), tx).await.unwrap();
        assert!(!worker.is_cancelled(ticket));

        bridge.cancel(ticket).await.unwrap();
        assert!(worker.is_cancelled(ticket));

        worker.clear_cancelled(ticket);
        assert!(!worker.is_cancelled(ticket));
    }
}
