//! USB worker thread
//!
//! Dedicated thread owning the host controller. Commands from the Tokio
//! runtime are processed in arrival order; completions go back to each
//! session's own queue. Cancelled tickets are honored before execution
//! when possible, and a cancelled transfer that completes anyway is
//! reported as cancelled rather than a late success.

use common::{
    HostCommand, HostEvent, HostWorker, TransferCompletion, TransferOutcome, TransferStatus,
    UsbHostController,
};
use tracing::{debug, error, info, trace};

pub struct UsbWorkerThread {
    controller: Box<dyn UsbHostController>,
    worker: HostWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: HostWorker, controller: Box<dyn UsbHostController>) -> Self {
        Self { controller, worker }
    }

    /// Run the worker loop until Shutdown arrives or every bridge handle
    /// is gone
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            let cmd = match self.worker.recv_command() {
                Ok(cmd) => cmd,
                Err(_) => {
                    debug!("command channel closed");
                    break;
                }
            };

            match cmd {
                HostCommand::Shutdown => {
                    info!("USB worker shutting down");
                    break;
                }

                HostCommand::Enumerate { response } => {
                    let result = self.controller.enumerate();
                    if let Err(ref e) = result {
                        error!("device enumeration failed: {}", e);
                    }
                    let _ = response.send(result);
                }

                HostCommand::Cancel { ticket } => {
                    // The cancel set is already marked; this command only
                    // wakes the worker
                    trace!("cancel marker seen for {:?}", ticket);
                }

                HostCommand::Submit {
                    ticket,
                    spec,
                    completion,
                } => {
                    let outcome = if self.worker.is_cancelled(ticket) {
                        debug!("transfer {:?} cancelled before execution", ticket);
                        TransferOutcome::failed(TransferStatus::Cancelled)
                    } else {
                        let mut outcome = self.controller.execute(&spec);
                        if self.worker.is_cancelled(ticket) {
                            debug!("transfer {:?} cancelled during execution", ticket);
                            outcome = TransferOutcome::failed(TransferStatus::Cancelled);
                        }
                        outcome
                    };
                    self.worker.clear_cancelled(ticket);

                    if outcome.status == TransferStatus::DeviceGone {
                        let _ = self.worker.send_event(HostEvent::DeviceGone {
                            busid: spec.busid.clone(),
                        });
                    }

                    // The session may already be gone; completions to a
                    // closed queue are dropped
                    let _ = completion.blocking_send(TransferCompletion { ticket, outcome });
                }
            }
        }

        info!("USB worker thread stopped");
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(
    worker: HostWorker,
    controller: Box<dyn UsbHostController>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            UsbWorkerThread::new(worker, controller).run();
        })
        .expect("Failed to spawn USB worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockHostController, mock_device_list, with_timeout, DEFAULT_TEST_TIMEOUT};
    use common::create_host_bridge;

    #[tokio::test]
    async fn test_enumerate_roundtrip() {
        let (bridge, worker) = create_host_bridge();
        let controller = MockHostController::new(mock_device_list(3));
        let handle = spawn_usb_worker(worker, Box::new(controller));

        let devices = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.enumerate())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(devices.len(), 3);

        bridge.shutdown().await.unwrap();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_submit_delivers_completion() {
        let (bridge, worker) = create_host_bridge();
        let mut controller = MockHostController::new(vec![]);
        controller.push_outcome(TransferOutcome::success(vec![1, 2, 3, 4]));
        let handle = spawn_usb_worker(worker, Box::new(controller));

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let spec = common::TransferSpec {
            busid: "1-1".to_string(),
            endpoint: 0x81,
            direction: protocol::Direction::In,
            kind: common::TransferKind::Interrupt,
            setup: [0; 8],
            data: vec![],
            length: 8,
            timeout: std::time::Duration::from_secs(1),
        };
        let ticket = bridge.submit(spec, tx).await.unwrap();

        let completion = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.ticket, ticket);
        assert_eq!(completion.outcome.data, vec![1, 2, 3, 4]);

        bridge.shutdown().await.unwrap();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_execution() {
        let (bridge, worker) = create_host_bridge();
        let controller = MockHostController::new(vec![]);

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let spec = common::TransferSpec {
            busid: "1-1".to_string(),
            endpoint: 0x81,
            direction: protocol::Direction::In,
            kind: common::TransferKind::Interrupt,
            setup: [0; 8],
            data: vec![],
            length: 8,
            timeout: std::time::Duration::from_secs(1),
        };

        // Cancel lands before the worker starts draining the queue
        let ticket = bridge.submit(spec, tx).await.unwrap();
        bridge.cancel(ticket).await.unwrap();
        let handle = spawn_usb_worker(worker, Box::new(controller));

        let completion = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.outcome.status, TransferStatus::Cancelled);

        bridge.shutdown().await.unwrap();
        handle.join().unwrap();
    }
}
