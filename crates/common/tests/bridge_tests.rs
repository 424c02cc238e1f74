//! Host bridge integration tests
//!
//! Exercises the public bridge surface the way the server uses it: a
//! blocking worker thread on one side, async sessions on the other.
//!
//! Run with: `cargo test -p common --test bridge_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockHostController, mock_device, with_timeout,
};
use common::{
    HostCommand, HostEvent, TransferCompletion, TransferKind, TransferOutcome, TransferSpec,
    UsbHostController, create_host_bridge,
};
use protocol::Direction;
use std::time::Duration;

fn bulk_out(data: Vec<u8>) -> TransferSpec {
    TransferSpec {
        busid: "1-1".to_string(),
        endpoint: 0x02,
        direction: Direction::Out,
        kind: TransferKind::Bulk,
        setup: [0; 8],
        length: data.len(),
        data,
        timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn worker_sees_commands_in_submission_order() {
    let (bridge, worker) = create_host_bridge();

    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let first = bridge.submit(bulk_out(vec![1]), tx.clone()).await.unwrap();
    let second = bridge.submit(bulk_out(vec![2]), tx).await.unwrap();

    let handle = std::thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Ok(HostCommand::Submit { ticket, .. }) = worker.recv_command() {
                seen.push(ticket);
            }
        }
        seen
    });

    assert_eq!(handle.join().unwrap(), vec![first, second]);
}

#[tokio::test]
async fn completion_arrives_on_the_submitting_queue() {
    let (bridge, worker) = create_host_bridge();

    let handle = std::thread::spawn(move || {
        let mut controller = MockHostController::new(vec![]);
        while let Ok(cmd) = worker.recv_command() {
            match cmd {
                HostCommand::Submit {
                    ticket,
                    spec,
                    completion,
                } => {
                    let outcome = controller.execute(&spec);
                    let _ = completion.blocking_send(TransferCompletion { ticket, outcome });
                }
                HostCommand::Shutdown => break,
                _ => {}
            }
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let ticket = bridge.submit(bulk_out(vec![7, 8, 9]), tx).await.unwrap();

    let completion = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.ticket, ticket);
    // The default mock echoes the OUT length as bytes written
    assert_eq!(completion.outcome.actual_length(), 3);

    bridge.shutdown().await.unwrap();
    handle.join().unwrap();
}

#[tokio::test]
async fn events_flow_from_worker_to_bridge() {
    let (bridge, worker) = create_host_bridge();

    worker
        .send_event(HostEvent::DeviceGone {
            busid: "1-1".to_string(),
        })
        .unwrap();

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    let HostEvent::DeviceGone { busid } = event;
    assert_eq!(busid, "1-1");
}

#[test]
fn mock_devices_have_stable_identity() {
    let device = mock_device("1-1", 0x1234, 0x5678);
    assert_eq!(device.busid, "1-1");
    assert_eq!(device.devid(), (1 << 16) | 2);
    assert_eq!(device.vendor_id, 0x1234);
}
