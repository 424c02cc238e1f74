//! Per-connection session state machine
//!
//! Lifecycle: handshake (device listing, import) then the bound command
//! loop, then teardown. Every transition is driven by a received frame;
//! the only server-initiated traffic is transfer completions.
//!
//! Frame reading is confined to a reader task feeding a small bounded
//! queue, while this task owns the socket writer. That keeps a single
//! writer on the connection, serializes completions with frame
//! processing, and stalls frame intake for this session alone when the
//! peer stops draining replies.

use crate::usb::adapter::TransferAdapter;
use crate::usb::registry::{DeviceClaim, DeviceRegistry};
use anyhow::{Context as _, Result};
use common::{TransferCompletion, TransferStatus, TransferTicket};
use protocol::{
    CmdHeader, CmdSubmit, CmdUnlink, Command, OpReply, OpRequest, ProtocolError, Reply, RetSubmit,
    RetUnlink, status,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Un-processed inbound frames buffered per session. Small so a
/// back-pressured writer quickly stops the reader.
const FRAME_QUEUE_DEPTH: usize = 4;

/// Completion queue depth per session
const COMPLETION_QUEUE_DEPTH: usize = 64;

/// One in-flight SUBMIT awaiting its completion
struct InFlight {
    ticket: TransferTicket,
    /// SUBMIT header, echoed in RET_SUBMIT
    header: CmdHeader,
    /// Header of the UNLINK waiting on this transfer, if any
    unlinked_by: Option<CmdHeader>,
}

/// What the reader task feeds into the state machine
enum Inbound {
    Frame(Command),
    Error(ProtocolError),
}

enum Flow {
    Continue,
    Close,
}

/// One accepted connection
pub struct Session {
    peer: String,
    registry: Arc<DeviceRegistry>,
    adapter: TransferAdapter,
}

impl Session {
    pub fn new(peer: String, registry: Arc<DeviceRegistry>, adapter: TransferAdapter) -> Self {
        Session {
            peer,
            registry,
            adapter,
        }
    }

    /// Drive the session until the peer disconnects, a fatal protocol
    /// error occurs, or the bound device disappears.
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        // Handshake: device listing may repeat on one connection; a
        // successful import moves it into the command phase.
        let claim = loop {
            let request = match protocol::read_op_request(&mut reader).await {
                Ok(request) => request,
                Err(ProtocolError::Disconnected) => {
                    debug!("{} disconnected during handshake", self.peer);
                    return Ok(());
                }
                Err(ProtocolError::UnsupportedOp { code }) => {
                    warn!("unsupported op {:#06x} from {}", code, self.peer);
                    writer
                        .write_all(&protocol::encode_op_refusal(code))
                        .await?;
                    continue;
                }
                Err(e) => {
                    warn!("handshake failed with {}: {}", self.peer, e);
                    return Ok(());
                }
            };

            match request {
                OpRequest::Devlist => {
                    let devices = self.registry.list();
                    debug!(
                        "sending device list ({} entries) to {}",
                        devices.len(),
                        self.peer
                    );
                    writer
                        .write_all(&protocol::encode_op_reply(&OpReply::Devlist { devices }))
                        .await?;
                }
                OpRequest::Import { busid } => match self.registry.acquire(&busid) {
                    Ok(claim) => {
                        info!("{} imported device {}", self.peer, busid);
                        let reply = OpReply::import_ok(claim.device().clone());
                        writer
                            .write_all(&protocol::encode_op_reply(&reply))
                            .await?;
                        break claim;
                    }
                    Err(e) => {
                        warn!("import of {} refused for {}: {}", busid, self.peer, e);
                        writer
                            .write_all(&protocol::encode_op_reply(&OpReply::import_refused()))
                            .await?;
                        return Ok(());
                    }
                },
            }
        };

        self.command_loop(reader, writer, claim).await
    }

    async fn command_loop<S>(
        self,
        mut reader: ReadHalf<S>,
        writer: WriteHalf<S>,
        claim: DeviceClaim,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let reader_task = tokio::spawn(async move {
            loop {
                match protocol::read_command(&mut reader).await {
                    Ok(command) => {
                        if frame_tx.send(Inbound::Frame(command)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = frame_tx.send(Inbound::Error(e)).await;
                        break;
                    }
                }
            }
        });

        let (completion_tx, mut completion_rx) = mpsc::channel(COMPLETION_QUEUE_DEPTH);
        let mut state = BoundState {
            peer: self.peer.clone(),
            adapter: self.adapter.clone(),
            writer,
            completion_tx,
            devid: claim.device().devid(),
            busid: claim.busid().to_string(),
            in_flight: HashMap::new(),
            by_ticket: HashMap::new(),
        };

        let result = loop {
            let flow = tokio::select! {
                inbound = frame_rx.recv() => match inbound {
                    Some(Inbound::Frame(Command::Submit(cmd))) => state.on_submit(cmd).await,
                    Some(Inbound::Frame(Command::Unlink(cmd))) => state.on_unlink(cmd).await,
                    Some(Inbound::Error(ProtocolError::Disconnected)) => {
                        debug!("{} disconnected", self.peer);
                        Ok(Flow::Close)
                    }
                    Some(Inbound::Error(e)) => {
                        warn!("closing session with {}: {}", self.peer, e);
                        Ok(Flow::Close)
                    }
                    None => Ok(Flow::Close),
                },
                completion = completion_rx.recv() => match completion {
                    Some(completion) => state.on_completion(completion).await,
                    None => Ok(Flow::Close),
                },
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // Teardown: cancel anything still in flight, then give the
        // device back by dropping the claim.
        for entry in state.in_flight.values() {
            let _ = state.adapter.cancel(entry.ticket).await;
        }
        reader_task.abort();
        let _ = state.writer.shutdown().await;
        drop(claim);
        info!("session with {} closed", self.peer);

        result
    }
}

/// Mutable state of the bound command loop
struct BoundState<S> {
    peer: String,
    adapter: TransferAdapter,
    writer: WriteHalf<S>,
    completion_tx: mpsc::Sender<TransferCompletion>,
    /// devid of the imported device; commands must match it
    devid: u32,
    busid: String,
    /// In-flight transfers by sequence number
    in_flight: HashMap<u32, InFlight>,
    by_ticket: HashMap<TransferTicket, u32>,
}

impl<S> BoundState<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn on_submit(&mut self, cmd: CmdSubmit) -> Result<Flow> {
        let header = cmd.header;

        if self.in_flight.contains_key(&header.seqnum) {
            // Reusing a live sequence number is a protocol violation
            warn!("{} reused in-flight seqnum {}", self.peer, header.seqnum);
            return Ok(Flow::Close);
        }
        if header.devid != self.devid {
            warn!(
                "{} submitted for foreign devid {:#010x}",
                self.peer, header.devid
            );
            self.write_ret_submit(header, status::ENODEV, Vec::new(), 0)
                .await?;
            return Ok(Flow::Continue);
        }
        if cmd.is_isochronous() {
            debug!("isochronous submit rejected (seqnum {})", header.seqnum);
            self.write_ret_submit(header, status::EIO, Vec::new(), 0)
                .await?;
            return Ok(Flow::Continue);
        }

        trace!(
            "submit seqnum={} ep={} dir={:?}",
            header.seqnum, header.ep, header.direction
        );
        let ticket = self
            .adapter
            .submit(&self.busid, &cmd, self.completion_tx.clone())
            .await
            .context("transfer handoff failed")?;
        self.in_flight.insert(
            header.seqnum,
            InFlight {
                ticket,
                header,
                unlinked_by: None,
            },
        );
        self.by_ticket.insert(ticket, header.seqnum);
        Ok(Flow::Continue)
    }

    async fn on_unlink(&mut self, cmd: CmdUnlink) -> Result<Flow> {
        let ticket = match self.in_flight.get_mut(&cmd.unlink_seqnum) {
            Some(entry) if entry.unlinked_by.is_none() => {
                entry.unlinked_by = Some(cmd.header);
                Some(entry.ticket)
            }
            _ => None,
        };

        match ticket {
            Some(ticket) => {
                debug!("unlink of in-flight seqnum {}", cmd.unlink_seqnum);
                self.adapter
                    .cancel(ticket)
                    .await
                    .context("cancel handoff failed")?;
            }
            None => {
                // Already completed or already being unlinked: benign
                debug!("unlink of resolved seqnum {}", cmd.unlink_seqnum);
                self.write_ret_unlink(cmd.header, status::SUCCESS).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_completion(&mut self, completion: TransferCompletion) -> Result<Flow> {
        let Some(seqnum) = self.by_ticket.remove(&completion.ticket) else {
            // Completion for a transfer resolved some other way
            return Ok(Flow::Continue);
        };
        let Some(entry) = self.in_flight.remove(&seqnum) else {
            return Ok(Flow::Continue);
        };

        let outcome = completion.outcome;
        let final_status = outcome.status;

        if let Some(unlink_header) = entry.unlinked_by {
            // The unlink won; no RET_SUBMIT goes out for this seqnum
            self.write_ret_unlink(unlink_header, status::ECONNRESET)
                .await?;
        } else {
            let actual = outcome.actual_length();
            let data = if entry.header.direction.is_in() {
                outcome.data
            } else {
                Vec::new()
            };
            self.write_ret_submit(entry.header, final_status.wire_status(), data, actual)
                .await?;
        }

        if final_status == TransferStatus::DeviceGone {
            warn!("device {} gone, closing session with {}", self.busid, self.peer);
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn write_ret_submit(
        &mut self,
        header: CmdHeader,
        status: i32,
        data: Vec<u8>,
        actual: usize,
    ) -> Result<()> {
        let ret = RetSubmit {
            header,
            status,
            actual_length: actual as i32,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
        };
        self.writer
            .write_all(&protocol::encode_reply(&Reply::Submit(ret)))
            .await?;
        Ok(())
    }

    async fn write_ret_unlink(&mut self, header: CmdHeader, status: i32) -> Result<()> {
        let ret = RetUnlink { header, status };
        self.writer
            .write_all(&protocol::encode_reply(&Reply::Unlink(ret)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::spawn_usb_worker;
    use common::TransferOutcome;
    use common::create_host_bridge;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, GoneHostController, MockHostController, mock_device, with_timeout,
    };
    use protocol::{
        CmdHeader, CmdSubmit, CmdUnlink, Command, Direction, OpRequest, encode_command,
        encode_op_request, read_op_reply, read_reply,
    };
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    fn adapter_with(controller: impl common::UsbHostController + 'static) -> TransferAdapter {
        let (bridge, worker) = create_host_bridge();
        spawn_usb_worker(worker, Box::new(controller));
        TransferAdapter::new(bridge)
    }

    fn spawn_session(
        registry: &Arc<DeviceRegistry>,
        adapter: &TransferAdapter,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server_end) = duplex(64 * 1024);
        let session = Session::new(
            "test-peer".to_string(),
            Arc::clone(registry),
            adapter.clone(),
        );
        (client, tokio::spawn(session.run(server_end)))
    }

    async fn import(client: &mut DuplexStream, busid: &str) -> protocol::OpReply {
        client
            .write_all(&encode_op_request(&OpRequest::Import {
                busid: busid.to_string(),
            }))
            .await
            .unwrap();
        with_timeout(DEFAULT_TEST_TIMEOUT, read_op_reply(client))
            .await
            .unwrap()
            .unwrap()
    }

    fn submit_in(seqnum: u32, devid: u32, ep: u32, interval: i32, length: u32) -> Vec<u8> {
        encode_command(&Command::Submit(CmdSubmit {
            header: CmdHeader {
                seqnum,
                devid,
                direction: Direction::In,
                ep,
            },
            transfer_flags: 0,
            transfer_buffer_length: length,
            start_frame: 0,
            number_of_packets: 0,
            interval,
            setup: [0; 8],
            data: vec![],
        }))
    }

    fn unlink(seqnum: u32, devid: u32, unlink_seqnum: u32) -> Vec<u8> {
        encode_command(&Command::Unlink(CmdUnlink {
            header: CmdHeader {
                seqnum,
                devid,
                direction: Direction::Out,
                ep: 0,
            },
            unlink_seqnum,
        }))
    }

    #[tokio::test]
    async fn test_devlist_on_empty_registry() {
        let registry = Arc::new(DeviceRegistry::new());
        let adapter = adapter_with(MockHostController::new(vec![]));
        let (mut client, _handle) = spawn_session(&registry, &adapter);

        client
            .write_all(&encode_op_request(&OpRequest::Devlist))
            .await
            .unwrap();
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_op_reply(&mut client))
            .await
            .unwrap()
            .unwrap();

        let OpReply::Devlist { devices } = reply else {
            panic!("expected devlist reply, got {:?}", reply);
        };
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_devlist_repeats_on_one_connection() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let adapter = adapter_with(MockHostController::new(vec![]));
        let (mut client, _handle) = spawn_session(&registry, &adapter);

        for _ in 0..3 {
            client
                .write_all(&encode_op_request(&OpRequest::Devlist))
                .await
                .unwrap();
            let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_op_reply(&mut client))
                .await
                .unwrap()
                .unwrap();
            let OpReply::Devlist { devices } = reply else {
                panic!("expected devlist reply");
            };
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].busid, "1-1");
        }
    }

    #[tokio::test]
    async fn test_import_unknown_busid_refused() {
        let registry = Arc::new(DeviceRegistry::new());
        let adapter = adapter_with(MockHostController::new(vec![]));
        let (mut client, handle) = spawn_session(&registry, &adapter);

        let reply = import(&mut client, "9-9").await;
        let OpReply::Import { status, device } = reply else {
            panic!("expected import reply");
        };
        assert_ne!(status, protocol::ST_OK);
        assert!(device.is_none());

        // Refused import closes the session
        with_timeout(DEFAULT_TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_import_is_exclusive() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let adapter = adapter_with(MockHostController::new(vec![]));

        let (mut first, first_handle) = spawn_session(&registry, &adapter);
        let reply = import(&mut first, "1-1").await;
        let OpReply::Import { status, device } = reply else {
            panic!("expected import reply");
        };
        assert_eq!(status, protocol::ST_OK);
        assert_eq!(device.unwrap().busid, "1-1");

        // A second session importing the same busid is refused
        let (mut second, _second_handle) = spawn_session(&registry, &adapter);
        let reply = import(&mut second, "1-1").await;
        let OpReply::Import { status, .. } = reply else {
            panic!("expected import reply");
        };
        assert_ne!(status, protocol::ST_OK);

        // Closing the first session releases the device
        drop(first);
        with_timeout(DEFAULT_TEST_TIMEOUT, first_handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.acquire("1-1").is_ok());
    }

    #[tokio::test]
    async fn test_submit_completion_roundtrip() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let devid = registry.get("1-1").unwrap().devid();

        let mut controller = MockHostController::new(vec![]);
        controller.push_outcome(TransferOutcome::success(vec![1, 2, 3, 4]));
        let adapter = adapter_with(controller);

        let (mut client, _handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        // Interrupt IN on endpoint 0x81, sequence number 7
        client
            .write_all(&submit_in(7, devid, 1, 10, 64))
            .await
            .unwrap();
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_reply(&mut client))
            .await
            .unwrap()
            .unwrap();

        let Reply::Submit(ret) = reply else {
            panic!("expected RET_SUBMIT, got {:?}", reply);
        };
        assert_eq!(ret.header.seqnum, 7);
        assert_eq!(ret.status, status::SUCCESS);
        assert_eq!(ret.actual_length, 4);
        assert_eq!(ret.data, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_unlink_in_flight_yields_single_ret_unlink() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let devid = registry.get("1-1").unwrap().devid();

        let mut controller = MockHostController::new(vec![]);
        controller.push_delayed_outcome(
            TransferOutcome::success(vec![9; 8]),
            Duration::from_millis(200),
        );
        controller.push_outcome(TransferOutcome::success(vec![5, 5]));
        let adapter = adapter_with(controller);

        let (mut client, _handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        // SUBMIT seq 7, then UNLINK it while it is still executing
        client
            .write_all(&submit_in(7, devid, 1, 10, 8))
            .await
            .unwrap();
        client.write_all(&unlink(8, devid, 7)).await.unwrap();

        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_reply(&mut client))
            .await
            .unwrap()
            .unwrap();
        let Reply::Unlink(ret) = reply else {
            panic!("expected RET_UNLINK, got {:?}", reply);
        };
        assert_eq!(ret.header.seqnum, 8);
        assert_eq!(ret.status, status::ECONNRESET);

        // No RET_SUBMIT for seq 7 may appear: the next reply must belong
        // to a fresh SUBMIT
        client
            .write_all(&submit_in(9, devid, 1, 10, 8))
            .await
            .unwrap();
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_reply(&mut client))
            .await
            .unwrap()
            .unwrap();
        let Reply::Submit(ret) = reply else {
            panic!("expected RET_SUBMIT, got {:?}", reply);
        };
        assert_eq!(ret.header.seqnum, 9);
        assert_eq!(ret.data, vec![5, 5]);
    }

    #[tokio::test]
    async fn test_unlink_of_resolved_seqnum_is_benign() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let devid = registry.get("1-1").unwrap().devid();
        let adapter = adapter_with(MockHostController::new(vec![]));

        let (mut client, _handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        client.write_all(&unlink(5, devid, 999)).await.unwrap();
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_reply(&mut client))
            .await
            .unwrap()
            .unwrap();
        let Reply::Unlink(ret) = reply else {
            panic!("expected RET_UNLINK, got {:?}", reply);
        };
        assert_eq!(ret.header.seqnum, 5);
        assert_eq!(ret.status, status::SUCCESS);
    }

    #[tokio::test]
    async fn test_seqnum_reuse_closes_session() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let devid = registry.get("1-1").unwrap().devid();

        let mut controller = MockHostController::new(vec![]);
        controller.push_delayed_outcome(
            TransferOutcome::success(vec![0; 8]),
            Duration::from_millis(200),
        );
        let adapter = adapter_with(controller);

        let (mut client, handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        client
            .write_all(&submit_in(7, devid, 1, 10, 8))
            .await
            .unwrap();
        client
            .write_all(&submit_in(7, devid, 1, 10, 8))
            .await
            .unwrap();

        with_timeout(DEFAULT_TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.acquire("1-1").is_ok());
    }

    #[tokio::test]
    async fn test_malformed_command_closes_only_this_session() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let adapter = adapter_with(MockHostController::new(vec![]));

        let (mut broken, broken_handle) = spawn_session(&registry, &adapter);
        import(&mut broken, "1-1").await;

        // 48-byte header with an unknown command code
        let mut garbage = vec![0u8; 48];
        garbage[3] = 0x99;
        broken.write_all(&garbage).await.unwrap();

        with_timeout(DEFAULT_TEST_TIMEOUT, broken_handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The attachment is released and other sessions are unaffected
        let (mut healthy, _handle) = spawn_session(&registry, &adapter);
        let reply = import(&mut healthy, "1-1").await;
        let OpReply::Import { status, .. } = reply else {
            panic!("expected import reply");
        };
        assert_eq!(status, protocol::ST_OK);
    }

    #[tokio::test]
    async fn test_truncated_header_closes_session() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let adapter = adapter_with(MockHostController::new(vec![]));

        let (mut client, handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        // 20 bytes of a 48-byte command header, then EOF mid-frame
        client.write_all(&[0u8; 20]).await.unwrap();
        drop(client);

        with_timeout(DEFAULT_TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.acquire("1-1").is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_after_submit_releases_attachment() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let devid = registry.get("1-1").unwrap().devid();

        let mut controller = MockHostController::new(vec![]);
        controller.push_delayed_outcome(
            TransferOutcome::success(vec![0; 8]),
            Duration::from_millis(200),
        );
        let adapter = adapter_with(controller);

        let (mut client, handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        client
            .write_all(&submit_in(7, devid, 1, 10, 8))
            .await
            .unwrap();
        drop(client);

        with_timeout(DEFAULT_TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // No leaked claim survives the closed session
        assert!(registry.acquire("1-1").is_ok());
    }

    #[tokio::test]
    async fn test_device_gone_forces_close() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(mock_device("1-1", 0x1234, 0x5678))
            .unwrap();
        let devid = registry.get("1-1").unwrap().devid();
        let adapter = adapter_with(GoneHostController);

        let (mut client, handle) = spawn_session(&registry, &adapter);
        import(&mut client, "1-1").await;

        client
            .write_all(&submit_in(7, devid, 1, 10, 8))
            .await
            .unwrap();
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, read_reply(&mut client))
            .await
            .unwrap()
            .unwrap();
        let Reply::Submit(ret) = reply else {
            panic!("expected RET_SUBMIT, got {:?}", reply);
        };
        assert_eq!(ret.header.seqnum, 7);
        assert_eq!(ret.status, status::ENODEV);

        with_timeout(DEFAULT_TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.acquire("1-1").is_ok());
    }

    #[test]
    fn test_queue_depths() {
        // The frame queue must be small enough that a stalled writer
        // stops frame intake promptly
        assert!(FRAME_QUEUE_DEPTH < COMPLETION_QUEUE_DEPTH);
        assert!(FRAME_QUEUE_DEPTH >= 1);
    }
}
