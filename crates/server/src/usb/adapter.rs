//! Transfer adapter
//!
//! Translates decoded SUBMIT commands into host-controller transfer
//! descriptors and hands them to the USB worker through the channel
//! bridge. Submission is a non-blocking handoff; cancellation is
//! best-effort and completions arrive on the session's own queue.

use common::{HostBridge, TransferCompletion, TransferKind, TransferSpec, TransferTicket};
use protocol::CmdSubmit;
use std::time::Duration;
use tokio::sync::mpsc;

/// Timeout applied to forwarded transfers. The USB/IP SUBMIT packet does
/// not carry one, and a transfer must never pin the worker forever.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Session-facing handle to the USB worker
#[derive(Clone)]
pub struct TransferAdapter {
    bridge: HostBridge,
}

impl TransferAdapter {
    pub fn new(bridge: HostBridge) -> Self {
        TransferAdapter { bridge }
    }

    /// Forward a SUBMIT for `busid` to the host controller. Returns as
    /// soon as the transfer is queued; the completion arrives later on
    /// `completion`.
    pub async fn submit(
        &self,
        busid: &str,
        cmd: &CmdSubmit,
        completion: mpsc::Sender<TransferCompletion>,
    ) -> common::Result<TransferTicket> {
        self.bridge.submit(spec_from_submit(busid, cmd), completion).await
    }

    /// Request best-effort cancellation of an in-flight transfer
    pub async fn cancel(&self, ticket: TransferTicket) -> common::Result<()> {
        self.bridge.cancel(ticket).await
    }
}

/// Build the endpoint address byte: endpoint number plus direction bit
fn endpoint_address(cmd: &CmdSubmit) -> u8 {
    let number = (cmd.header.ep & 0x0f) as u8;
    if cmd.header.direction.is_in() {
        number | 0x80
    } else {
        number
    }
}

/// Infer the endpoint transfer kind from SUBMIT fields.
///
/// The packet does not name the endpoint type: endpoint 0 is control and
/// a positive polling interval marks an interrupt endpoint; everything
/// else is treated as bulk. Isochronous submissions are screened out
/// before this point via [`CmdSubmit::is_isochronous`].
fn infer_kind(cmd: &CmdSubmit) -> TransferKind {
    if cmd.header.ep == 0 {
        TransferKind::Control
    } else if cmd.interval > 0 {
        TransferKind::Interrupt
    } else {
        TransferKind::Bulk
    }
}

/// Translate a SUBMIT command into a host transfer descriptor
pub fn spec_from_submit(busid: &str, cmd: &CmdSubmit) -> TransferSpec {
    TransferSpec {
        busid: busid.to_string(),
        endpoint: endpoint_address(cmd),
        direction: cmd.header.direction,
        kind: infer_kind(cmd),
        setup: cmd.setup,
        data: cmd.data.clone(),
        length: cmd.transfer_buffer_length as usize,
        timeout: TRANSFER_TIMEOUT,
    }
}
