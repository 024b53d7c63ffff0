use std::collections::VecDeque;

use crate::transport::{Ah, UdAddr};
use crate::vbuf::VbufId;
use crate::wire::ACK_NONE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcState {
    Init,
    Connecting,
    Connected,
}

/// Per-peer connection state layered over the shared UD queue pair.
///
/// `readid` is this VC's index in the endpoint's table; the peer stamps
/// it into `srcid` when sending here. `writeid` is the id the peer
/// assigned us, stamped into our outgoing packets.
#[derive(Debug)]
pub struct Vc {
    pub state: VcState,
    pub ah: Option<Ah>,
    pub remote: Option<UdAddr>,
    pub readid: u64,
    pub writeid: u64,

    /// Next sequence number stamped on an outgoing data/control packet.
    pub next_tosend: u16,
    /// Sequence number expected at the tail of the in-order window.
    pub next_torecv: u16,
    /// Highest in-order sequence number received, `None` until the
    /// first packet lands. Wire acknum is `ACK_NONE` while `None`.
    pub last_recv: Option<u16>,
    pub ack_need_tosend: bool,
    /// Packets received since the last ACK left.
    pub ack_pending: u16,

    pub send_window: VecDeque<VbufId>,
    pub ext_window: VecDeque<VbufId>,
    pub recv_window: VecDeque<VbufId>,
    pub app_recv_window: VecDeque<VbufId>,

    pub local_closed: bool,
    pub remote_closed: bool,

    pub cntl_acks: u64,
    pub resend_count: u64,
    pub ext_win_send_count: u64,
}

impl Vc {
    pub fn new(readid: u64) -> Self {
        Vc {
            state: VcState::Init,
            ah: None,
            remote: None,
            readid,
            writeid: 0,
            next_tosend: 0,
            next_torecv: 0,
            last_recv: None,
            ack_need_tosend: false,
            ack_pending: 0,
            send_window: VecDeque::new(),
            ext_window: VecDeque::new(),
            recv_window: VecDeque::new(),
            app_recv_window: VecDeque::new(),
            local_closed: false,
            remote_closed: false,
            cntl_acks: 0,
            resend_count: 0,
            ext_win_send_count: 0,
        }
    }

    pub fn wire_acknum(&self) -> u16 {
        self.last_recv.unwrap_or(ACK_NONE)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            explicit_acks: self.cntl_acks,
            resends: self.resend_count,
            ext_window_sends: self.ext_win_send_count,
            inflight: self.send_window.len(),
        }
    }
}

/// Advisory per-channel counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    /// Explicit ACK packets emitted.
    pub explicit_acks: u64,
    /// Retransmission operations.
    pub resends: u64,
    /// Packets promoted from the extended send window.
    pub ext_window_sends: u64,
    /// Packets currently in the send window.
    pub inflight: usize,
}
