use std::collections::VecDeque;

use crate::config::Config;
use crate::transport::UdTransport;
use crate::vbuf::VbufId;

/// Tracks access to the one UD queue pair every VC shares.
pub struct UdContext {
    pub transport: Box<dyn UdTransport>,
    /// Send work requests we may still post before the QP is full.
    pub send_wqes_avail: usize,
    /// Receive work requests currently posted.
    pub recvs_posted: usize,
    /// Low-water mark that triggers a receive refill.
    pub credit_preserve: usize,
    /// Packets waiting for a send slot, drained FIFO as sends complete.
    pub ext_send_queue: VecDeque<VbufId>,
    /// Cumulative packets submitted from the extended send queue.
    pub ext_sendq_count: u64,
}

impl UdContext {
    pub fn new(transport: Box<dyn UdTransport>, cfg: &Config) -> Self {
        UdContext {
            transport,
            send_wqes_avail: cfg.max_ud_send_wqe,
            recvs_posted: 0,
            credit_preserve: (cfg.max_ud_recv_wqe / 4).max(1),
            ext_send_queue: VecDeque::new(),
            ext_sendq_count: 0,
        }
    }
}
