use std::collections::VecDeque;
use std::time::Instant;

use crate::config::Config;
use crate::transport::{UdAddr, UdTransport, WorkCompletion};
use crate::vbuf::{VbufId, VbufLoc, VbufPool};
use crate::wire::{excl_between, incl_between, Header, PacketType, HEADER_LEN};
use crate::{Error, Result};

use super::ud::UdContext;
use super::vc::{Vc, VcState};

const CQ_POLL_BATCH: usize = 64;

/// An accepted connection request; duplicates of the same triple are
/// retransmissions and get dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Accepted {
    lid: u16,
    qpn: u32,
    id: u64,
}

/// Everything the comm lock guards: the UD context, the buffer pool,
/// the VC table, the unacked queue, and the handshake lists.
pub(super) struct Engine {
    pub(super) cfg: Config,
    pub(super) ud: UdContext,
    pub(super) pool: VbufPool,
    pub(super) vcs: Vec<Vc>,
    /// Sent-but-unacked packets, ordered by last send time.
    unacked: VecDeque<VbufId>,
    /// CONNECT datagrams waiting for an `accept` call.
    connect_backlog: VecDeque<(VbufId, UdAddr)>,
    accepted: Vec<Accepted>,
    pub(super) local: UdAddr,
    start: Instant,
    dead: Option<String>,
}

impl Engine {
    pub(super) fn new(transport: Box<dyn UdTransport>, cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let local = transport.local_addr();
        let mut eng = Engine {
            pool: VbufPool::new(cfg.ud_mtu, cfg.vbuf_pool_chunk, cfg.vbuf_max),
            ud: UdContext::new(transport, &cfg),
            cfg,
            vcs: Vec::new(),
            unacked: VecDeque::new(),
            connect_backlog: VecDeque::new(),
            accepted: Vec::new(),
            local,
            start: Instant::now(),
            dead: None,
        };
        let posted = eng.post_recvs(eng.cfg.max_ud_recv_wqe)?;
        eng.ud.recvs_posted = posted;
        log::debug!("engine up at {} with {posted} receives posted", eng.local);
        Ok(eng)
    }

    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Record an unrecoverable failure. Exits the process unless the
    /// configuration asks for errors instead.
    fn fatal(&mut self, msg: String) -> Error {
        log::error!("{msg}");
        if self.cfg.fail_fast {
            std::process::exit(1);
        }
        self.dead = Some(msg.clone());
        Error::Fatal(msg)
    }

    pub(super) fn check_dead(&self) -> Result<()> {
        match &self.dead {
            Some(msg) => Err(Error::Fatal(msg.clone())),
            None => Ok(()),
        }
    }

    /*
     * VC management
     */

    pub(super) fn vc_alloc(&mut self) -> usize {
        let id = self.vcs.len();
        self.vcs.push(Vc::new(id as u64));
        id
    }

    fn vc_set_addr(&mut self, vci: usize, remote: UdAddr) -> Result<()> {
        if self.vcs[vci].state != VcState::Init {
            return Ok(());
        }
        let ah = match self.ud.transport.create_ah(remote) {
            Ok(ah) => ah,
            Err(e) => return Err(self.fatal(format!("failed to create address handle: {e}"))),
        };
        let vc = &mut self.vcs[vci];
        vc.ah = Some(ah);
        vc.remote = Some(remote);
        vc.state = VcState::Connecting;
        Ok(())
    }

    /*
     * Send path
     */

    /// Frame `payload` into a packet on `vci` and queue it for the wire.
    /// DATA and non-ACK control packets consume a sequence number and
    /// enter the send window (or the extended window past its bound);
    /// pure ACKs bypass both and are released on send completion.
    pub(super) fn vc_send(
        &mut self,
        vci: usize,
        ptype: PacketType,
        payload: &[u8],
    ) -> Result<()> {
        debug_assert!(payload.len() <= self.cfg.max_payload());
        let id = self.pool.take().ok_or(Error::BufExhausted)?;
        {
            let vc = &mut self.vcs[vci];
            let v = self.pool.get_mut(id);
            v.vc = vci;
            v.len = HEADER_LEN + payload.len();
            v.buf[0] = ptype as u8;
            v.buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
            v.seq = vc.next_tosend;
            if ptype != PacketType::Ack {
                vc.next_tosend = vc.next_tosend.wrapping_add(1);
            }
            // this packet carries our ack high-water mark out
            vc.ack_need_tosend = false;
            vc.ack_pending = 0;
        }

        if ptype == PacketType::Ack {
            return self.ud_post_send(vci, id);
        }

        if self.vcs[vci].send_window.len() < self.cfg.sendwin_size {
            self.pool.get_mut(id).loc = VbufLoc::SendWindow;
            self.vcs[vci].send_window.push_back(id);
            self.ud_post_send(vci, id)
        } else {
            self.pool.get_mut(id).loc = VbufLoc::ExtWindow;
            self.vcs[vci].ext_window.push_back(id);
            Ok(())
        }
    }

    /// Hand a packet to the QP, or park it on the UD extended send
    /// queue when no send work request is available.
    fn ud_post_send(&mut self, vci: usize, id: VbufId) -> Result<()> {
        if self.ud.send_wqes_avail == 0 {
            let v = self.pool.get_mut(id);
            if !v.in_ud_extq {
                v.in_ud_extq = true;
                self.ud.ext_send_queue.push_back(id);
            }
            return Ok(());
        }
        self.submit(vci, id)
    }

    /// Stamp the header and post the datagram. Also used verbatim for
    /// retransmission: the sequence number is already fixed and the
    /// acknum is refreshed from the VC's current state.
    fn submit(&mut self, vci: usize, id: VbufId) -> Result<()> {
        let (ah, writeid, acknum) = {
            let vc = &self.vcs[vci];
            (vc.ah, vc.writeid, vc.wire_acknum())
        };
        let ah = ah.ok_or_else(|| Error::Transport("send on unaddressed vc".into()))?;

        let now = self.now_us();
        let ptype;
        {
            let v = self.pool.get_mut(id);
            ptype = PacketType::from_u8(v.buf[0]).ok_or(Error::UnknownType(v.buf[0]))?;
            let hdr = Header {
                ptype,
                srcid: writeid,
                seqnum: v.seq,
                acknum,
                rail: 0,
            };
            hdr.write_to(&mut v.buf);
            v.inflight += 1;
            v.sent_us = now;
            if v.first_sent_us.is_none() {
                v.first_sent_us = Some(now);
            }
            if ptype == PacketType::Ack {
                v.free_pending = true;
            }
        }
        self.ud.send_wqes_avail -= 1;

        let res = {
            let v = self.pool.get(id);
            self.ud.transport.post_send(ah, id as u64, v.bytes())
        };
        if let Err(e) = res {
            return Err(self.fatal(format!("failed to post send: {e}")));
        }

        if ptype != PacketType::Ack && !self.pool.get(id).in_unacked {
            self.pool.get_mut(id).in_unacked = true;
            self.unacked.push_back(id);
        }
        Ok(())
    }

    /// Move packets from the UD extended send queue onto the QP while
    /// credit lasts.
    fn drain_ud_ext_queue(&mut self) -> Result<()> {
        while self.ud.send_wqes_avail > 0 {
            let id = match self.ud.ext_send_queue.pop_front() {
                Some(id) => id,
                None => break,
            };
            self.pool.get_mut(id).in_ud_extq = false;
            self.ud.ext_sendq_count += 1;
            let vci = self.pool.get(id).vc;
            self.submit(vci, id)?;
        }
        Ok(())
    }

    /// Promote packets from the VC extended window into freed
    /// send-window slots.
    fn drain_vc_ext_window(&mut self, vci: usize) -> Result<()> {
        loop {
            let id = {
                let vc = &mut self.vcs[vci];
                if vc.send_window.len() >= self.cfg.sendwin_size {
                    break;
                }
                match vc.ext_window.pop_front() {
                    Some(id) => id,
                    None => break,
                }
            };
            self.pool.get_mut(id).loc = VbufLoc::SendWindow;
            let vc = &mut self.vcs[vci];
            vc.send_window.push_back(id);
            vc.ext_win_send_count += 1;
            self.ud_post_send(vci, id)?;
        }
        Ok(())
    }

    /*
     * Completion-queue dispatch
     */

    /// Poll until the completion queue is empty.
    pub(super) fn drain_cq(&mut self) -> Result<()> {
        loop {
            if self.poll_cq_once()? == 0 {
                return Ok(());
            }
        }
    }

    fn poll_cq_once(&mut self) -> Result<usize> {
        let mut comps = Vec::with_capacity(CQ_POLL_BATCH);
        let n = match self.ud.transport.poll_cq(CQ_POLL_BATCH, &mut comps) {
            Ok(n) => n,
            Err(e) => return Err(self.fatal(format!("completion queue poll failed: {e}"))),
        };

        let mut sendcnt = 0;
        for wc in comps {
            match wc {
                WorkCompletion::Send { wr_id } => {
                    sendcnt += 1;
                    let id = wr_id as usize;
                    let freed = {
                        let v = self.pool.get_mut(id);
                        v.inflight -= 1;
                        v.inflight == 0 && v.free_pending
                    };
                    if freed {
                        self.pool.release(id);
                    }
                }
                WorkCompletion::Recv { wr_id, src, data } => {
                    self.ud.recvs_posted -= 1;
                    let id = wr_id as usize;
                    if data.len() > self.cfg.ud_mtu {
                        log::warn!("dropping oversized datagram ({} bytes) from {src}", data.len());
                        self.pool.get_mut(id).loc = VbufLoc::Loose;
                        self.pool.release(id);
                        continue;
                    }
                    {
                        let v = self.pool.get_mut(id);
                        debug_assert_eq!(v.loc, VbufLoc::PostedRecv);
                        v.loc = VbufLoc::Loose;
                        v.buf[..data.len()].copy_from_slice(&data);
                        v.len = data.len();
                    }
                    match Header::parse(self.pool.get(id).bytes()) {
                        Ok(hdr) => self.route_recv(id, hdr, src)?,
                        Err(e) => {
                            log::warn!("dropping malformed datagram from {src}: {e}");
                            self.pool.release(id);
                        }
                    }
                }
            }
        }

        if self.ud.recvs_posted < self.ud.credit_preserve {
            let want = self.cfg.max_ud_recv_wqe - self.ud.recvs_posted;
            let posted = self.post_recvs(want)?;
            self.ud.recvs_posted += posted;
        }

        if sendcnt > 0 {
            self.ud.send_wqes_avail += sendcnt;
            self.drain_ud_ext_queue()?;
        }
        Ok(n)
    }

    fn route_recv(&mut self, id: VbufId, hdr: Header, src: UdAddr) -> Result<()> {
        // CONNECTs carry no usable srcid; they wait for accept
        if hdr.ptype == PacketType::Connect {
            self.connect_backlog.push_back((id, src));
            return Ok(());
        }
        let vci = hdr.srcid as usize;
        if vci >= self.vcs.len() {
            log::warn!("dropping packet with out-of-range srcid {} from {src}", hdr.srcid);
            self.pool.release(id);
            return Ok(());
        }
        if self.vcs[vci].remote != Some(src) {
            log::warn!("dropping spoofed packet for vc {vci}: wire source {src}");
            self.pool.release(id);
            return Ok(());
        }
        self.vc_recv(vci, id, hdr)
    }

    fn post_recvs(&mut self, want: usize) -> Result<usize> {
        let mut posted = 0;
        for _ in 0..want {
            let id = match self.pool.take() {
                Some(id) => id,
                None => break,
            };
            self.pool.get_mut(id).loc = VbufLoc::PostedRecv;
            if let Err(e) = self.ud.transport.post_recv(id as u64) {
                self.pool.release(id);
                return Err(self.fatal(format!("failed to post receive: {e}")));
            }
            posted += 1;
        }
        Ok(posted)
    }

    /*
     * Receive path
     */

    fn vc_recv(&mut self, vci: usize, id: VbufId, hdr: Header) -> Result<()> {
        // every packet type except CONNECT piggybacks an ack
        if hdr.ptype != PacketType::Connect {
            self.process_ack(vci, hdr.acknum);
            self.drain_vc_ext_window(vci)?;
        }

        if hdr.ptype == PacketType::Ack {
            self.pool.release(id);
            return Ok(());
        }

        let next = self.vcs[vci].next_torecv;
        if hdr.seqnum == next {
            self.accept_in_order(vci, id, hdr.ptype, hdr.seqnum);
            self.splice_recv_window(vci);
        } else {
            self.stash_out_of_order(vci, id, hdr.seqnum);
        }

        // duplicates still push toward an explicit ack
        let force_ack = {
            let vc = &mut self.vcs[vci];
            vc.ack_need_tosend = true;
            vc.ack_pending += 1;
            vc.ack_pending >= self.cfg.max_ack_pending
        };
        if force_ack {
            self.send_explicit_ack(vci)?;
        }
        Ok(())
    }

    /// Accept the packet everyone has been waiting on and advance the
    /// in-order tail.
    fn accept_in_order(&mut self, vci: usize, id: VbufId, ptype: PacketType, seq: u16) {
        {
            let vc = &mut self.vcs[vci];
            debug_assert_eq!(seq, vc.next_torecv);
            vc.next_torecv = vc.next_torecv.wrapping_add(1);
            vc.last_recv = Some(seq);
        }
        match ptype {
            PacketType::Data | PacketType::Accept => {
                {
                    let v = self.pool.get_mut(id);
                    v.loc = VbufLoc::AppWindow;
                    v.vc = vci;
                    v.seq = seq;
                }
                self.vcs[vci].app_recv_window.push_back(id);
            }
            PacketType::Disconnect => {
                log::debug!("vc {vci} closed by peer");
                self.vcs[vci].remote_closed = true;
                self.pool.release(id);
            }
            // CONNECT is consumed during the handshake; its payload was
            // already parsed by accept
            _ => self.pool.release(id),
        }
    }

    /// Splice the contiguous prefix of the out-of-order window onto the
    /// application window.
    fn splice_recv_window(&mut self, vci: usize) {
        loop {
            let id = {
                let vc = &self.vcs[vci];
                match vc.recv_window.front() {
                    Some(&id) if self.pool.get(id).seq == vc.next_torecv => id,
                    _ => break,
                }
            };
            self.vcs[vci].recv_window.pop_front();
            let (ptype, seq) = {
                let v = self.pool.get(id);
                (
                    PacketType::from_u8(v.buf[0]).unwrap_or(PacketType::Data),
                    v.seq,
                )
            };
            self.accept_in_order(vci, id, ptype, seq);
        }
    }

    /// Park an out-of-sequence packet, keeping the window sorted and
    /// duplicate-free. Anything outside the receive window or already
    /// delivered is dropped; retransmission covers it.
    fn stash_out_of_order(&mut self, vci: usize, id: VbufId, seq: u16) {
        let next = self.vcs[vci].next_torecv;
        if !excl_between(seq, next, next.wrapping_add(self.cfg.recvwin_size)) {
            log::trace!("vc {vci}: dropping duplicate/stale seq {seq}");
            self.pool.release(id);
            return;
        }
        let dist = seq.wrapping_sub(next);

        let mut pos = None;
        {
            let vc = &self.vcs[vci];
            for (i, &eid) in vc.recv_window.iter().enumerate() {
                let edist = self.pool.get(eid).seq.wrapping_sub(next);
                if edist == dist {
                    // duplicate of a buffered packet
                    self.pool.release(id);
                    return;
                }
                if edist > dist {
                    pos = Some(i);
                    break;
                }
            }
        }
        {
            let v = self.pool.get_mut(id);
            v.loc = VbufLoc::RecvWindow;
            v.vc = vci;
            v.seq = seq;
        }
        let vc = &mut self.vcs[vci];
        match pos {
            Some(i) => vc.recv_window.insert(i, id),
            None => vc.recv_window.push_back(id),
        }
    }

    /// Clear everything up to `acknum` out of the send window and the
    /// unacked queue. The acknum is only honored when it falls inside
    /// the outstanding range; this is what keeps the `ACK_NONE` wire
    /// sentinel from ever acking a real packet.
    fn process_ack(&mut self, vci: usize, acknum: u16) {
        let (oldest, newest) = {
            let vc = &self.vcs[vci];
            match vc.send_window.front() {
                Some(&front) => (self.pool.get(front).seq, vc.next_tosend.wrapping_sub(1)),
                None => return,
            }
        };
        if !incl_between(acknum, oldest, newest) {
            return;
        }

        loop {
            let id = match self.vcs[vci].send_window.front() {
                Some(&id) => id,
                None => break,
            };
            if !incl_between(self.pool.get(id).seq, oldest, acknum) {
                break;
            }
            self.vcs[vci].send_window.pop_front();
            if self.pool.get(id).in_unacked {
                self.unacked.retain(|&x| x != id);
                self.pool.get_mut(id).in_unacked = false;
            }
            if self.pool.get(id).in_ud_extq {
                self.ud.ext_send_queue.retain(|&x| x != id);
                self.pool.get_mut(id).in_ud_extq = false;
            }
            // a send completion may still be outstanding; if so, the
            // release happens when it retires
            let defer = {
                let v = self.pool.get_mut(id);
                v.loc = VbufLoc::Loose;
                v.inflight > 0
            };
            if defer {
                self.pool.get_mut(id).free_pending = true;
            } else {
                self.pool.release(id);
            }
        }
    }

    /*
     * ACK and retransmit timers
     */

    fn send_explicit_ack(&mut self, vci: usize) -> Result<()> {
        match self.vc_send(vci, PacketType::Ack, &[]) {
            Ok(()) => {
                self.vcs[vci].cntl_acks += 1;
                Ok(())
            }
            // recoverable: the need-ack flag survives a dry pool, so the
            // next progress tick retries
            Err(Error::BufExhausted) => {
                log::warn!("no vbuf for explicit ack on vc {vci}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Emit explicit ACKs for every VC that owes one.
    pub(super) fn send_acks(&mut self) -> Result<()> {
        for vci in 0..self.vcs.len() {
            let due = {
                let vc = &self.vcs[vci];
                vc.ack_need_tosend && vc.ah.is_some()
            };
            if due {
                self.send_explicit_ack(vci)?;
            }
        }
        Ok(())
    }

    /// Walk the unacked queue and resend everything older than the
    /// retry timeout. The queue is ordered by last send time, so the
    /// walk stops at the first young entry.
    pub(super) fn check_resend(&mut self) -> Result<()> {
        let now = self.now_us();
        loop {
            let id = match self.unacked.front() {
                Some(&id) => id,
                None => break,
            };
            let (age, total_age) = {
                let v = self.pool.get(id);
                (
                    now.saturating_sub(v.sent_us),
                    now.saturating_sub(v.first_sent_us.unwrap_or(now)),
                )
            };
            if age < self.cfg.retry_timeout_us {
                break;
            }
            if total_age > self.cfg.max_retry_timeout_us {
                let seq = self.pool.get(id).seq;
                return Err(self.fatal(format!(
                    "peer unreachable: packet seq {seq} unacked after {total_age} us"
                )));
            }

            self.unacked.pop_front();
            let vci = self.pool.get(id).vc;
            self.vcs[vci].resend_count += 1;
            self.pool.get_mut(id).sent_us = now;
            log::debug!("resending seq {} on vc {vci}", self.pool.get(id).seq);
            self.ud_post_send(vci, id)?;
            self.unacked.push_back(id);
        }
        Ok(())
    }

    /*
     * Handshake
     */

    /// Allocate a VC toward `remote` and fire the CONNECT packet. The
    /// caller then waits for the ACCEPT to land on the new VC.
    pub(super) fn start_connect(&mut self, remote: UdAddr) -> Result<usize> {
        let vci = self.vc_alloc();
        self.vc_set_addr(vci, remote)?;
        let mut payload = format!(
            "{:06x}:{:04x}:{:06x}",
            self.vcs[vci].readid, self.local.lid, self.local.qpn
        )
        .into_bytes();
        payload.push(0);
        self.vc_send(vci, PacketType::Connect, &payload)?;
        Ok(vci)
    }

    /// Parse the ACCEPT payload and finish the active side.
    pub(super) fn finish_connect(&mut self, vci: usize, payload: &[u8]) -> Result<()> {
        let writeid = parse_accept_payload(payload).ok_or(Error::MalformedPayload("accept"))?;
        let vc = &mut self.vcs[vci];
        vc.writeid = writeid;
        vc.state = VcState::Connected;
        Ok(())
    }

    /// Service one entry of the connect backlog. Returns the new VC
    /// index, or `None` when the backlog is empty or held a duplicate.
    pub(super) fn try_accept(&mut self) -> Result<Option<usize>> {
        let (id, wire_src) = match self.connect_backlog.pop_front() {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let parsed = parse_connect_payload(self.pool.get(id).payload());
        let (peer_id, lid, qpn) = match parsed {
            Some(triple) => triple,
            None => {
                self.pool.release(id);
                return Err(Error::MalformedPayload("connect"));
            }
        };

        let key = Accepted { lid, qpn, id: peer_id };
        if self.accepted.contains(&key) {
            log::debug!("dropping duplicate connect from {lid:04x}:{qpn:06x}");
            self.pool.release(id);
            return Ok(None);
        }

        let hdr = match Header::parse(self.pool.get(id).bytes()) {
            Ok(hdr) => hdr,
            Err(e) => {
                self.pool.release(id);
                return Err(e);
            }
        };

        let vci = self.vc_alloc();
        self.accepted.push(key);
        let remote = UdAddr { lid, qpn };
        self.vc_set_addr(vci, remote)?;
        self.vcs[vci].writeid = peer_id;
        log::debug!("accepting connect from {remote} (wire source {wire_src})");

        // run the CONNECT through the receive path so its seqnum 0 is
        // consumed and the ACCEPT below piggybacks the ack
        self.vc_recv(vci, id, hdr)?;

        let mut payload = format!("{:06x}", self.vcs[vci].readid).into_bytes();
        payload.push(0);
        self.vc_send(vci, PacketType::Accept, &payload)?;
        self.vcs[vci].state = VcState::Connected;
        Ok(Some(vci))
    }

    /*
     * Application-window consumption
     */

    /// Copy in-order bytes into `buf`, tracking partial consumption of
    /// the head packet. Returns the byte count delivered.
    pub(super) fn read_available(&mut self, vci: usize, buf: &mut [u8]) -> usize {
        let mut nread = 0;
        while nread < buf.len() {
            let id = match self.vcs[vci].app_recv_window.front() {
                Some(&id) => id,
                None => break,
            };
            let consumed = {
                let v = self.pool.get_mut(id);
                let payload = &v.buf[HEADER_LEN + v.read_off..v.len];
                let take = payload.len().min(buf.len() - nread);
                buf[nread..nread + take].copy_from_slice(&payload[..take]);
                v.read_off += take;
                nread += take;
                HEADER_LEN + v.read_off >= v.len
            };
            if consumed {
                self.vcs[vci].app_recv_window.pop_front();
                self.pool.release(id);
            }
        }
        nread
    }

    /// Pop one whole packet's remaining payload; used by the handshake
    /// to pull the ACCEPT message.
    pub(super) fn pop_app_packet(&mut self, vci: usize) -> Option<Vec<u8>> {
        let id = self.vcs[vci].app_recv_window.pop_front()?;
        let payload = {
            let v = self.pool.get(id);
            v.buf[HEADER_LEN + v.read_off..v.len].to_vec()
        };
        self.pool.release(id);
        Some(payload)
    }

    pub(super) fn app_window_empty(&self, vci: usize) -> bool {
        self.vcs[vci].app_recv_window.is_empty()
    }
}

fn parse_connect_payload(payload: &[u8]) -> Option<(u64, u16, u32)> {
    let text = payload.split(|b| *b == 0).next()?;
    let text = std::str::from_utf8(text).ok()?;
    let mut parts = text.split(':');
    let id = u64::from_str_radix(parts.next()?, 16).ok()?;
    let lid = u16::from_str_radix(parts.next()?, 16).ok()?;
    let qpn = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((id, lid, qpn))
}

fn parse_accept_payload(payload: &[u8]) -> Option<u64> {
    let text = payload.split(|b| *b == 0).next()?;
    let text = std::str::from_utf8(text).ok()?;
    u64::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFabric;
    use crate::wire::ACK_NONE;

    fn small_config() -> Config {
        Config {
            max_ud_send_wqe: 32,
            max_ud_recv_wqe: 16,
            vbuf_pool_chunk: 16,
            sendwin_size: 8,
            recvwin_size: 4,
            fail_fast: false,
            ..Config::default()
        }
    }

    fn engine_with_vc() -> (Engine, usize) {
        let fabric = SimFabric::new(42);
        let nic = fabric.endpoint();
        let peer = fabric.endpoint();
        let mut eng = Engine::new(Box::new(nic), small_config()).unwrap();
        let vci = eng.vc_alloc();
        eng.vc_set_addr(vci, peer.local_addr()).unwrap();
        (eng, vci)
    }

    fn feed(eng: &mut Engine, vci: usize, ptype: PacketType, seq: u16, payload: &[u8]) {
        let id = eng.pool.take().unwrap();
        let hdr = Header {
            ptype,
            srcid: vci as u64,
            seqnum: seq,
            acknum: ACK_NONE,
            rail: 0,
        };
        {
            let v = eng.pool.get_mut(id);
            hdr.write_to(&mut v.buf);
            v.len = HEADER_LEN + payload.len();
            v.buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        }
        eng.vc_recv(vci, id, hdr).unwrap();
    }

    #[test]
    fn ack_sentinel_never_clears_the_window() {
        let (mut eng, vci) = engine_with_vc();
        eng.vc_send(vci, PacketType::Data, b"one").unwrap();
        eng.vc_send(vci, PacketType::Data, b"two").unwrap();
        assert_eq!(eng.vcs[vci].send_window.len(), 2);

        eng.process_ack(vci, ACK_NONE);
        assert_eq!(eng.vcs[vci].send_window.len(), 2);

        eng.process_ack(vci, 0);
        assert_eq!(eng.vcs[vci].send_window.len(), 1);

        eng.process_ack(vci, 1);
        assert!(eng.vcs[vci].send_window.is_empty());
        assert!(eng.unacked.is_empty());
    }

    #[test]
    fn out_of_order_arrivals_reassemble() {
        let (mut eng, vci) = engine_with_vc();

        feed(&mut eng, vci, PacketType::Data, 1, b"bbb");
        assert!(eng.vcs[vci].app_recv_window.is_empty());
        assert_eq!(eng.vcs[vci].recv_window.len(), 1);

        feed(&mut eng, vci, PacketType::Data, 0, b"aaa");
        assert_eq!(eng.vcs[vci].app_recv_window.len(), 2);
        assert!(eng.vcs[vci].recv_window.is_empty());
        assert_eq!(eng.vcs[vci].next_torecv, 2);
        assert_eq!(eng.vcs[vci].last_recv, Some(1));

        let mut buf = [0u8; 6];
        assert_eq!(eng.read_available(vci, &mut buf), 6);
        assert_eq!(&buf, b"aaabbb");
    }

    #[test]
    fn duplicates_are_dropped_but_still_count_for_acks() {
        let (mut eng, vci) = engine_with_vc();

        feed(&mut eng, vci, PacketType::Data, 0, b"x");
        feed(&mut eng, vci, PacketType::Data, 0, b"x");
        feed(&mut eng, vci, PacketType::Data, 2, b"z");
        feed(&mut eng, vci, PacketType::Data, 2, b"z");

        assert_eq!(eng.vcs[vci].app_recv_window.len(), 1);
        assert_eq!(eng.vcs[vci].recv_window.len(), 1);
        assert_eq!(eng.vcs[vci].ack_pending, 4);
        assert!(eng.vcs[vci].ack_need_tosend);
    }

    #[test]
    fn stale_and_far_future_packets_are_dropped() {
        let (mut eng, vci) = engine_with_vc();

        // recvwin_size is 4: seq 5 is out of window with next_torecv 0
        feed(&mut eng, vci, PacketType::Data, 5, b"late");
        assert!(eng.vcs[vci].recv_window.is_empty());

        feed(&mut eng, vci, PacketType::Data, 0, b"ok");
        // already delivered: wrapped distance is far outside the window
        feed(&mut eng, vci, PacketType::Data, 0, b"ok");
        assert_eq!(eng.vcs[vci].app_recv_window.len(), 1);
    }

    #[test]
    fn window_overflow_goes_to_ext_window() {
        let (mut eng, vci) = engine_with_vc();
        for i in 0..10u8 {
            eng.vc_send(vci, PacketType::Data, &[i]).unwrap();
        }
        assert_eq!(eng.vcs[vci].send_window.len(), 8);
        assert_eq!(eng.vcs[vci].ext_window.len(), 2);

        // acking the first two promotes the overflow
        eng.process_ack(vci, 1);
        assert_eq!(eng.vcs[vci].send_window.len(), 6);
        eng.drain_vc_ext_window(vci).unwrap();
        assert_eq!(eng.vcs[vci].send_window.len(), 8);
        assert!(eng.vcs[vci].ext_window.is_empty());
        assert_eq!(eng.vcs[vci].ext_win_send_count, 2);
    }

    #[test]
    fn partial_reads_keep_the_cursor() {
        let (mut eng, vci) = engine_with_vc();
        feed(&mut eng, vci, PacketType::Data, 0, b"abcdef");

        let mut buf = [0u8; 2];
        assert_eq!(eng.read_available(vci, &mut buf), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(eng.read_available(vci, &mut buf), 2);
        assert_eq!(&buf, b"cd");

        let mut rest = [0u8; 8];
        assert_eq!(eng.read_available(vci, &mut rest), 2);
        assert_eq!(&rest[..2], b"ef");
        assert!(eng.app_window_empty(vci));
    }

    #[test]
    fn disconnect_marks_remote_closed_without_surfacing_bytes() {
        let (mut eng, vci) = engine_with_vc();
        feed(&mut eng, vci, PacketType::Data, 0, b"tail");
        feed(&mut eng, vci, PacketType::Disconnect, 1, &[]);

        assert!(eng.vcs[vci].remote_closed);
        let mut buf = [0u8; 4];
        assert_eq!(eng.read_available(vci, &mut buf), 4);
        assert_eq!(&buf, b"tail");
        assert!(eng.app_window_empty(vci));
    }

    #[test]
    fn connect_payload_parsing() {
        assert_eq!(
            parse_connect_payload(b"00002a:0001:000100\0"),
            Some((0x2a, 1, 0x100))
        );
        assert_eq!(parse_connect_payload(b"junk\0"), None);
        assert_eq!(parse_connect_payload(b"1:2:3:4\0"), None);
        assert_eq!(parse_accept_payload(b"00000f\0"), Some(15));
        assert_eq!(parse_accept_payload(b"zz\0"), None);
    }
}
