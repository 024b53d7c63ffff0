//! In-process UD fabric with fault injection.
//!
//! Every endpoint created from one [`SimFabric`] shares a software
//! switch. Datagrams are delivered instantly unless the per-link
//! [`FaultProfile`] says otherwise: drops, duplicates, and reorders are
//! drawn from a seeded RNG so failures reproduce. Like real UD, a
//! datagram that arrives while the destination has no posted receive is
//! dropped on the floor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transport::{Ah, UdAddr, UdTransport, WorkCompletion};
use crate::wire::PacketType;
use crate::{Error, Result};

/// Loss characteristics of one directed link.
#[derive(Debug, Clone, Default)]
pub struct FaultProfile {
    /// Probability a datagram is dropped.
    pub drop: f64,
    /// Probability a delivered datagram is delivered twice.
    pub duplicate: f64,
    /// Probability a delivered datagram is queued ahead of the one
    /// before it.
    pub reorder: f64,
    /// Packet types that are always dropped, regardless of `drop`.
    pub drop_types: Vec<PacketType>,
}

/// Datagrams handed to the switch, counted per packet type before any
/// fault is applied, plus receiver-not-ready drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireStats {
    pub connect: u64,
    pub accept: u64,
    pub disconnect: u64,
    pub ack: u64,
    pub data: u64,
    pub rnr_drops: u64,
}

impl WireStats {
    fn count(&mut self, type_octet: u8) {
        match PacketType::from_u8(type_octet) {
            Some(PacketType::Connect) => self.connect += 1,
            Some(PacketType::Accept) => self.accept += 1,
            Some(PacketType::Disconnect) => self.disconnect += 1,
            Some(PacketType::Ack) => self.ack += 1,
            Some(PacketType::Data) => self.data += 1,
            None => {}
        }
    }
}

#[derive(Default)]
struct Port {
    recv_slots: VecDeque<u64>,
    cq: VecDeque<WorkCompletion>,
}

struct Switch {
    rng: StdRng,
    next_lid: u16,
    next_qpn: u32,
    ports: HashMap<UdAddr, Port>,
    links: HashMap<(UdAddr, UdAddr), FaultProfile>,
    stats: WireStats,
}

#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<Mutex<Switch>>,
}

impl SimFabric {
    pub fn new(seed: u64) -> Self {
        SimFabric {
            inner: Arc::new(Mutex::new(Switch {
                rng: StdRng::seed_from_u64(seed),
                next_lid: 1,
                next_qpn: 0x100,
                ports: HashMap::new(),
                links: HashMap::new(),
                stats: WireStats::default(),
            })),
        }
    }

    /// Register a new queue pair on the fabric.
    pub fn endpoint(&self) -> SimNic {
        let mut sw = self.inner.lock().unwrap();
        let addr = UdAddr {
            lid: sw.next_lid,
            qpn: sw.next_qpn,
        };
        sw.next_lid += 1;
        sw.next_qpn += 1;
        sw.ports.insert(addr, Port::default());
        SimNic {
            addr,
            inner: self.inner.clone(),
        }
    }

    /// Install a fault profile on the directed link `from -> to`.
    pub fn set_link(&self, from: UdAddr, to: UdAddr, profile: FaultProfile) {
        self.inner.lock().unwrap().links.insert((from, to), profile);
    }

    pub fn clear_link(&self, from: UdAddr, to: UdAddr) {
        self.inner.lock().unwrap().links.remove(&(from, to));
    }

    pub fn stats(&self) -> WireStats {
        self.inner.lock().unwrap().stats
    }
}

pub struct SimNic {
    addr: UdAddr,
    inner: Arc<Mutex<Switch>>,
}

impl Switch {
    fn deliver(&mut self, src: UdAddr, dst: UdAddr, data: &[u8], reorder: f64) {
        let shuffle = reorder > 0.0 && self.rng.gen_bool(reorder.clamp(0.0, 1.0));
        let port = match self.ports.get_mut(&dst) {
            Some(port) => port,
            None => return,
        };
        let slot = match port.recv_slots.pop_front() {
            Some(slot) => slot,
            None => {
                self.stats.rnr_drops += 1;
                return;
            }
        };
        let wc = WorkCompletion::Recv {
            wr_id: slot,
            src,
            data: data.to_vec(),
        };
        if shuffle && !port.cq.is_empty() {
            port.cq.insert(port.cq.len() - 1, wc);
        } else {
            port.cq.push_back(wc);
        }
    }
}

impl UdTransport for SimNic {
    fn local_addr(&self) -> UdAddr {
        self.addr
    }

    fn create_ah(&mut self, remote: UdAddr) -> Result<Ah> {
        Ok(Ah(remote))
    }

    fn post_send(&mut self, ah: Ah, wr_id: u64, datagram: &[u8]) -> Result<()> {
        let mut sw = self.inner.lock().unwrap();
        let type_octet = datagram.first().copied().unwrap_or(0);
        sw.stats.count(type_octet);

        // the QP swallows the datagram immediately
        sw.ports
            .get_mut(&self.addr)
            .ok_or_else(|| Error::Transport("send on unregistered port".into()))?
            .cq
            .push_back(WorkCompletion::Send { wr_id });

        let dst = ah.0;
        let profile = sw
            .links
            .get(&(self.addr, dst))
            .cloned()
            .unwrap_or_default();

        if profile
            .drop_types
            .iter()
            .any(|t| *t as u8 == type_octet)
        {
            return Ok(());
        }
        if profile.drop > 0.0 && sw.rng.gen_bool(profile.drop.clamp(0.0, 1.0)) {
            return Ok(());
        }

        let copies = if profile.duplicate > 0.0
            && sw.rng.gen_bool(profile.duplicate.clamp(0.0, 1.0))
        {
            2
        } else {
            1
        };
        for _ in 0..copies {
            sw.deliver(self.addr, dst, datagram, profile.reorder);
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64) -> Result<()> {
        let mut sw = self.inner.lock().unwrap();
        sw.ports
            .get_mut(&self.addr)
            .ok_or_else(|| Error::Transport("recv on unregistered port".into()))?
            .recv_slots
            .push_back(wr_id);
        Ok(())
    }

    fn poll_cq(&mut self, max: usize, out: &mut Vec<WorkCompletion>) -> Result<usize> {
        let mut sw = self.inner.lock().unwrap();
        let port = sw
            .ports
            .get_mut(&self.addr)
            .ok_or_else(|| Error::Transport("poll on unregistered port".into()))?;
        let mut n = 0;
        while n < max {
            match port.cq.pop_front() {
                Some(wc) => {
                    out.push(wc);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SimFabric, SimNic, SimNic) {
        let fabric = SimFabric::new(7);
        let a = fabric.endpoint();
        let b = fabric.endpoint();
        (fabric, a, b)
    }

    fn drain(nic: &mut SimNic) -> Vec<WorkCompletion> {
        let mut out = Vec::new();
        nic.poll_cq(64, &mut out).unwrap();
        out
    }

    #[test]
    fn clean_link_delivers_once() {
        let (_fabric, mut a, mut b) = pair();
        b.post_recv(1).unwrap();

        let ah = a.create_ah(b.local_addr()).unwrap();
        a.post_send(ah, 9, &[0x04, 1, 2, 3]).unwrap();

        let send_side = drain(&mut a);
        assert!(matches!(send_side[..], [WorkCompletion::Send { wr_id: 9 }]));

        let recv_side = drain(&mut b);
        match &recv_side[..] {
            [WorkCompletion::Recv { wr_id, src, data }] => {
                assert_eq!(*wr_id, 1);
                assert_eq!(*src, a.local_addr());
                assert_eq!(data, &[0x04, 1, 2, 3]);
            }
            other => panic!("unexpected completions: {other:?}"),
        }
    }

    #[test]
    fn no_posted_recv_means_drop() {
        let (fabric, mut a, mut b) = pair();
        let ah = a.create_ah(b.local_addr()).unwrap();
        a.post_send(ah, 0, &[0x04]).unwrap();

        assert!(drain(&mut b).is_empty());
        assert_eq!(fabric.stats().rnr_drops, 1);
    }

    #[test]
    fn full_drop_profile_blackholes() {
        let (fabric, mut a, mut b) = pair();
        fabric.set_link(
            a.local_addr(),
            b.local_addr(),
            FaultProfile {
                drop: 1.0,
                ..Default::default()
            },
        );
        b.post_recv(1).unwrap();
        let ah = a.create_ah(b.local_addr()).unwrap();
        a.post_send(ah, 0, &[0x04]).unwrap();

        assert!(drain(&mut b).is_empty());
        // the send itself still completes
        assert_eq!(drain(&mut a).len(), 1);
    }

    #[test]
    fn type_filter_only_drops_that_type() {
        let (fabric, mut a, mut b) = pair();
        fabric.set_link(
            a.local_addr(),
            b.local_addr(),
            FaultProfile {
                drop_types: vec![PacketType::Ack],
                ..Default::default()
            },
        );
        b.post_recv(1).unwrap();
        b.post_recv(2).unwrap();

        let ah = a.create_ah(b.local_addr()).unwrap();
        a.post_send(ah, 0, &[PacketType::Ack as u8]).unwrap();
        a.post_send(ah, 1, &[PacketType::Data as u8]).unwrap();

        let got = drain(&mut b);
        assert_eq!(got.len(), 1);
        assert!(
            matches!(&got[0], WorkCompletion::Recv { data, .. } if data[0] == PacketType::Data as u8)
        );
    }

    #[test]
    fn duplication_delivers_twice() {
        let (fabric, mut a, mut b) = pair();
        fabric.set_link(
            a.local_addr(),
            b.local_addr(),
            FaultProfile {
                duplicate: 1.0,
                ..Default::default()
            },
        );
        b.post_recv(1).unwrap();
        b.post_recv(2).unwrap();

        let ah = a.create_ah(b.local_addr()).unwrap();
        a.post_send(ah, 0, &[0x04, 0xaa]).unwrap();

        let got = drain(&mut b);
        assert_eq!(got.len(), 2);
        assert_eq!(fabric.stats().data, 1);
    }
}
