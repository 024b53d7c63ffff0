//! Packet header codec and sequence-number window predicates.
//!
//! Every datagram starts with the same fixed header. All multi-byte
//! fields are little-endian on the wire; both peers of a fabric are
//! expected to agree on this encoding.
//!
//! ```text
//! offset  size  field
//! 0       1     type    control bit 0x80 set for control packets
//! 1       8     srcid   write id stamped by the sender
//! 9       2     seqnum  packet sequence number on the sender's VC
//! 11      2     acknum  latest in-order seqnum seen from this VC
//! 13      1     rail    rail id (always 0)
//! ```

use crate::{Error, Result};

pub const HEADER_LEN: usize = 14;

/// High bit of the type octet marks control packets.
pub const CONTROL_BIT: u8 = 0x80;

/// Wire value of `acknum` when the sender has not received anything yet.
pub const ACK_NONE: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0x80,
    Accept = 0x81,
    Disconnect = 0x82,
    Ack = 0x83,
    Data = 0x04,
}

impl PacketType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x80 => Some(PacketType::Connect),
            0x81 => Some(PacketType::Accept),
            0x82 => Some(PacketType::Disconnect),
            0x83 => Some(PacketType::Ack),
            0x04 => Some(PacketType::Data),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        self as u8 & CONTROL_BIT != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ptype: PacketType,
    pub srcid: u64,
    pub seqnum: u16,
    pub acknum: u16,
    pub rail: u8,
}

impl Header {
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.ptype as u8;
        buf[1..9].copy_from_slice(&self.srcid.to_le_bytes());
        buf[9..11].copy_from_slice(&self.seqnum.to_le_bytes());
        buf[11..13].copy_from_slice(&self.acknum.to_le_bytes());
        buf[13] = self.rail;
    }

    pub fn parse(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let ptype = PacketType::from_u8(buf[0]).ok_or(Error::UnknownType(buf[0]))?;
        Ok(Header {
            ptype,
            srcid: u64::from_le_bytes(buf[1..9].try_into().unwrap()),
            seqnum: u16::from_le_bytes(buf[9..11].try_into().unwrap()),
            acknum: u16::from_le_bytes(buf[11..13].try_into().unwrap()),
            rail: buf[13],
        })
    }
}

/// Whether `val` lies within `[start, end]`, walking forward with wrap.
pub fn incl_between(val: u16, start: u16, end: u16) -> bool {
    if start > end {
        val >= start || val <= end
    } else if end > start {
        val >= start && val <= end
    } else {
        val == start
    }
}

/// Whether `val` lies within `(start, end)`, walking forward with wrap.
pub fn excl_between(val: u16, start: u16, end: u16) -> bool {
    if start > end {
        val > start || val < end
    } else if end > start {
        val > start && val < end
    } else {
        false
    }
}
