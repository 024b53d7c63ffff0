/*
The IBUD engine rebuilds a reliable, in-order byte stream on top of a
single unreliable-datagram queue pair shared by every peer.

A UD context tracks access to the QP: the number of send work requests
still available, the number of receives currently posted, and an
extended send queue of packets waiting for a free send slot. Each
remote peer gets a virtual connection (VC) carrying a 16-bit wrapping
sequence space and four queues:

  send window      packets handed to the UD context, awaiting ACK
  ext window       packets the caller queued past the send-window bound
  recv window      out-of-order arrivals, sorted, waiting for a gap to fill
  app recv window  contiguous packets ready for the application

Every outgoing packet piggybacks the highest in-order sequence number
seen from its destination. On receipt, that acknum clears packets from
the sender's send window and from the process-global unacked queue,
which a progress thread scans on a fixed interval to resend anything
that has waited longer than the retry timeout. When no return traffic
exists to carry acks, the progress thread emits explicit ACK packets;
an explicit ACK also goes out immediately once enough packets arrive
unacknowledged.

Connections bootstrap over the same QP: a CONNECT datagram carries the
id the initiator wants stamped on packets sent to it, accept answers
with an ACCEPT carrying its own id, and a list of accepted (lid, qpn,
id) triples filters the duplicate CONNECTs that retransmission can
produce.
*/

mod endpoint;
mod engine;
mod ud;
mod vc;

pub use endpoint::{IbudChannel, IbudEndpoint};
pub use vc::ChannelStats;
