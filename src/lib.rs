//! Reliable, in-order byte-stream channels over InfiniBand UD queue
//! pairs.
//!
//! UD gives you datagrams with no delivery, ordering, or duplicate
//! suppression. This crate rebuilds all three above it: each peer pair
//! shares a virtual connection with a sliding send window, an
//! out-of-order reassembly window, piggy-backed and explicit ACKs, and
//! a timer thread that retransmits anything the peer has not
//! acknowledged. It is built for control-plane traffic between a small
//! number of long-lived peers, where full RC state per peer would be
//! too heavy.
//!
//! The hardware seam is the [`UdTransport`] trait; [`sim::SimFabric`]
//! implements it in-process with configurable packet loss, duplication,
//! and reordering.
//!
//! ```no_run
//! use udstream::{Config, Endpoint};
//! use udstream::sim::SimFabric;
//!
//! let fabric = SimFabric::new(1);
//! let server = Endpoint::open_ibud(Box::new(fabric.endpoint()), Config::default())?;
//! let client = Endpoint::open_ibud(Box::new(fabric.endpoint()), Config::default())?;
//!
//! let name = server.name().to_string();
//! let handle = std::thread::spawn(move || {
//!     let ch = server.accept().unwrap();
//!     let mut buf = [0u8; 5];
//!     ch.read(&mut buf).unwrap();
//!     buf
//! });
//!
//! let ch = client.connect(&name)?;
//! ch.write(b"hello")?;
//! assert_eq!(&handle.join().unwrap(), b"hello");
//! # Ok::<(), udstream::Error>(())
//! ```

mod config;
mod err;
mod ibud;
pub mod sim;
pub mod transport;
pub mod wire;

mod vbuf;

pub use config::Config;
pub use err::{Error, Result};
pub use ibud::{ChannelStats, IbudChannel, IbudEndpoint};
pub use transport::{Ah, UdAddr, UdTransport, WorkCompletion};

/// An endpoint others may connect to, tagged by transport type.
pub enum Endpoint {
    /// Placeholder endpoint; every operation fails.
    Null,
    /// Reserved for a socket transport living outside this crate.
    Tcp,
    Ibud(IbudEndpoint),
}

impl Endpoint {
    /// Open an IBUD endpoint over `transport`.
    pub fn open_ibud(transport: Box<dyn UdTransport>, cfg: Config) -> Result<Self> {
        Ok(Endpoint::Ibud(IbudEndpoint::open(transport, cfg)?))
    }

    pub fn name(&self) -> &str {
        match self {
            Endpoint::Null => "NULL",
            Endpoint::Tcp => "TCP",
            Endpoint::Ibud(ep) => ep.name(),
        }
    }

    /// Connect to a named endpoint. The name selects the transport:
    /// only `IBUD:` names are served in-tree.
    pub fn connect(&self, name: &str) -> Result<Channel> {
        match self {
            Endpoint::Ibud(ep) if name.starts_with("IBUD:") => {
                Ok(Channel::Ibud(ep.connect(name)?))
            }
            Endpoint::Ibud(_) => Err(Error::MalformedName(name.to_string())),
            _ => Err(Error::Unsupported),
        }
    }

    /// Block until a peer connects.
    pub fn accept(&self) -> Result<Channel> {
        match self {
            Endpoint::Ibud(ep) => Ok(Channel::Ibud(ep.accept()?)),
            _ => Err(Error::Unsupported),
        }
    }
}

/// An open reliable channel between two endpoints.
pub enum Channel {
    Null,
    Tcp,
    Ibud(IbudChannel),
}

impl Channel {
    pub fn name(&self) -> &str {
        match self {
            Channel::Null => "NULL",
            Channel::Tcp => "TCP",
            Channel::Ibud(ch) => ch.name(),
        }
    }

    /// Queue all of `buf` on the channel.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        match self {
            Channel::Ibud(ch) => ch.write(buf),
            _ => Err(Error::Unsupported),
        }
    }

    /// Fill all of `buf` from the channel, blocking as needed.
    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        match self {
            Channel::Ibud(ch) => ch.read(buf),
            _ => Err(Error::Unsupported),
        }
    }

    pub fn disconnect(&self) -> Result<()> {
        match self {
            Channel::Ibud(ch) => ch.disconnect(),
            _ => Err(Error::Unsupported),
        }
    }

    pub fn stats(&self) -> Result<ChannelStats> {
        match self {
            Channel::Ibud(ch) => Ok(ch.stats()),
            _ => Err(Error::Unsupported),
        }
    }
}
