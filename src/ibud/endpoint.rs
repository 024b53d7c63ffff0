use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::config::Config;
use crate::transport::{UdAddr, UdTransport};
use crate::wire::PacketType;
use crate::{Error, Result};

use super::engine::Engine;
use super::vc::ChannelStats;

/// How long a blocked reader or acceptor sleeps with the comm lock
/// dropped before polling again.
const POLL_SLEEP: Duration = Duration::from_micros(200);

/// An opened IBUD endpoint: one UD queue pair, one progress thread, and
/// the engine state both threads share under the comm lock.
pub struct IbudEndpoint {
    name: String,
    engine: Arc<Mutex<Engine>>,
    shutdown: Arc<AtomicBool>,
    progress: Option<thread::JoinHandle<()>>,
}

/// One reliable byte-stream channel to a remote peer.
pub struct IbudChannel {
    name: String,
    vci: usize,
    engine: Arc<Mutex<Engine>>,
}

impl IbudEndpoint {
    /// Bring up the engine on `transport` and start the progress thread.
    pub fn open(transport: Box<dyn UdTransport>, cfg: Config) -> Result<Self> {
        raise_memlock_limit()?;

        let interval = Duration::from_micros(cfg.progress_timeout_us);
        let engine = Arc::new(Mutex::new(Engine::new(transport, cfg)?));
        let name = engine.lock().unwrap().local.endpoint_name();

        let shutdown = Arc::new(AtomicBool::new(false));
        let progress = {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("udstream-progress".into())
                .spawn(move || progress_loop(engine, shutdown, interval))
                .map_err(|e| Error::Transport(format!("failed to spawn progress thread: {e}")))?
        };

        Ok(IbudEndpoint {
            name,
            engine,
            shutdown,
            progress: Some(progress),
        })
    }

    /// Local name in `IBUD:<lid>:<qpn>` form; hand it to the peer for
    /// `connect`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a channel to the endpoint named `name`. Blocks until the
    /// peer accepts.
    pub fn connect(&self, name: &str) -> Result<IbudChannel> {
        let remote = UdAddr::parse_endpoint_name(name)
            .ok_or_else(|| Error::MalformedName(name.to_string()))?;

        let vci = {
            let mut eng = self.engine.lock().unwrap();
            eng.check_dead()?;
            eng.start_connect(remote)?
        };

        // first packet delivered on the new VC is the ACCEPT
        let payload = self.wait_packet(vci)?;
        {
            let mut eng = self.engine.lock().unwrap();
            eng.finish_connect(vci, &payload)?;
        }

        log::debug!("connected to {}", remote.endpoint_name());
        Ok(IbudChannel {
            name: remote.endpoint_name(),
            vci,
            engine: self.engine.clone(),
        })
    }

    /// Block until a non-duplicate CONNECT arrives and answer it.
    pub fn accept(&self) -> Result<IbudChannel> {
        loop {
            let accepted = {
                let mut eng = self.engine.lock().unwrap();
                eng.check_dead()?;
                eng.drain_cq()?;
                eng.try_accept()?
            };
            if let Some(vci) = accepted {
                let name = {
                    let eng = self.engine.lock().unwrap();
                    let remote = eng.vcs[vci].remote.expect("accepted vc has an address");
                    remote.endpoint_name()
                };
                log::debug!("accepted connection from {name}");
                return Ok(IbudChannel {
                    name,
                    vci,
                    engine: self.engine.clone(),
                });
            }
            thread::sleep(POLL_SLEEP);
        }
    }

    /// Wait for a whole packet on `vci`, draining the completion queue
    /// while the lock is held and sleeping with it dropped.
    fn wait_packet(&self, vci: usize) -> Result<Vec<u8>> {
        loop {
            {
                let mut eng = self.engine.lock().unwrap();
                eng.check_dead()?;
                eng.drain_cq()?;
                if let Some(payload) = eng.pop_app_packet(vci) {
                    return Ok(payload);
                }
            }
            thread::sleep(POLL_SLEEP);
        }
    }
}

impl Drop for IbudEndpoint {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.progress.take() {
            let _ = handle.join();
        }
    }
}

impl IbudChannel {
    /// Remote peer in `IBUD:<lid>:<qpn>` form.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `buf` for transmission, packetized to the datagram payload
    /// size. Returns once everything is queued; delivery is the
    /// engine's problem from here.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        let mut eng = self.engine.lock().unwrap();
        eng.check_dead()?;
        if eng.vcs[self.vci].local_closed {
            return Err(Error::Closed);
        }
        let max_payload = eng.cfg.max_payload();
        for chunk in buf.chunks(max_payload) {
            eng.vc_send(self.vci, PacketType::Data, chunk)?;
        }
        Ok(())
    }

    /// Fill `buf` completely from the in-order stream, blocking as
    /// needed. A packet larger than the remaining space stays at the
    /// head with a cursor for the next read.
    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        let mut nread = 0;
        while nread < buf.len() {
            {
                let mut eng = self.engine.lock().unwrap();
                eng.check_dead()?;
                eng.drain_cq()?;
                let n = eng.read_available(self.vci, &mut buf[nread..]);
                nread += n;
                if nread == buf.len() {
                    break;
                }
                if n == 0 && eng.vcs[self.vci].remote_closed && eng.app_window_empty(self.vci) {
                    return Err(Error::Closed);
                }
            }
            thread::sleep(POLL_SLEEP);
        }
        Ok(())
    }

    /// Send a reliable DISCONNECT and refuse further writes. The VC
    /// itself is retained.
    pub fn disconnect(&self) -> Result<()> {
        let mut eng = self.engine.lock().unwrap();
        eng.check_dead()?;
        if eng.vcs[self.vci].local_closed {
            return Ok(());
        }
        eng.vc_send(self.vci, PacketType::Disconnect, &[])?;
        eng.vcs[self.vci].local_closed = true;
        Ok(())
    }

    pub fn stats(&self) -> ChannelStats {
        self.engine.lock().unwrap().vcs[self.vci].stats()
    }
}

/// The progress thread: wake on a fixed interval, push out owed ACKs,
/// drain the completion queue, and retransmit anything that timed out.
fn progress_loop(engine: Arc<Mutex<Engine>>, shutdown: Arc<AtomicBool>, interval: Duration) {
    while !shutdown.load(Ordering::Acquire) {
        thread::sleep(interval);
        let mut eng = engine.lock().unwrap();
        if eng.check_dead().is_err() {
            break;
        }
        let ticked =
            eng.send_acks().is_ok() && eng.drain_cq().is_ok() && eng.check_resend().is_ok();
        if !ticked {
            // fatal already recorded; callers see it on their next op
            break;
        }
    }
}

/// UD buffers are registered memory; raise the locked-memory limit to
/// whatever the hard limit allows before allocating any.
fn raise_memlock_limit() -> Result<()> {
    let (_soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK)?;
    setrlimit(Resource::RLIMIT_MEMLOCK, hard, hard)?;
    Ok(())
}
