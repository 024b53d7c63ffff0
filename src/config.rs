use std::env;
use std::fmt::Debug;
use std::str::FromStr;

use crate::wire::HEADER_LEN;
use crate::{Error, Result};

/// Engine tunables. Every field can be overridden from the environment
/// (`UDSTREAM_*`, microseconds for the timeout fields); malformed values
/// fall back to the default with a warning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of one UD datagram buffer, header included.
    pub ud_mtu: usize,
    /// Maximum send work requests outstanding on the UD QP.
    pub max_ud_send_wqe: usize,
    /// Receive work requests kept posted on the UD QP.
    pub max_ud_recv_wqe: usize,
    /// Per-VC bound on packets sent but not yet acknowledged.
    pub sendwin_size: usize,
    /// Per-VC bound on buffered out-of-order packets.
    pub recvwin_size: u16,
    /// Received-packet count that forces an immediate explicit ACK.
    pub max_ack_pending: u16,
    /// Progress thread wakeup interval.
    pub progress_timeout_us: u64,
    /// Age at which an unacknowledged packet is resent.
    pub retry_timeout_us: u64,
    /// Age at which an unacknowledged packet declares the peer dead.
    pub max_retry_timeout_us: u64,
    /// Buffers allocated per pool growth step.
    pub vbuf_pool_chunk: usize,
    /// Optional cap on total pool size; `None` grows without bound.
    pub vbuf_max: Option<usize>,
    /// Abort the process on fatal errors. When false the engine records
    /// the failure and every later operation returns it.
    pub fail_fast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ud_mtu: 2048,
            max_ud_send_wqe: 2048,
            max_ud_recv_wqe: 4096,
            sendwin_size: 400,
            recvwin_size: 2501,
            max_ack_pending: 100,
            progress_timeout_us: 25_000,
            retry_timeout_us: 50_000,
            max_retry_timeout_us: 20_000_000,
            vbuf_pool_chunk: 512,
            vbuf_max: None,
            fail_fast: true,
        }
    }
}

fn env_parse<T: FromStr + Debug>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("ignoring unparsable {key}={val:?}, using {default:?}");
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let mut cfg = Config {
            ud_mtu: env_parse("UDSTREAM_UD_MTU", defaults.ud_mtu),
            max_ud_send_wqe: env_parse("UDSTREAM_MAX_UD_SEND_WQE", defaults.max_ud_send_wqe),
            max_ud_recv_wqe: env_parse("UDSTREAM_MAX_UD_RECV_WQE", defaults.max_ud_recv_wqe),
            sendwin_size: env_parse("UDSTREAM_SENDWIN_SIZE", defaults.sendwin_size),
            recvwin_size: env_parse("UDSTREAM_RECVWIN_SIZE", defaults.recvwin_size),
            max_ack_pending: 0,
            progress_timeout_us: env_parse(
                "UDSTREAM_PROGRESS_TIMEOUT",
                defaults.progress_timeout_us,
            ),
            retry_timeout_us: env_parse("UDSTREAM_RETRY_TIMEOUT", defaults.retry_timeout_us),
            max_retry_timeout_us: env_parse(
                "UDSTREAM_MAX_RETRY_TIMEOUT",
                defaults.max_retry_timeout_us,
            ),
            vbuf_pool_chunk: env_parse("UDSTREAM_VBUF_POOL_CHUNK", defaults.vbuf_pool_chunk),
            vbuf_max: None,
            fail_fast: defaults.fail_fast,
        };

        // ack threshold follows the send window unless pinned explicitly
        cfg.max_ack_pending =
            env_parse("UDSTREAM_MAX_ACK_PENDING", (cfg.sendwin_size / 4).max(1) as u16);

        if let Ok(val) = env::var("UDSTREAM_VBUF_MAX") {
            match val.parse() {
                Ok(n) => cfg.vbuf_max = Some(n),
                Err(_) => log::warn!("ignoring unparsable UDSTREAM_VBUF_MAX={val:?}"),
            }
        }

        cfg
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ud_mtu <= HEADER_LEN {
            return Err(Error::Config(format!(
                "ud_mtu {} leaves no room for a payload",
                self.ud_mtu
            )));
        }
        if self.sendwin_size == 0 || self.max_ud_send_wqe == 0 || self.max_ud_recv_wqe == 0 {
            return Err(Error::Config("window and queue sizes must be nonzero".into()));
        }
        Ok(())
    }

    /// Largest payload that fits one datagram after the packet header.
    pub fn max_payload(&self) -> usize {
        self.ud_mtu - HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let cfg = Config::default();
        assert_eq!(cfg.ud_mtu, 2048);
        assert_eq!(cfg.sendwin_size, 400);
        assert_eq!(cfg.max_ack_pending as usize, cfg.sendwin_size / 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_override_recomputes_ack_threshold() {
        env::set_var("UDSTREAM_SENDWIN_SIZE", "8");
        let cfg = Config::from_env();
        env::remove_var("UDSTREAM_SENDWIN_SIZE");

        assert_eq!(cfg.sendwin_size, 8);
        assert_eq!(cfg.max_ack_pending, 2);
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        let cfg = Config {
            ud_mtu: 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
