//! Two peers on a lossy in-process fabric playing ping-pong.
//!
//! The link drops five percent of all datagrams in both directions, so
//! a few rounds usually showcase the retransmit machinery; the final
//! stats line says how often it fired.

use std::thread;

use udstream::sim::{FaultProfile, SimFabric};
use udstream::{Config, Endpoint};

const ROUNDS: usize = 8;
const FRAME: usize = 32;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:5} {} {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Debug);

    let mut cfg = Config::from_env();
    // keep the demo snappy
    cfg.progress_timeout_us = 2_000;
    cfg.retry_timeout_us = 10_000;

    let fabric = SimFabric::new(0xc0ffee);
    let server = Endpoint::open_ibud(Box::new(fabric.endpoint()), cfg.clone())
        .expect("failed to open server endpoint");
    let client = Endpoint::open_ibud(Box::new(fabric.endpoint()), cfg)
        .expect("failed to open client endpoint");

    let server_addr = udstream::UdAddr::parse_endpoint_name(server.name()).unwrap();
    let client_addr = udstream::UdAddr::parse_endpoint_name(client.name()).unwrap();
    let lossy = FaultProfile {
        drop: 0.05,
        ..Default::default()
    };
    fabric.set_link(server_addr, client_addr, lossy.clone());
    fabric.set_link(client_addr, server_addr, lossy);

    let server_name = server.name().to_string();
    log::info!("server listening at {server_name}");

    let echo = thread::spawn(move || {
        let ch = server.accept().expect("accept failed");
        log::info!("server accepted {}", ch.name());
        for _ in 0..ROUNDS {
            let mut frame = [0u8; FRAME];
            ch.read(&mut frame).expect("server read failed");
            ch.write(&frame).expect("server write failed");
        }
    });

    let ch = client.connect(&server_name).expect("connect failed");
    log::info!("client connected to {}", ch.name());

    for round in 0..ROUNDS {
        let mut frame = [0u8; FRAME];
        let msg = format!("ping {round}");
        frame[..msg.len()].copy_from_slice(msg.as_bytes());

        ch.write(&frame).expect("client write failed");
        let mut echo_frame = [0u8; FRAME];
        ch.read(&mut echo_frame).expect("client read failed");
        assert_eq!(frame, echo_frame);

        let text = std::str::from_utf8(&echo_frame[..msg.len()]).unwrap();
        log::info!("round {round}: echoed {text:?}");
    }

    ch.disconnect().expect("disconnect failed");
    echo.join().expect("echo thread panicked");

    let stats = ch.stats().unwrap();
    let wire = fabric.stats();
    log::info!(
        "done: {} data datagrams on the wire, {} resends, {} explicit acks",
        wire.data,
        stats.resends,
        stats.explicit_acks
    );
}
