//! Echo server over a Linux TAP device.
//!
//! Each worker owns its own [`netstack::Stack`] and its own handle onto the TAP device (opened
//! multiqueue, one file descriptor per worker), pinned to a distinct core starting at
//! `--start-core`, mirroring the one-stack-per-dataplane-core shape the rest of this crate is
//! built around.

mod config;
mod tap;

use std::io;
use std::sync::Arc;

use log::{debug, info, warn};

use netstack::layer::tcp::{ConnHandlers, FourTuple};
use netstack::{PhysicalAdapter, Stack};

use config::Config;
use tap::TapDevice;

fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Runs one worker's stack forever. Never returns under normal operation; errors opening the TAP
/// device or pinning the core are the only way out.
fn run_worker(config: Arc<Config>, core: usize) -> io::Result<()> {
    pin_to_core(core)?;

    let mut tap = TapDevice::open(&config.tap, netstack::wire::ethernet::Address([0x02, 0, 0, 0, 0, core as u8]))?;
    let mut stack = Stack::new(tap.addr(), config.addr, tap.max_packet_size());

    for entry in &config.static_arp {
        stack.add_static_arp_entry(entry.proto_addr, entry.hw_addr);
    }

    let pending_replies = std::rc::Rc::new(std::cell::RefCell::new(std::collections::VecDeque::<(FourTuple, Vec<u8>)>::new()));
    let pending_closes = std::rc::Rc::new(std::cell::RefCell::new(std::collections::VecDeque::<FourTuple>::new()));

    let port = config.port;
    {
        let pending_replies = pending_replies.clone();
        let pending_closes = pending_closes.clone();
        stack.listen(port, 16, move |conn| {
            info!("new connection from {}:{} on port {}", conn.remote_addr, conn.remote_port, conn.local_port);

            let replies = pending_replies.clone();
            let closes = pending_closes.clone();

            ConnHandlers {
                new_data: Box::new(move |data: &[u8]| {
                    debug!("received {} bytes on {}:{}", data.len(), conn.remote_addr, conn.remote_port);
                    replies.borrow_mut().push_back((conn, data.to_vec()));
                }),
                remote_close: Box::new(move || {
                    closes.borrow_mut().push_back(conn);
                }),
                closed: Box::new(move || {
                    debug!("connection {}:{} fully closed", conn.remote_addr, conn.remote_port);
                }),
                reset: Box::new(move || {
                    warn!("connection {}:{} reset", conn.remote_addr, conn.remote_port);
                }),
            }
        });
    }

    info!(
        "echo server listening on {}:{} via {} (core {})",
        config.addr, port, config.tap, core
    );

    loop {
        stack.run_once(&mut tap);

        while let Some((conn, data)) = pending_replies.borrow_mut().pop_front() {
            if let Err(err) = stack.send(conn, data, || {}) {
                warn!("failed to echo to {}:{}: {}", conn.remote_addr, conn.remote_port, err);
            }
        }

        while let Some(conn) = pending_closes.borrow_mut().pop_front() {
            if let Err(err) = stack.close(conn) {
                warn!("failed to close {}:{}: {}", conn.remote_addr, conn.remote_port, err);
            }
        }
    }
}

fn main() {
    env_logger::init();

    let config = Arc::new(Config::from_args());
    let workers = config.workers.max(1);

    let mut handles = Vec::with_capacity(workers.saturating_sub(1));
    for i in 1..workers {
        let config = config.clone();
        let core = config.start_core + i;
        handles.push(std::thread::spawn(move || {
            if let Err(err) = run_worker(config, core) {
                eprintln!("worker on core {} failed: {}", core, err);
                std::process::exit(1);
            }
        }));
    }

    if let Err(err) = run_worker(config.clone(), config.start_core) {
        eprintln!("worker on core {} failed: {}", config.start_core, err);
        std::process::exit(1);
    }

    for handle in handles {
        let _ = handle.join();
    }
}
