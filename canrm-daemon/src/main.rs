//! Userspace resource manager for an SJA1000 CAN controller: wires a
//! concrete register backend and interrupt source around `canrm-core`,
//! registers the device node, and runs until a shutdown signal arrives.

mod backend;
mod cli;
mod daemonize;
mod dispatch;
mod priority;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use canrm_core::{BaudRate, Node, Sja1000Driver, UioInterruptSource};

/// Threads given the "elevated priority (30)" treatment for the RX/error
/// path: the ISR, the deferred-processing thread, and the broadcast feeder.
const ELEVATED_PRIORITY: i32 = 30;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = cli::Cli::parse();
    log::info!("canrm-daemon {} starting", env!("CARGO_PKG_VERSION"));

    if let Some(dir) = &cli.chdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("changing working directory to {}", dir.display()))?;
    }

    let baud = BaudRate::from_kbps(cli.baud_kbps)
        .with_context(|| format!("{} kbit/s is not one of the supported SJA1000 bit rates", cli.baud_kbps))?;

    let regs = backend::build(&cli)?;

    let (driver, pulses) = Sja1000Driver::new(regs, baud);
    driver.probe().context("probing the SJA1000 controller")?;
    driver.initialize().context("initializing the SJA1000 controller")?;
    let driver = Arc::new(driver);

    let node = Node::new(driver.clone(), cli.ring_k).context("constructing the protocol node")?;
    let node = Arc::new(node);

    if cli.after {
        log::info!("-a given: accepted for compatibility, no mount-order analogue under a plain Unix socket");
    }
    if cli.before {
        log::info!("-b given: accepted for compatibility, no mount-order analogue under a plain Unix socket");
    }

    let device_path = cli.device_path();
    let listener = dispatch::bind(&device_path)
        .with_context(|| format!("binding the device node at {}", device_path.display()))?;
    let _socket_guard = dispatch::SocketGuard::new(device_path.clone());

    if !cli.test_mode {
        daemonize::daemonize().context("daemonizing")?;
    }
    shutdown::install();

    log::info!("registered as {}", device_path.display());

    let (uio_shutdown_tx, uio_shutdown_rx) = crossbeam_channel::bounded(1);
    let interrupt_source = UioInterruptSource::open(&cli.uio_path, uio_shutdown_rx)
        .with_context(|| format!("opening UIO interrupt source {}", cli.uio_path.display()))?;

    let deferred_driver = driver.clone();
    let deferred_handle = std::thread::spawn(move || {
        priority::elevate_current_thread(ELEVATED_PRIORITY);
        deferred_driver.run_deferred(pulses);
    });

    let feeder_driver = driver.clone();
    let feeder_node = node.clone();
    let feeder_handle = std::thread::spawn(move || {
        priority::elevate_current_thread(ELEVATED_PRIORITY);
        canrm_core::run_broadcast_feeder(feeder_driver, feeder_node);
    });

    let isr_driver = driver.clone();
    let isr_handle = std::thread::spawn(move || {
        priority::elevate_current_thread(ELEVATED_PRIORITY);
        let mut source = interrupt_source;
        canrm_core::isr_loop(&isr_driver, &mut source);
    });

    dispatch::accept_loop(&listener, node, shutdown::requested);

    log::info!("shutdown requested, draining worker threads");
    driver.shutdown();
    let _ = uio_shutdown_tx.send(canrm_core::Pulse::Terminate);
    let _ = isr_handle.join();
    let _ = deferred_handle.join();
    // The broadcast feeder only returns once `read_message` sees the driver
    // uninitialized, which `driver.shutdown()` above already guaranteed.
    let _ = feeder_handle.join();

    // Give the accept loop's already-spawned connection threads a moment to
    // notice their sends failing and exit before the process does.
    std::thread::sleep(Duration::from_millis(50));

    log::info!("stopped");
    Ok(())
}
