//! The SJA1000 controller driver: reset, baud-rate programming, the
//! interrupt-driven RX/TX path, and error capture.
//!
//! Three pipeline stages are kept deliberately separate rather than
//! collapsed into one: the interrupt-attached [`isr_loop`] drains the
//! controller and never blocks; the [`Sja1000Driver::run_deferred`] thread
//! wakes on its pulses to log decoded errors and kick a pending transmit;
//! and [`Sja1000Driver::read_message`] is the blocking consumer API the
//! broadcast feeder polls to fill the shared receive ring.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::{CanrmError, Result};
use crate::frame::{CanFrame, CanIdFlags, EFF_MASK};
use crate::interrupt::{InterruptSource, Pulse};
use crate::regs::{command, interrupt, mode, offset, RegisterAccess};
use crate::regs::{CLOCK_DIVIDER_VALUE, ERROR_WARNING_LIMIT_VALUE, OUTPUT_CONTROL_VALUE};

/// One of the nine bus speeds the SJA1000 bit-timing registers support.
/// Any other requested rate is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    R1M,
    R800K,
    R500K,
    R250K,
    R125K,
    R100K,
    R50K,
    R20K,
    R10K,
}

impl BaudRate {
    /// Accepts the nine supported rates expressed in kbit/s; anything else
    /// is `None`, which the caller should turn into `CanrmError::Configuration`.
    pub fn from_kbps(kbps: u32) -> Option<Self> {
        Some(match kbps {
            1000 => Self::R1M,
            800 => Self::R800K,
            500 => Self::R500K,
            250 => Self::R250K,
            125 => Self::R125K,
            100 => Self::R100K,
            50 => Self::R50K,
            20 => Self::R20K,
            10 => Self::R10K,
            _ => return None,
        })
    }

    fn btr(self) -> (u8, u8) {
        match self {
            Self::R1M => (0x00, 0x14),
            Self::R800K => (0x40, 0x25),
            Self::R500K => (0x80, 0x58),
            Self::R250K => (0x81, 0x58),
            Self::R125K => (0x83, 0x58),
            Self::R100K => (0x84, 0x58),
            Self::R50K => (0xC7, 0x7A),
            Self::R20K => (0x67, 0x25),
            Self::R10K => (0xE7, 0x7A),
        }
    }
}

const RX_RING_CAPACITY: usize = 1024;
const ERROR_RING_CAPACITY: usize = 1024;
const MAX_FRAMES_PER_ISR: usize = 8;
const PROBE_DEADLINE: Duration = Duration::from_millis(100);
const RESET_CLEAR_DEADLINE: Duration = Duration::from_secs(1);
const READ_WAIT: Duration = Duration::from_millis(2);
const DEFERRED_WAIT: Duration = Duration::from_millis(100);

/// Priority-queue entry for pending transmits: ordered by arbitration ID
/// with the lowest ID highest priority, so `BinaryHeap` (a max-heap) needs
/// its ordering inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTx(CanFrame);

impl PendingTx {
    fn key(&self) -> u32 {
        self.0.can_id & EFF_MASK
    }
}

impl PartialOrd for PendingTx {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTx {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key().cmp(&self.key())
    }
}

/// The single-producer/single-consumer receive ring between the ISR and
/// the deferred-processing thread. A short-held mutex stands in for the
/// lock-free ring of the original driver: an ISR critical section here is
/// a handful of instructions, and userspace offers no real interrupt
/// masking to make true lock-freedom meaningful.
struct RxRing {
    queue: Mutex<VecDeque<CanFrame>>,
    cond: Condvar,
}

impl RxRing {
    fn new() -> Self {
        RxRing { queue: Mutex::new(VecDeque::with_capacity(RX_RING_CAPACITY)), cond: Condvar::new() }
    }

    fn push(&self, frame: CanFrame) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() == RX_RING_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    fn pop(&self) -> Option<CanFrame> {
        self.queue.lock().unwrap().pop_front()
    }

    fn notify(&self) {
        self.cond.notify_all();
    }

    fn wait_for(&self, timeout: Duration) {
        let queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            let _ = self.cond.wait_timeout(queue, timeout).unwrap();
        }
    }
}

/// The SJA1000 driver: register probing/initialization, the interrupt
/// service routine, the deferred-processing thread, and the transmit path.
///
/// Generic over [`RegisterAccess`] so tests run against [`crate::regs::LoopbackRegisters`]
/// without real hardware.
pub struct Sja1000Driver<R> {
    regs: R,
    baud: BaudRate,
    inited: AtomicBool,
    /// Userspace analogue of the interrupt spinlock: guards every write to
    /// the command register so the ISR and the transmit path cannot race
    /// on it.
    cmd_lock: Mutex<()>,
    rx_ring: RxRing,
    error_ring: Mutex<VecDeque<u8>>,
    tx_queue: Mutex<BinaryHeap<PendingTx>>,
    tx_buffer_free: AtomicBool,
    deferred_pulse_tx: crossbeam_channel::Sender<Pulse>,
}

impl<R: RegisterAccess> Sja1000Driver<R> {
    /// Builds the driver and the pulse channel its deferred-processing
    /// thread will be started with. The caller is expected to call
    /// [`Self::probe`] then [`Self::initialize`] before handing the driver
    /// to the rest of the pipeline.
    pub fn new(regs: R, baud: BaudRate) -> (Self, Receiver<Pulse>) {
        let (tx, rx) = crate::interrupt::pulse_channel();
        let driver = Sja1000Driver {
            regs,
            baud,
            inited: AtomicBool::new(false),
            cmd_lock: Mutex::new(()),
            rx_ring: RxRing::new(),
            error_ring: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            tx_queue: Mutex::new(BinaryHeap::new()),
            tx_buffer_free: AtomicBool::new(true),
            deferred_pulse_tx: tx,
        };
        (driver, rx)
    }

    pub fn is_inited(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    /// Detects the chip: read-clear status/counters, enter reset mode, then
    /// require a `0x55`/`0xAA` signature round-trip through `BTR0`.
    pub fn probe(&self) -> Result<()> {
        self.regs.get_byte(offset::STATUS);
        self.regs.get_byte(offset::ARBITRATION_LOST_CAPTURE);
        self.regs.get_byte(offset::ERROR_CODE_CAPTURE);
        self.regs.get_byte(offset::RX_ERROR_COUNTER);
        self.regs.get_byte(offset::TX_ERROR_COUNTER);

        self.regs.put_byte(offset::MODE, mode::RESET);
        self.wait_for_mode_bit(mode::RESET, true, PROBE_DEADLINE)
            .map_err(|_| CanrmError::HardwareProbe("reset-mode timeout".into()))?;

        self.regs.put_byte(offset::BUS_TIMING_0, 0x55);
        let echoed = self.regs.get_byte(offset::BUS_TIMING_0);
        if echoed != 0x55 {
            return Err(CanrmError::HardwareProbe(format!("0x55 signature missing, got {echoed:#04x}")));
        }

        self.regs.put_byte(offset::BUS_TIMING_0, 0xAA);
        let echoed = self.regs.get_byte(offset::BUS_TIMING_0);
        if echoed != 0xAA {
            return Err(CanrmError::HardwareProbe(format!("0xAA signature missing, got {echoed:#04x}")));
        }

        Ok(())
    }

    /// Programs PeliCAN mode, the bit-timing registers for the configured
    /// baud rate, an accept-all acceptance filter, and the interrupt-enable
    /// mask, then leaves reset mode.
    pub fn initialize(&self) -> Result<()> {
        self.regs.put_byte(offset::CLOCK_DIVIDER, CLOCK_DIVIDER_VALUE);
        self.regs.put_byte(offset::MODE, mode::SINGLE_ACCEPTANCE_FILTER | mode::RESET);
        self.regs.put_byte(
            offset::COMMAND,
            command::ABORT_TRANSMISSION | command::CLEAR_DATA_OVERRUN | command::RELEASE_RX_BUFFER,
        );

        // Accept-all acceptance code/mask: the acceptance code and mask
        // registers alias the RX/TX window in reset mode, four bytes each.
        for i in 0..4 {
            self.regs.put_byte(offset::ACCEPTANCE_CODE + i, 0xFF);
            self.regs.put_byte(offset::ACCEPTANCE_MASK + i, 0xFF);
        }

        let (btr0, btr1) = self.baud.btr();
        self.regs.put_byte(offset::BUS_TIMING_0, btr0);
        self.regs.put_byte(offset::BUS_TIMING_1, btr1);

        self.regs.put_byte(offset::OUTPUT_CONTROL, OUTPUT_CONTROL_VALUE);

        self.regs.get_byte(offset::INTERRUPT); // clears pending interrupt bits
        self.regs.put_byte(offset::INTERRUPT_ENABLE, interrupt::ENABLE_MASK);
        self.regs.put_byte(offset::ERROR_WARNING_LIMIT, ERROR_WARNING_LIMIT_VALUE);
        self.regs.put_byte(offset::TX_ERROR_COUNTER, 0);
        self.regs.put_byte(offset::RX_ERROR_COUNTER, 0);

        let mode_reg = self.regs.get_byte(offset::MODE);
        self.regs.put_byte(offset::MODE, mode_reg & !mode::RESET);

        self.wait_for_mode_bit(mode::RESET, false, RESET_CLEAR_DEADLINE)
            .map_err(|_| CanrmError::HardwareProbe("reset mode failed to clear".into()))?;

        // Drain stale latches left over from the probe.
        self.regs.get_byte(offset::ARBITRATION_LOST_CAPTURE);
        self.regs.get_byte(offset::ERROR_CODE_CAPTURE);
        self.regs.get_byte(offset::RX_ERROR_COUNTER);
        self.regs.get_byte(offset::TX_ERROR_COUNTER);

        self.inited.store(true, Ordering::Release);
        log::info!("sja1000 controller initialized at {:?}", self.baud);
        Ok(())
    }

    fn wait_for_mode_bit(&self, bit: u8, want_set: bool, deadline: Duration) -> std::result::Result<(), ()> {
        let start = std::time::Instant::now();
        loop {
            let set = self.regs.get_byte(offset::MODE) & bit != 0;
            if set == want_set {
                return Ok(());
            }
            if start.elapsed() > deadline {
                return Err(());
            }
            std::thread::yield_now();
        }
    }

    /// Enqueues a frame for transmission, sending it immediately if the TX
    /// buffer is free and no other frame is already queued; otherwise the
    /// transmit priority queue (lowest arbitration ID first) holds it until
    /// the TX-complete interrupt frees the buffer.
    ///
    /// The free-buffer check and the clearing of `tx_buffer_free` happen
    /// under the same `tx_queue` lock acquisition as [`Self::kick_transmit`],
    /// so the two can never both observe the buffer free and both call
    /// `transmit_now` for the single controller TX buffer (invariant 5).
    pub fn write_message(&self, frame: CanFrame) {
        let mut queue = self.tx_queue.lock().unwrap();
        if queue.is_empty() && self.tx_buffer_free.load(Ordering::Acquire) {
            self.tx_buffer_free.store(false, Ordering::Release);
            self.transmit_now(&frame);
        } else {
            queue.push(PendingTx(frame));
        }
    }

    fn transmit_now(&self, frame: &CanFrame) {
        let _guard = self.cmd_lock.lock().unwrap();

        let flags = frame.flags();
        let is_eff = flags.contains(CanIdFlags::EFF);
        let frame_info = (if is_eff { 0x80 } else { 0 })
            | (if flags.contains(CanIdFlags::RTR) { 0x40 } else { 0 })
            | (frame.len & 0x0F);
        self.regs.put_byte(offset::RX_TX_WINDOW, frame_info);

        let data_offset = if is_eff {
            let arbitration = (frame.can_id & EFF_MASK) << 3;
            self.regs.put_byte(offset::RX_TX_WINDOW + 1, ((arbitration >> 24) & 0xFF) as u8);
            self.regs.put_byte(offset::RX_TX_WINDOW + 2, ((arbitration >> 16) & 0xFF) as u8);
            self.regs.put_byte(offset::RX_TX_WINDOW + 3, ((arbitration >> 8) & 0xFF) as u8);
            self.regs.put_byte(offset::RX_TX_WINDOW + 4, (arbitration & 0xFF) as u8);
            5
        } else {
            let arbitration = (frame.can_id & crate::frame::SFF_MASK) << 5;
            self.regs.put_byte(offset::RX_TX_WINDOW + 1, ((arbitration >> 8) & 0xFF) as u8);
            self.regs.put_byte(offset::RX_TX_WINDOW + 2, (arbitration & 0xFF) as u8);
            3
        };

        for i in 0..frame.len as usize {
            self.regs.put_byte(offset::RX_TX_WINDOW + data_offset + i as u8, frame.data[i]);
        }

        self.regs.put_byte(offset::COMMAND, command::TRANSMISSION_REQUEST);
        self.regs.get_byte(offset::STATUS);
    }

    /// Interrupt service routine: drains the interrupt register until it
    /// reads zero, servicing RX (up to 8 frames), TX-complete, and error
    /// conditions each iteration. Never blocks, never allocates on the
    /// steady-state path (the RX/error rings are pre-sized).
    pub fn service_interrupt(&self) {
        let mut serviced_anything = false;
        {
            let _guard = self.cmd_lock.lock().unwrap();
            loop {
                let ireg = self.regs.get_byte(offset::INTERRUPT);
                if ireg & interrupt::LOW_NIBBLE_MASK == 0 {
                    break;
                }
                serviced_anything = true;

                if ireg & interrupt::RECEIVE != 0 {
                    self.drain_receive();
                }
                if ireg & interrupt::TRANSMIT != 0 {
                    self.tx_buffer_free.store(true, Ordering::Release);
                }

                if is_error_interrupt(ireg) {
                    self.push_error(ireg);
                    if ireg & interrupt::DATA_OVERRUN != 0 {
                        self.regs
                            .put_byte(offset::COMMAND, command::CLEAR_DATA_OVERRUN | command::RELEASE_RX_BUFFER);
                    }
                }
            }
        }
        if serviced_anything {
            let _ = self.deferred_pulse_tx.send(Pulse::Interrupt);
        }
    }

    fn drain_receive(&self) {
        for _ in 0..MAX_FRAMES_PER_ISR {
            let info = self.regs.get_byte(offset::RX_TX_WINDOW);
            let len = info & 0x0F;
            let is_eff = info & 0x80 != 0;
            let is_rtr = info & 0x40 != 0;

            let (id, data_offset) = if is_eff {
                let b0 = self.regs.get_byte(offset::RX_TX_WINDOW + 1) as u32;
                let b1 = self.regs.get_byte(offset::RX_TX_WINDOW + 2) as u32;
                let b2 = self.regs.get_byte(offset::RX_TX_WINDOW + 3) as u32;
                let b3 = self.regs.get_byte(offset::RX_TX_WINDOW + 4) as u32;
                ((b0 << 21) | (b1 << 13) | (b2 << 5) | (b3 >> 3), 5u8)
            } else {
                let b0 = self.regs.get_byte(offset::RX_TX_WINDOW + 1) as u32;
                let b1 = self.regs.get_byte(offset::RX_TX_WINDOW + 2) as u32;
                ((b0 << 3) | (b1 >> 5), 3u8)
            };

            let mut flags = CanIdFlags::empty();
            if is_eff {
                flags |= CanIdFlags::EFF;
            }
            if is_rtr {
                flags |= CanIdFlags::RTR;
            }

            let mut data = [0u8; 8];
            for i in 0..len as usize {
                data[i] = self.regs.get_byte(offset::RX_TX_WINDOW + data_offset + i as u8);
            }

            self.rx_ring.push(CanFrame::new(id, flags, len, data));

            self.regs.put_byte(offset::COMMAND, command::RELEASE_RX_BUFFER);
            let status = self.regs.get_byte(offset::STATUS);
            if status & crate::regs::status::RECEIVE_BUFFER_STATUS == 0 {
                break;
            }
        }
        self.rx_ring.notify();
    }

    fn push_error(&self, ireg: u8) {
        let mut ring = self.error_ring.lock().unwrap();
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ireg);
    }

    /// Blocks in 2 ms waits until a frame is available or the driver has
    /// shut down. Returns `None` once [`Self::shutdown`] has run.
    pub fn read_message(&self) -> Option<CanFrame> {
        loop {
            if let Some(frame) = self.rx_ring.pop() {
                return Some(frame);
            }
            if !self.is_inited() {
                return None;
            }
            self.rx_ring.wait_for(READ_WAIT);
        }
    }

    /// The deferred-processing thread body: waits on the internal pulse
    /// channel (100 ms timeout so shutdown stays responsive on a silent
    /// bus), decodes and logs pending errors, and kicks a queued transmit
    /// when the TX buffer is free.
    pub fn run_deferred(&self, pulses: Receiver<Pulse>) {
        loop {
            match pulses.recv_timeout(DEFERRED_WAIT) {
                Ok(Pulse::Terminate) => {
                    log::info!("deferred-processing thread stopped");
                    return;
                }
                Ok(Pulse::Interrupt) | Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    self.log_errors();
                    self.kick_transmit();
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn log_errors(&self) {
        let pending: Vec<u8> = {
            let mut ring = self.error_ring.lock().unwrap();
            ring.drain(..).collect()
        };
        for ireg in pending {
            if ireg & interrupt::BUS_ERROR != 0 {
                let code = self.regs.get_byte(offset::ERROR_CODE_CAPTURE);
                log::warn!("{}", CanrmError::HardwareRuntime(format!("bus error: {}", decode_bus_error(code))));
            }
            if ireg & interrupt::ARBITRATION_LOST != 0 {
                let bit = self.regs.get_byte(offset::ARBITRATION_LOST_CAPTURE);
                log::warn!(
                    "{}",
                    CanrmError::HardwareRuntime(format!("arbitration lost at bit position {bit}"))
                );
            }
            if ireg & interrupt::ERROR_PASSIVE != 0 {
                log::warn!("{}", CanrmError::HardwareRuntime("error passive".to_string()));
            }
            if ireg & interrupt::WAKE_UP != 0 {
                log::warn!("{}", CanrmError::HardwareRuntime("wake-up".to_string()));
            }
            if ireg & interrupt::DATA_OVERRUN != 0 {
                log::warn!("{}", CanrmError::HardwareRuntime("data overrun".to_string()));
            }
            if ireg & interrupt::ERROR_WARNING != 0 {
                let warn_limit = self.regs.get_byte(offset::ERROR_WARNING_LIMIT);
                let rx_err = self.regs.get_byte(offset::RX_ERROR_COUNTER);
                let tx_err = self.regs.get_byte(offset::TX_ERROR_COUNTER);
                let rx_msgs = self.regs.get_byte(offset::RX_MESSAGE_COUNTER);
                log::warn!(
                    "{}",
                    CanrmError::HardwareRuntime(format!(
                        "error warning: limit={warn_limit} rx_errors={rx_err} tx_errors={tx_err} rx_messages={rx_msgs}"
                    ))
                );
            }
        }
    }

    fn kick_transmit(&self) {
        let mut queue = self.tx_queue.lock().unwrap();
        if !self.tx_buffer_free.load(Ordering::Acquire) {
            return;
        }
        if let Some(PendingTx(frame)) = queue.pop() {
            self.tx_buffer_free.store(false, Ordering::Release);
            self.transmit_now(&frame);
        }
    }

    /// Stops the controller (all modes off), marks the driver uninitialized
    /// so any blocked [`Self::read_message`] caller returns `None`, and
    /// sends `Terminate` to the deferred-processing thread.
    pub fn shutdown(&self) {
        self.regs.put_byte(offset::MODE, 0);
        self.inited.store(false, Ordering::Release);
        self.rx_ring.notify();
        let _ = self.deferred_pulse_tx.send(Pulse::Terminate);
    }
}

/// Whether an interrupt-register read carries one of the error conditions
/// `service_interrupt` pushes to the error ring: bus error, arbitration
/// lost, error passive, data overrun, wake-up, or a standalone error
/// warning (a prior revision of this mask omitted `ERROR_WARNING`, so that
/// condition was only ever recorded when it co-occurred with another bit).
fn is_error_interrupt(ireg: u8) -> bool {
    const ERROR_BITS: u8 = interrupt::BUS_ERROR
        | interrupt::ARBITRATION_LOST
        | interrupt::ERROR_PASSIVE
        | interrupt::DATA_OVERRUN
        | interrupt::WAKE_UP
        | interrupt::ERROR_WARNING;
    ireg & ERROR_BITS != 0
}

/// Decodes the error-code-capture register's error-type and bit-position
/// fields into the label table from the SJA1000 datasheet, returning a
/// populated label on every call (a prior revision of this routine built
/// the string but never returned it, so every logged bus-error line came
/// out empty).
fn decode_bus_error(code: u8) -> String {
    let kind = match code & 0xC0 {
        0x00 => "bit error in",
        0x40 => "form error in",
        0x80 => "stuff error in",
        _ => "other type of error in",
    };
    let position = match code & 0x1F {
        0x03 => "start of frame",
        0x02 => "ID.28 to ID.21",
        0x06 => "ID.20 to ID.18",
        0x04 => "bit SRTR",
        0x05 => "bit IDE",
        0x07 => "ID.17 to ID.13",
        0x0F => "ID.12 to ID.5",
        0x0E => "ID.4 to ID.0",
        0x0C => "bit RTR",
        0x0D => "reserved bit 1",
        0x09 => "reserved bit 0",
        0x0B => "data length code",
        0x0A => "data field",
        0x08 => "CRC sequence",
        0x18 => "CRC delimiter",
        0x19 => "acknowledge slot",
        0x1B => "acknowledge delimiter",
        0x1A => "end of frame",
        0x12 => "intermission",
        0x11 => "active error flag",
        0x16 => "passive error flag",
        0x13 => "tolerate dominant bits",
        0x17 => "error delimiter",
        0x1C => "overload flag",
        _ => "undefined position",
    };
    format!("{kind} {position}")
}

/// Runs the interrupt-attached context: waits on the hardware interrupt
/// source and services the controller on each pulse, until the source
/// reports shutdown.
pub fn isr_loop<R: RegisterAccess>(driver: &Sja1000Driver<R>, source: &mut dyn InterruptSource) {
    while source.wait() {
        driver.service_interrupt();
        source.ack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::LoopbackRegisters;

    fn probed_driver() -> Sja1000Driver<LoopbackRegisters> {
        let (driver, _pulses) = Sja1000Driver::new(LoopbackRegisters::new(), BaudRate::R125K);
        driver.probe().expect("probe should succeed against the loopback double");
        driver
    }

    #[test]
    fn baud_table_matches_datasheet_pairs() {
        assert_eq!(BaudRate::R1M.btr(), (0x00, 0x14));
        assert_eq!(BaudRate::R500K.btr(), (0x80, 0x58));
        assert_eq!(BaudRate::R10K.btr(), (0xE7, 0x7A));
    }

    #[test]
    fn unsupported_kbps_is_rejected() {
        assert!(BaudRate::from_kbps(333).is_none());
        assert_eq!(BaudRate::from_kbps(125), Some(BaudRate::R125K));
    }

    #[test]
    fn probe_succeeds_against_loopback_double() {
        let (driver, _pulses) = Sja1000Driver::new(LoopbackRegisters::new(), BaudRate::R125K);
        assert!(driver.probe().is_ok());
    }

    #[test]
    fn initialize_leaves_reset_mode_and_programs_baud() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        assert!(driver.is_inited());
        assert_eq!(driver.regs.get_byte(offset::BUS_TIMING_0), 0x83);
        assert_eq!(driver.regs.get_byte(offset::BUS_TIMING_1), 0x58);
        assert_eq!(driver.regs.get_byte(offset::MODE) & mode::RESET, 0);
    }

    #[test]
    fn sff_transmit_path_packs_eleven_bits_shifted_by_five() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        let frame = CanFrame::new(0x123, CanIdFlags::empty(), 2, [0xAA, 0xBB, 0, 0, 0, 0, 0, 0]);
        driver.write_message(frame);
        let arbitration = (0x123u32 & crate::frame::SFF_MASK) << 5;
        assert_eq!(driver.regs.get_byte(offset::RX_TX_WINDOW + 1), ((arbitration >> 8) & 0xFF) as u8);
        assert_eq!(driver.regs.get_byte(offset::RX_TX_WINDOW + 2), (arbitration & 0xFF) as u8);
        assert_eq!(driver.regs.get_byte(offset::RX_TX_WINDOW + 3), 0xAA);
    }

    #[test]
    fn eff_transmit_path_wins_over_sff_masking() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        let frame = CanFrame::new(0x12345678, CanIdFlags::EFF, 0, [0; 8]);
        driver.write_message(frame);
        let info = driver.regs.get_byte(offset::RX_TX_WINDOW);
        assert_eq!(info & 0x80, 0x80, "EFF branch must be taken when the flag is set");
    }

    #[test]
    fn write_queues_behind_an_occupied_tx_buffer() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        driver.tx_buffer_free.store(false, Ordering::Release);
        driver.write_message(CanFrame::new(0x500, CanIdFlags::empty(), 0, [0; 8]));
        assert_eq!(driver.tx_queue.lock().unwrap().len(), 1);
    }

    #[test]
    fn priority_dequeue_orders_by_lowest_arbitration_id() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        driver.tx_buffer_free.store(false, Ordering::Release);
        driver.write_message(CanFrame::new(0x500, CanIdFlags::empty(), 0, [0; 8]));
        driver.write_message(CanFrame::new(0x100, CanIdFlags::empty(), 0, [0; 8]));
        driver.write_message(CanFrame::new(0x300, CanIdFlags::empty(), 0, [0; 8]));

        let mut queue = driver.tx_queue.lock().unwrap();
        assert_eq!(queue.pop().unwrap().0.can_id, 0x100);
        assert_eq!(queue.pop().unwrap().0.can_id, 0x300);
        assert_eq!(queue.pop().unwrap().0.can_id, 0x500);
    }

    #[test]
    fn read_message_returns_none_once_shut_down() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        driver.shutdown();
        assert_eq!(driver.read_message(), None);
    }

    #[test]
    fn bus_error_label_is_actually_populated() {
        let label = decode_bus_error(0x03);
        assert_eq!(label, "bit error in start of frame");
        assert!(!label.is_empty());
    }

    #[test]
    fn standalone_error_warning_is_still_an_error_interrupt() {
        assert!(is_error_interrupt(interrupt::ERROR_WARNING));
    }

    #[test]
    fn standalone_error_warning_reaches_the_error_ring() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        driver.push_error(interrupt::ERROR_WARNING);
        let ring = driver.error_ring.lock().unwrap();
        assert_eq!(ring.back(), Some(&interrupt::ERROR_WARNING));
    }

    #[test]
    fn write_message_leaves_the_buffer_occupied_for_a_second_caller() {
        let driver = probed_driver();
        driver.initialize().unwrap();
        driver.write_message(CanFrame::new(0x100, CanIdFlags::empty(), 0, [0; 8]));
        assert!(!driver.tx_buffer_free.load(Ordering::Acquire));
        driver.write_message(CanFrame::new(0x200, CanIdFlags::empty(), 0, [0; 8]));
        assert_eq!(driver.tx_queue.lock().unwrap().len(), 1);
    }
}
