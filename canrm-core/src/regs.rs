//! Register accessor: abstracts byte/word access to the SJA1000 register
//! file behind one contract, with two real backends (memory-mapped with a
//! configurable shift, and port I/O) plus a software loopback double used
//! by the unit tests in the other modules.

use std::sync::Mutex;

use core::ptr::NonNull;
use volatile::VolatilePtr;

/// Byte/word access to the controller's register file. Implementations
/// give no ordering guarantee beyond single-access volatility; the driver
/// serializes accesses itself where it matters.
pub trait RegisterAccess: Send + Sync {
    fn put_byte(&self, offset: u8, value: u8);
    fn get_byte(&self, offset: u8) -> u8;

    fn put_word(&self, offset: u8, value: u16) {
        self.put_byte(offset, (value & 0xff) as u8);
        self.put_byte(offset + 1, (value >> 8) as u8);
    }

    fn get_word(&self, offset: u8) -> u16 {
        let lo = self.get_byte(offset) as u16;
        let hi = self.get_byte(offset + 1) as u16;
        lo | (hi << 8)
    }
}

/// Memory-mapped backend: `base + (offset << shift)`, accessed as volatile
/// single-instruction byte operations. `shift` ranges 0..=8 and is
/// board-dependent (PEAK's mini-PCIe card maps each register on its own
/// 32-bit-aligned word).
pub struct MmioRegisters {
    base: *mut u8,
    shift: u8,
    // Keeps the mapping alive for the lifetime of the accessor.
    _mapping: memmap2::MmapMut,
}

// SAFETY: `base` points inside `_mapping`, which we own exclusively; every
// access goes through a freshly constructed `VolatilePtr`, which is sound
// for any thread holding a valid, live pointer.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Maps `len` bytes of `file` at `file_offset`, to be addressed with
    /// the given register `shift`. `file` is typically a PCI BAR resource
    /// file (e.g. `/sys/bus/pci/devices/.../resource0`) or `/dev/mem`;
    /// obtaining it is the chip-mapper collaborator's job, out of scope
    /// here.
    pub fn map(file: &std::fs::File, file_offset: u64, len: usize, shift: u8) -> std::io::Result<Self> {
        assert!(shift <= 8, "register shift out of range");
        let mut mapping = unsafe {
            memmap2::MmapOptions::new()
                .offset(file_offset)
                .len(len)
                .map_mut(file)?
        };
        let base = mapping.as_mut_ptr();
        Ok(MmioRegisters { base, shift, _mapping: mapping })
    }

    fn ptr(&self, offset: u8) -> VolatilePtr<'_, u8> {
        // SAFETY: caller-supplied offsets stay within the mapped region;
        // the register file is small and `len` covers it.
        unsafe {
            let addr = self.base.add((offset as usize) << self.shift);
            VolatilePtr::new(NonNull::new(addr).expect("mapped register address is never null"))
        }
    }
}

impl RegisterAccess for MmioRegisters {
    fn put_byte(&self, offset: u8, value: u8) {
        self.ptr(offset).write(value);
    }

    fn get_byte(&self, offset: u8) -> u8 {
        self.ptr(offset).read()
    }
}

/// Port I/O backend, for boards that expose the SJA1000 through an x86
/// I/O port range instead of a memory window.
#[cfg(target_arch = "x86_64")]
pub struct PortRegisters {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortRegisters {
    /// # Safety
    /// The caller must hold I/O privilege for `base..base+0x20` (e.g. via
    /// `iopl`/`ioperm`); acquiring that privilege is out of scope here.
    pub unsafe fn new(base: u16) -> Self {
        PortRegisters { base }
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterAccess for PortRegisters {
    fn put_byte(&self, offset: u8, value: u8) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.base + offset as u16);
        unsafe { port.write(value) };
    }

    fn get_byte(&self, offset: u8) -> u8 {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.base + offset as u16);
        unsafe { port.read() }
    }
}

/// In-memory register file standing in for real hardware in tests. Emits
/// the handful of behaviors the driver's probe/init/ISR paths rely on
/// (reset-mode readback of `BTR0`, nothing beyond that) so the higher-level
/// logic can be exercised without real SJA1000 silicon.
pub struct LoopbackRegisters {
    inner: Mutex<[u8; 256]>,
}

impl Default for LoopbackRegisters {
    fn default() -> Self {
        LoopbackRegisters { inner: Mutex::new([0; 256]) }
    }
}

impl LoopbackRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: directly inspect a register's current value.
    pub fn peek(&self, offset: u8) -> u8 {
        self.inner.lock().unwrap()[offset as usize]
    }

    /// Test hook: directly set a register's current value.
    pub fn poke(&self, offset: u8, value: u8) {
        self.inner.lock().unwrap()[offset as usize] = value;
    }
}

impl RegisterAccess for LoopbackRegisters {
    fn put_byte(&self, offset: u8, value: u8) {
        self.inner.lock().unwrap()[offset as usize] = value;
    }

    fn get_byte(&self, offset: u8) -> u8 {
        self.inner.lock().unwrap()[offset as usize]
    }
}

/// SJA1000 PeliCAN-mode register offsets.
pub mod offset {
    pub const MODE: u8 = 0x00;
    pub const COMMAND: u8 = 0x01;
    pub const STATUS: u8 = 0x02;
    pub const INTERRUPT: u8 = 0x03;
    pub const INTERRUPT_ENABLE: u8 = 0x04;
    pub const BUS_TIMING_0: u8 = 0x06;
    pub const BUS_TIMING_1: u8 = 0x07;
    pub const OUTPUT_CONTROL: u8 = 0x08;
    pub const ARBITRATION_LOST_CAPTURE: u8 = 0x0b;
    pub const ERROR_CODE_CAPTURE: u8 = 0x0c;
    pub const ERROR_WARNING_LIMIT: u8 = 0x0d;
    pub const RX_ERROR_COUNTER: u8 = 0x0e;
    pub const TX_ERROR_COUNTER: u8 = 0x0f;
    /// 13-byte RX/TX data window: frame-info, up to 4 ID bytes, up to 8
    /// data bytes.
    pub const RX_TX_WINDOW: u8 = 0x10;
    /// Aliases [`RX_TX_WINDOW`] while the controller is in reset mode.
    pub const ACCEPTANCE_CODE: u8 = 0x10;
    /// Aliases [`RX_TX_WINDOW`] + 4 while the controller is in reset mode.
    pub const ACCEPTANCE_MASK: u8 = 0x14;
    pub const RX_MESSAGE_COUNTER: u8 = 0x1d;
    pub const CLOCK_DIVIDER: u8 = 0x1f;
}

/// Mode register bits.
pub mod mode {
    pub const RESET: u8 = 0x01;
    pub const SINGLE_ACCEPTANCE_FILTER: u8 = 0x08;
}

/// Command register bits.
pub mod command {
    pub const TRANSMISSION_REQUEST: u8 = 0x01;
    pub const ABORT_TRANSMISSION: u8 = 0x02;
    pub const RELEASE_RX_BUFFER: u8 = 0x04;
    pub const CLEAR_DATA_OVERRUN: u8 = 0x08;
}

/// Status register bits.
pub mod status {
    pub const RECEIVE_BUFFER_STATUS: u8 = 0x01;
    pub const DATA_OVERRUN: u8 = 0x02;
    pub const TRANSMIT_BUFFER_STATUS: u8 = 0x04;
}

/// Interrupt / interrupt-enable register bits.
pub mod interrupt {
    pub const RECEIVE: u8 = 0x01;
    pub const TRANSMIT: u8 = 0x02;
    pub const ERROR_WARNING: u8 = 0x04;
    pub const DATA_OVERRUN: u8 = 0x08;
    pub const WAKE_UP: u8 = 0x10;
    pub const ERROR_PASSIVE: u8 = 0x20;
    pub const ARBITRATION_LOST: u8 = 0x40;
    pub const BUS_ERROR: u8 = 0x80;

    /// Enable everything except arbitration-lost.
    pub const ENABLE_MASK: u8 = 0xBF;
    /// Low nibble the ISR loop spins on.
    pub const LOW_NIBBLE_MASK: u8 = 0x0f;
}

/// Output control value for the supported PEAK board.
pub const OUTPUT_CONTROL_VALUE: u8 = 0x1a;
/// Clock divider: PeliCAN mode, CAN input bypass, clock-off.
pub const CLOCK_DIVIDER_VALUE: u8 = 0xc8;
pub const ERROR_WARNING_LIMIT_VALUE: u8 = 96;
