//! Userspace driver core for the SJA1000 CAN controller on the PEAK PCAN
//! mini-PCIe card: register access, the interrupt-driven RX/TX path, the
//! broadcast receive ring, and the device-node protocol state machine that
//! multiplexes it among unrelated client processes.
//!
//! This crate has no opinion on process lifecycle, CLI parsing, or
//! transport framing — see `canrm-daemon` for the binary that wires a real
//! register mapping and a Unix-domain socket around it.

pub mod client;
pub mod error;
pub mod frame;
pub mod interrupt;
pub mod protocol;
pub mod regs;
pub mod ring;
pub mod scheduler;
pub mod sja1000;
pub mod wire;

pub use client::{ClientId, ClientState, DelayedEntry, ReplyToken};
pub use error::{CanrmError, ProtocolStatus, Result};
pub use frame::{CanFrame, CanIdFlags, Filter, FilterWire, EFF_MASK, FILTER_WIRE_SIZE, FRAME_WIRE_SIZE, SFF_MASK};
pub use interrupt::{ChannelInterruptSource, InterruptSource, Pulse, UioInterruptSource};
pub use protocol::{run_broadcast_feeder, Node, ServerMessage};
pub use regs::{LoopbackRegisters, MmioRegisters, RegisterAccess};
pub use ring::ReceiveRing;
pub use sja1000::{isr_loop, BaudRate, Sja1000Driver};
