//! Error taxonomy for the CAN resource manager core.
//!
//! Mirrors the fault classes a CAN resource manager has to distinguish:
//! failures that abort startup, hardware conditions that are logged but
//! never surface to a client, and per-request protocol failures that stay
//! local to the offending client.

use thiserror::Error;

/// Fatal or advisory error raised by `canrm-core`.
#[derive(Debug, Error)]
pub enum CanrmError {
    /// Bad startup configuration: unsupported baud rate, oversized ring
    /// capacity, conflicting flags, or an invalid device path. Always
    /// aborts startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The SJA1000 did not respond as expected during reset-mode probing
    /// (signature readback mismatch or reset-mode timeout). Aborts startup.
    #[error("hardware probe failed: {0}")]
    HardwareProbe(String),

    /// A non-fatal bus condition decoded from the interrupt/error-capture
    /// registers: bus-off, error-passive, arbitration-lost, overrun,
    /// wake-up, or error-warning. Logged, never propagated to a client.
    #[error("hardware runtime condition: {0}")]
    HardwareRuntime(String),

    /// Dispatch or allocation failure severe enough that the driver cannot
    /// continue operating.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-request failure reported back to a single client. Distinct from
/// [`CanrmError`] because these never affect other clients or the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Request succeeded.
    Ok,
    /// Read/write payload was not exactly one frame (or filter record)
    /// sized, or otherwise malformed.
    InvalidArgument,
    /// Control code not implemented.
    NotSupported,
    /// Nonblocking read found nothing to deliver.
    WouldBlock,
    /// A parked request was completed by a close or an explicit unblock,
    /// not by a matching frame.
    Unblocked,
}

impl ProtocolStatus {
    /// Wire status code: 0 on success, a negative `errno`-style value
    /// otherwise, with `-1` reserved for an unblocked (not completed by a
    /// matching frame) request.
    pub fn code(self) -> i32 {
        match self {
            ProtocolStatus::Ok => 0,
            ProtocolStatus::InvalidArgument => -22, // EINVAL
            ProtocolStatus::NotSupported => -38,    // ENOSYS
            ProtocolStatus::WouldBlock => -11,      // EAGAIN
            ProtocolStatus::Unblocked => -1,
        }
    }
}

pub type Result<T> = core::result::Result<T, CanrmError>;
