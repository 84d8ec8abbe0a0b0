//! The CAN frame wire record and the per-client acceptance filter.
//!
//! Both layouts are fixed ABI shared between the daemon and its clients:
//! a client reads/writes exactly one [`CanFrame`] per I/O, and arms a
//! filter with exactly one [`FilterWire`] per `SET_MASK` control request.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Mask covering the 29-bit extended arbitration ID.
pub const EFF_MASK: u32 = 0x1FFF_FFFF;
/// Mask covering the 11-bit standard arbitration ID.
pub const SFF_MASK: u32 = 0x0000_07FF;

bitflags! {
    /// Flag bits packed into the high byte of `can_id`.
    ///
    /// Bit 29 is overloaded: on a wire frame it means `ERR` (error frame,
    /// driver to client only); inside a [`FilterWire`] record the same bit
    /// means `INV` (negate the match). A [`CanFrame`] never has both
    /// meanings active at once because the two contexts never mix.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CanIdFlags: u32 {
        const ERR_OR_INV = 1 << 29;
        const RTR        = 1 << 30;
        const EFF        = 1 << 31;
    }
}

impl CanIdFlags {
    pub const INV: Self = Self::ERR_OR_INV;
    pub const ERR: Self = Self::ERR_OR_INV;
}

/// The wire record exchanged with clients on read/write, and the in-memory
/// representation used throughout the driver and broadcast layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CanFrame {
    /// Low 29 bits: arbitration ID. High bits: [`CanIdFlags`].
    pub can_id: u32,
    /// Data length, 0..=8. Carried even for RTR frames (no payload).
    pub len: u8,
    _pad: [u8; 3],
    /// Payload. Bytes at indices >= `len` are unspecified.
    pub data: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u32, flags: CanIdFlags, len: u8, data: [u8; 8]) -> Self {
        CanFrame {
            can_id: (id & id_mask(flags)) | flags.bits(),
            len,
            _pad: [0; 3],
            data,
        }
    }

    pub fn flags(&self) -> CanIdFlags {
        CanIdFlags::from_bits_truncate(self.can_id)
    }

    pub fn is_eff(&self) -> bool {
        self.flags().contains(CanIdFlags::EFF)
    }

    pub fn is_rtr(&self) -> bool {
        self.flags().contains(CanIdFlags::RTR)
    }

    /// True only on driver-to-client error frames; never set on a frame a
    /// client writes.
    pub fn is_err(&self) -> bool {
        self.flags().contains(CanIdFlags::ERR)
    }

    /// The arbitration ID, masked to the range implied by `EFF`.
    pub fn id(&self) -> u32 {
        self.can_id & id_mask(self.flags())
    }

    /// `len <= 8`, per the data-model invariant.
    pub fn is_valid(&self) -> bool {
        self.len <= 8
    }
}

fn id_mask(flags: CanIdFlags) -> u32 {
    if flags.contains(CanIdFlags::EFF) {
        EFF_MASK
    } else {
        SFF_MASK
    }
}

/// Fixed size of [`CanFrame`] on the wire; reads/writes of any other size
/// are rejected with `InvalidArgument`.
pub const FRAME_WIRE_SIZE: usize = core::mem::size_of::<CanFrame>();

/// Per-client or per-interface acceptance filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Passes every frame.
    Disabled,
    /// Accepts iff `id & mask == pattern & mask` (or the complement, if
    /// `invert` is set).
    MaskMatch { pattern: u32, mask: u32, invert: bool },
    /// Accepts iff `lo <= id & EFF_MASK <= hi`.
    Range { lo: u32, hi: u32 },
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Disabled
    }
}

impl Filter {
    /// Evaluate the filter against a frame's masked arbitration ID.
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        match *self {
            Filter::Disabled => true,
            Filter::MaskMatch { pattern, mask, invert } => {
                let hit = frame.id() & mask == pattern & mask;
                hit != invert
            }
            Filter::Range { lo, hi } => {
                let id = frame.id();
                lo <= id && id <= hi
            }
        }
    }
}

/// Mode discriminants for [`FilterWire`].
const FILTER_MODE_DISABLED: u32 = 0;
const FILTER_MODE_MASK_MATCH: u32 = 1;
const FILTER_MODE_RANGE: u32 = 2;

/// The `SET_MASK` control payload, fixed at 12 bytes: a mode enum followed
/// by two mode-dependent `u32` fields.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FilterWire {
    pub mode: u32,
    /// `mask` (mode 1) or `lo` (mode 2).
    pub first: u32,
    /// `pattern` (mode 1) or `hi` (mode 2).
    pub second: u32,
}

pub const FILTER_WIRE_SIZE: usize = core::mem::size_of::<FilterWire>();

impl From<Filter> for FilterWire {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Disabled => FilterWire { mode: FILTER_MODE_DISABLED, first: 0, second: 0 },
            Filter::MaskMatch { pattern, mask, invert } => {
                let pattern = if invert { pattern | CanIdFlags::INV.bits() } else { pattern };
                FilterWire { mode: FILTER_MODE_MASK_MATCH, first: mask, second: pattern }
            }
            Filter::Range { lo, hi } => FilterWire { mode: FILTER_MODE_RANGE, first: lo, second: hi },
        }
    }
}

impl TryFrom<FilterWire> for Filter {
    type Error = ();

    fn try_from(wire: FilterWire) -> Result<Self, ()> {
        match wire.mode {
            FILTER_MODE_DISABLED => Ok(Filter::Disabled),
            FILTER_MODE_MASK_MATCH => {
                let invert = wire.second & CanIdFlags::INV.bits() != 0;
                let pattern = wire.second & !CanIdFlags::INV.bits();
                Ok(Filter::MaskMatch { pattern, mask: wire.first, invert })
            }
            FILTER_MODE_RANGE => Ok(Filter::Range { lo: wire.first, hi: wire.second }),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wire_size_is_sixteen_bytes() {
        assert_eq!(FRAME_WIRE_SIZE, 16);
    }

    #[test]
    fn filter_wire_size_is_twelve_bytes() {
        assert_eq!(FILTER_WIRE_SIZE, 12);
    }

    #[test]
    fn eff_frame_masks_to_29_bits() {
        let f = CanFrame::new(0x12345678, CanIdFlags::EFF, 0, [0; 8]);
        assert!(f.is_eff());
        assert_eq!(f.id(), 0x12345678 & EFF_MASK);
    }

    #[test]
    fn sff_frame_masks_to_11_bits() {
        let f = CanFrame::new(0x7ff + 1, CanIdFlags::empty(), 0, [0; 8]);
        assert_eq!(f.id(), (0x7ff + 1) & SFF_MASK);
    }

    #[test]
    fn rtr_frame_carries_no_payload_semantics_but_keeps_len() {
        let f = CanFrame::new(0x456, CanIdFlags::RTR, 4, [0; 8]);
        assert!(f.is_rtr());
        assert_eq!(f.len, 4);
    }

    #[test]
    fn mask_match_accepts_and_rejects() {
        let filter = Filter::MaskMatch { pattern: 0x100, mask: 0x700, invert: false };
        let hit = CanFrame::new(0x123, CanIdFlags::empty(), 0, [0; 8]);
        let miss = CanFrame::new(0x200, CanIdFlags::empty(), 0, [0; 8]);
        assert!(filter.accepts(&hit));
        assert!(!filter.accepts(&miss));
    }

    #[test]
    fn mask_match_invert_accepts_complement() {
        let filter = Filter::MaskMatch { pattern: 0x100, mask: 0x700, invert: true };
        let hit = CanFrame::new(0x123, CanIdFlags::empty(), 0, [0; 8]);
        let miss = CanFrame::new(0x200, CanIdFlags::empty(), 0, [0; 8]);
        assert!(!filter.accepts(&hit));
        assert!(filter.accepts(&miss));
    }

    #[test]
    fn range_filter_bounds_inclusive() {
        let filter = Filter::Range { lo: 0x100, hi: 0x200 };
        assert!(filter.accepts(&CanFrame::new(0x100, CanIdFlags::empty(), 0, [0; 8])));
        assert!(filter.accepts(&CanFrame::new(0x200, CanIdFlags::empty(), 0, [0; 8])));
        assert!(!filter.accepts(&CanFrame::new(0x201, CanIdFlags::empty(), 0, [0; 8])));
    }

    #[test]
    fn filter_wire_round_trip() {
        let filter = Filter::MaskMatch { pattern: 0x42, mask: 0x7ff, invert: true };
        let wire: FilterWire = filter.into();
        let back: Filter = wire.try_into().unwrap();
        assert_eq!(filter, back);
    }

    #[test]
    fn disabled_filter_always_passes() {
        assert!(Filter::Disabled.accepts(&CanFrame::new(0, CanIdFlags::empty(), 0, [0; 8])));
    }
}
