//! The shared receive ring: a single-producer broadcast buffer indexed by
//! a monotonically increasing `head`. Every reader observes the same
//! frames regardless of consumption rate; a reader that falls behind is
//! fast-forwarded, never served stale data.
//!
//! Callers are expected to hold the protocol layer's single ring mutex
//! before calling any method here — this type itself performs no locking.

/// A single-producer, monotonically-indexed broadcast ring of received
/// frames.
pub struct ReceiveRing {
    capacity: u32,
    slots: Vec<Option<crate::frame::CanFrame>>,
    /// Total frames ever received.
    head: u32,
    /// Oldest frame still present.
    bottom: u32,
}

impl ReceiveRing {
    /// `k` selects capacity `2^k`, `0 <= k <= 24`.
    pub fn new(k: u32) -> crate::error::Result<Self> {
        if k > 24 {
            return Err(crate::error::CanrmError::Configuration(format!(
                "ring capacity exponent {k} exceeds the maximum of 24"
            )));
        }
        let capacity = 1u32 << k;
        Ok(ReceiveRing {
            capacity,
            slots: vec![None; capacity as usize],
            head: 0,
            bottom: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn bottom(&self) -> u32 {
        self.bottom
    }

    /// Appends a frame at `head`, returning the monotonic index it was
    /// assigned. If the ring is full, `bottom` advances in lock-step,
    /// silently evicting the oldest frame (Invariant A).
    pub fn push(&mut self, frame: crate::frame::CanFrame) -> u32 {
        let index = self.head;
        let slot = (index % self.capacity) as usize;
        self.slots[slot] = Some(frame);
        self.head = self.head.wrapping_add(1);
        if self.head.wrapping_sub(self.bottom) > self.capacity {
            self.bottom = self.bottom.wrapping_add(1);
        }
        index
    }

    /// `true` if `index` still names a live slot, i.e. `bottom <= index <
    /// head` under wrap-aware arithmetic.
    pub fn contains(&self, index: u32) -> bool {
        let from_bottom = index.wrapping_sub(self.bottom);
        let window = self.head.wrapping_sub(self.bottom);
        from_bottom < window
    }

    /// Looks up a live frame by monotonic index. Returns `None` if the
    /// index has been evicted or has not been produced yet.
    pub fn get(&self, index: u32) -> Option<&crate::frame::CanFrame> {
        if !self.contains(index) {
            return None;
        }
        self.slots[(index % self.capacity) as usize].as_ref()
    }

    /// Fast-forward semantics: if `offset` no longer names a live slot,
    /// snap it to `bottom`.
    pub fn fast_forward(&self, offset: u32) -> u32 {
        if self.contains(offset) || offset == self.head {
            offset
        } else {
            self.bottom
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CanFrame, CanIdFlags};

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, CanIdFlags::empty(), 0, [0; 8])
    }

    #[test]
    fn capacity_invariant_holds_after_many_pushes() {
        let mut ring = ReceiveRing::new(2).unwrap(); // N = 4
        for i in 0..10 {
            ring.push(frame(i));
            assert!(ring.head().wrapping_sub(ring.bottom()) <= ring.capacity());
        }
    }

    #[test]
    fn overflow_fast_forwards_to_new_bottom() {
        let mut ring = ReceiveRing::new(2).unwrap(); // N = 4
        for i in 0..10u32 {
            ring.push(frame(i));
        }
        // 10 frames pushed into a ring of 4: bottom is now 6.
        assert_eq!(ring.bottom(), 6);
        assert_eq!(ring.fast_forward(0), 6);
        for i in 0..6 {
            assert!(ring.get(i).is_none());
        }
        assert!(ring.get(6).is_some());
    }

    #[test]
    fn in_window_offset_is_unchanged_by_fast_forward() {
        let mut ring = ReceiveRing::new(4).unwrap(); // N = 16
        for i in 0..5u32 {
            ring.push(frame(i));
        }
        assert_eq!(ring.fast_forward(2), 2);
    }

    #[test]
    fn rejects_capacity_exponent_above_24() {
        assert!(ReceiveRing::new(25).is_err());
    }
}
