//! The delivery scheduler: matches a newly appended frame against every
//! parked client and delivers or wakes the ones whose turn it is.
//!
//! Runs on the broadcast feeder thread, under the same lock that guards
//! the ring and the per-client map, every time a frame is appended. Kept
//! as its own module rather than folded into [`crate::protocol`] so the
//! ISR -> deferred-thread -> feeder -> scheduler handoff stays legible as
//! separate pipeline stages.

use std::collections::HashMap;

use crate::client::{ClientId, ClientState, DelayedEntry};
use crate::protocol::ServerMessage;
use crate::ring::ReceiveRing;

/// Walks the delayed queue for the frame just appended at `index`, in
/// queue order. A parked client is only examined when its `offset` equals
/// `index` — anything else means that client has not caught up yet, or
/// (for a `Reply`) has already been answered for an earlier frame this
/// round.
///
/// Ordering guarantee: a single client always observes frames in receive
/// order, because its own `offset` only ever advances by one per call.
/// Across different clients no relative order is promised — delivery
/// happens in the delayed queue's iteration order.
pub fn dispatch(
    ring: &ReceiveRing,
    clients: &mut HashMap<ClientId, ClientState>,
    delayed: &mut Vec<DelayedEntry>,
    index: u32,
) {
    delayed.retain_mut(|entry| {
        let client_id = entry.client();
        let Some(client_state) = clients.get_mut(&client_id) else {
            // Client vanished without going through close(); drop the
            // stale record rather than spin on it forever.
            return false;
        };
        if client_state.offset != index {
            return true;
        }
        let Some(frame) = ring.get(index).copied() else {
            return true;
        };
        if !client_state.filter.accepts(&frame) {
            client_state.offset = client_state.offset.wrapping_add(1);
            return true;
        }
        match entry {
            DelayedEntry::Reply { token, .. } => {
                let _ = token.send(ServerMessage::Frame(frame));
                client_state.offset = client_state.offset.wrapping_add(1);
                false
            }
            DelayedEntry::Notify { token, .. } => {
                if client_state.notify_armed {
                    let _ = token.send(ServerMessage::NotifyReady);
                    client_state.notify_armed = false;
                }
                client_state.offset = client_state.offset.wrapping_add(1);
                false
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CanFrame, CanIdFlags, Filter};
    use crossbeam_channel::unbounded;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, CanIdFlags::empty(), 0, [0; 8])
    }

    #[test]
    fn matching_reply_is_delivered_and_offset_advances() {
        let mut ring = ReceiveRing::new(4).unwrap();
        let index = ring.push(frame(0x100));

        let mut clients = HashMap::new();
        let id = ClientId(1);
        clients.insert(id, ClientState::new(index, false));

        let (tx, rx) = unbounded();
        let mut delayed = vec![DelayedEntry::Reply { client: id, token: tx }];

        dispatch(&ring, &mut clients, &mut delayed, index);

        assert!(delayed.is_empty());
        assert_eq!(clients[&id].offset, index + 1);
        match rx.try_recv().unwrap() {
            ServerMessage::Frame(f) => assert_eq!(f.can_id, 0x100),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn filter_rejection_advances_offset_but_keeps_the_client_parked() {
        let mut ring = ReceiveRing::new(4).unwrap();
        let index = ring.push(frame(0x200));

        let mut clients = HashMap::new();
        let id = ClientId(1);
        let mut state = ClientState::new(index, false);
        state.filter = Filter::MaskMatch { pattern: 0x100, mask: 0x700, invert: false };
        clients.insert(id, state);

        let (tx, rx) = unbounded();
        let mut delayed = vec![DelayedEntry::Reply { client: id, token: tx }];

        dispatch(&ring, &mut clients, &mut delayed, index);

        assert_eq!(delayed.len(), 1, "client stays parked past a filtered-out frame");
        assert_eq!(clients[&id].offset, index + 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notify_fires_once_and_disarms() {
        let mut ring = ReceiveRing::new(4).unwrap();
        let index = ring.push(frame(0x300));

        let mut clients = HashMap::new();
        let id = ClientId(7);
        let mut state = ClientState::new(index, false);
        state.notify_armed = true;
        clients.insert(id, state);

        let (tx, rx) = unbounded();
        let mut delayed = vec![DelayedEntry::Notify { client: id, token: tx }];

        dispatch(&ring, &mut clients, &mut delayed, index);

        assert!(delayed.is_empty());
        assert!(!clients[&id].notify_armed);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::NotifyReady));
    }

    #[test]
    fn entry_for_a_different_offset_is_left_untouched() {
        let mut ring = ReceiveRing::new(4).unwrap();
        let index = ring.push(frame(0x400));

        let mut clients = HashMap::new();
        let id = ClientId(1);
        clients.insert(id, ClientState::new(index + 5, false));

        let (tx, _rx) = unbounded();
        let mut delayed = vec![DelayedEntry::Reply { client: id, token: tx }];

        dispatch(&ring, &mut clients, &mut delayed, index);

        assert_eq!(delayed.len(), 1);
        assert_eq!(clients[&id].offset, index + 5);
    }
}
