//! Per-client state and the driver-wide delayed-request queue: every
//! connected client gets a receive cursor and an acceptance filter, and at
//! most one outstanding blocked request parked on the queue at a time.

use crate::frame::Filter;
use crate::protocol::ServerMessage;
use crossbeam_channel::Sender;

/// Handle identifying a connected client. Assigned by the protocol layer's
/// monotonic counter; never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

/// Per-client state held in the protocol layer's shared map.
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Monotonic ring index of the next frame this client has not yet
    /// consumed.
    pub offset: u32,
    /// Acceptance filter last armed with `SET_MASK`; `Filter::Disabled`
    /// until a client calls it.
    pub filter: Filter,
    /// Whether this client has an outstanding `Notify` registered.
    pub notify_armed: bool,
    /// Set from the open's `O_NONBLOCK`-equivalent flag. A nonblocking
    /// client's read never parks: `WouldBlock` is returned immediately
    /// instead of enqueuing a `Reply` record.
    pub nonblocking: bool,
}

impl ClientState {
    pub fn new(offset: u32, nonblocking: bool) -> Self {
        ClientState {
            offset,
            filter: Filter::Disabled,
            notify_armed: false,
            nonblocking,
        }
    }
}

/// A reply channel: the sending half of the per-connection writer thread's
/// channel, cloned into the delayed queue as a literal "reply token".
pub type ReplyToken = Sender<ServerMessage>;

/// A parked request, walked by the scheduler on every newly appended
/// frame.
#[derive(Clone)]
pub enum DelayedEntry {
    /// A blocked `read()`, to be satisfied with the first frame the
    /// client's filter accepts at or after `client`'s current offset.
    Reply { client: ClientId, token: ReplyToken },
    /// A registered `notify()`, satisfied the same way but replied to
    /// with an empty acknowledgement rather than a frame.
    Notify { client: ClientId, token: ReplyToken },
}

impl DelayedEntry {
    pub fn client(&self) -> ClientId {
        match self {
            DelayedEntry::Reply { client, .. } => *client,
            DelayedEntry::Notify { client, .. } => *client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_comparable_and_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ClientId(1), "a");
        map.insert(ClientId(2), "b");
        assert_eq!(map.get(&ClientId(1)), Some(&"a"));
        assert!(ClientId(1) < ClientId(2));
    }

    #[test]
    fn fresh_client_state_has_no_filter_and_is_blocking() {
        let state = ClientState::new(7, false);
        assert_eq!(state.offset, 7);
        assert_eq!(state.filter, Filter::Disabled);
        assert!(!state.nonblocking);
    }
}
