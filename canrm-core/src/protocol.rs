//! The device-node protocol state machine: open/read/write/notify/control/
//! close/unblock, built on the shared receive ring, the per-client map, and
//! the delayed-request queue.
//!
//! [`Node`] owns the one mutex that guards all three (ring, clients,
//! delayed queue) together, so every operation here observes a consistent
//! snapshot and the scheduler never races a concurrent open or close. The
//! mutex is never held across a blocking call — sending on a reply token
//! is a non-blocking channel send by construction.
//!
//! The actual transport (accepting connections, framing requests on the
//! wire, routing bytes to these methods) lives in the daemon binary; this
//! module only knows about [`ClientId`]s and reply tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::{ClientId, ClientState, DelayedEntry, ReplyToken};
use crate::error::{ProtocolStatus, Result};
use crate::frame::{CanFrame, Filter};
use crate::regs::RegisterAccess;
use crate::ring::ReceiveRing;
use crate::sja1000::Sja1000Driver;

/// A reply sent back to a client over its reply token.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// A delivered frame: the answer to a matching read.
    Frame(CanFrame),
    /// A nonblocking read found nothing to deliver.
    Empty,
    /// A `Notify` record's `INPUT` condition became satisfied.
    NotifyReady,
    /// A status-only reply: close-driven or explicit unblock, or a
    /// protocol-level failure.
    Status(ProtocolStatus),
}

struct SharedState {
    ring: ReceiveRing,
    clients: HashMap<ClientId, ClientState>,
    delayed: Vec<DelayedEntry>,
}

/// The protocol layer's shared state plus a handle to the driver that
/// backs writes. Cheap to clone (wrap in `Arc`) and shared across the
/// dispatcher's connection-handling threads and the broadcast feeder.
pub struct Node<R> {
    state: Mutex<SharedState>,
    next_client: AtomicU64,
    driver: Arc<Sja1000Driver<R>>,
}

impl<R: RegisterAccess> Node<R> {
    /// `ring_k` selects the shared receive ring's capacity, `2^ring_k`.
    pub fn new(driver: Arc<Sja1000Driver<R>>, ring_k: u32) -> Result<Self> {
        Ok(Node {
            state: Mutex::new(SharedState {
                ring: ReceiveRing::new(ring_k)?,
                clients: HashMap::new(),
                delayed: Vec::new(),
            }),
            next_client: AtomicU64::new(0),
            driver,
        })
    }

    /// Registers a new client. `append_only` mirrors the open's
    /// `O_APPEND`-equivalent flag: the client starts at the current head
    /// (sees only future frames) rather than at the oldest surviving one.
    pub fn open(&self, append_only: bool) -> ClientId {
        let mut state = self.state.lock().unwrap();
        let offset = if append_only { state.ring.head() } else { state.ring.bottom() };
        let id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        state.clients.insert(id, ClientState::new(offset, false));
        id
    }

    /// Serves a read. Returns the reply to send immediately (a match, or
    /// an empty reply for a nonblocking miss); returns `None` when the
    /// request was parked and the scheduler will reply later via `token`.
    pub fn read(&self, client: ClientId, nonblocking: bool, token: ReplyToken) -> Option<ServerMessage> {
        let mut state = self.state.lock().unwrap();
        let head = state.ring.head();
        let Some(client_state) = state.clients.get_mut(&client) else {
            return Some(ServerMessage::Status(ProtocolStatus::Unblocked));
        };

        fast_forward(&state.ring, client_state);

        while client_state.offset != head {
            let offset = client_state.offset;
            let Some(frame) = state.ring.get(offset).copied() else {
                client_state.offset = offset.wrapping_add(1);
                continue;
            };
            if client_state.filter.accepts(&frame) {
                client_state.offset = offset.wrapping_add(1);
                return Some(ServerMessage::Frame(frame));
            }
            client_state.offset = offset.wrapping_add(1);
        }

        if nonblocking {
            return Some(ServerMessage::Empty);
        }
        state.delayed.push(DelayedEntry::Reply { client, token });
        None
    }

    /// Hands a client's frame to the driver's transmit path. Acceptance of
    /// write permission (the open's read/write mode) is the transport
    /// layer's job, since only it tracks per-connection open flags.
    pub fn write(&self, frame: CanFrame) {
        self.driver.write_message(frame);
    }

    /// Poll-arm request for `INPUT`. Returns `true` if the condition is
    /// already satisfied (the caller replies immediately); `false` means a
    /// `Notify` record was parked and `token` will be used later.
    pub fn notify_arm(&self, client: ClientId, token: ReplyToken) -> bool {
        let mut state = self.state.lock().unwrap();
        let head = state.ring.head();
        let Some(client_state) = state.clients.get_mut(&client) else {
            return true;
        };

        fast_forward(&state.ring, client_state);

        let mut offset = client_state.offset;
        let mut input_ready = false;
        while offset != head {
            if let Some(frame) = state.ring.get(offset) {
                if client_state.filter.accepts(frame) {
                    input_ready = true;
                    break;
                }
            }
            offset = offset.wrapping_add(1);
        }
        client_state.offset = offset;

        if !input_ready {
            client_state.notify_armed = true;
            state.delayed.push(DelayedEntry::Notify { client, token });
        }
        input_ready
    }

    /// `SET_MASK`: replaces the client's acceptance filter.
    pub fn set_filter(&self, client: ClientId, filter: Filter) -> ProtocolStatus {
        let mut state = self.state.lock().unwrap();
        match state.clients.get_mut(&client) {
            Some(client_state) => {
                client_state.filter = filter;
                ProtocolStatus::Ok
            }
            None => ProtocolStatus::Unblocked,
        }
    }

    /// Final close of a handle: completes every parked record referencing
    /// `client` with a synthetic unblock reply, then drops the per-client
    /// state. Idempotent records are guaranteed by construction — a client
    /// has at most one `Reply` and at most one `Notify` outstanding.
    pub fn close(&self, client: ClientId) {
        let mut state = self.state.lock().unwrap();
        state.delayed.retain(|entry| {
            if entry.client() != client {
                return true;
            }
            let token = match entry {
                DelayedEntry::Reply { token, .. } => token,
                DelayedEntry::Notify { token, .. } => token,
            };
            let _ = token.send(ServerMessage::Status(ProtocolStatus::Unblocked));
            false
        });
        state.clients.remove(&client);
    }

    /// Completes a single outstanding blocked read for `client` with the
    /// unblock status, without touching the rest of its state (the client
    /// is still open and may issue further requests).
    pub fn unblock(&self, client: ClientId) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.delayed.iter().position(|entry| {
            matches!(entry, DelayedEntry::Reply { client: c, .. } if *c == client)
        }) {
            if let DelayedEntry::Reply { token, .. } = state.delayed.remove(pos) {
                let _ = token.send(ServerMessage::Status(ProtocolStatus::Unblocked));
            }
        }
    }

    /// Appends a newly received frame to the ring and runs the delivery
    /// scheduler against it. Called by the broadcast feeder once per frame
    /// pulled from the driver.
    pub fn deliver_frame(&self, frame: CanFrame) {
        let mut state = self.state.lock().unwrap();
        let index = state.ring.push(frame);
        let SharedState { ring, clients, delayed } = &mut *state;
        crate::scheduler::dispatch(ring, clients, delayed, index);
    }

    pub fn ring_capacity(&self) -> u32 {
        self.state.lock().unwrap().ring.capacity()
    }
}

/// Shared by `read` and `notify_arm`: snaps a client whose `offset` has
/// fallen out of the ring's live window back to `bottom`.
fn fast_forward(ring: &ReceiveRing, client_state: &mut ClientState) {
    client_state.offset = ring.fast_forward(client_state.offset);
}

/// Runs the broadcast feeder: pulls frames from the driver's blocking
/// consumer API and delivers each into the node, until the driver shuts
/// down. Intended to run on its own thread, started by the daemon.
pub fn run_broadcast_feeder<R: RegisterAccess>(driver: Arc<Sja1000Driver<R>>, node: Arc<Node<R>>) {
    while let Some(frame) = driver.read_message() {
        node.deliver_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanIdFlags;
    use crate::regs::LoopbackRegisters;
    use crate::sja1000::BaudRate;
    use crossbeam_channel::unbounded;

    fn node() -> (Node<LoopbackRegisters>, Arc<Sja1000Driver<LoopbackRegisters>>) {
        let (driver, _pulses) = Sja1000Driver::new(LoopbackRegisters::new(), BaudRate::R125K);
        let driver = Arc::new(driver);
        let node = Node::new(driver.clone(), 4).unwrap();
        (node, driver)
    }

    #[test]
    fn open_non_append_starts_at_bottom() {
        let (node, _driver) = node();
        let client = node.open(false);
        let state = node.state.lock().unwrap();
        assert_eq!(state.clients[&client].offset, 0);
    }

    #[test]
    fn open_append_only_starts_at_current_head() {
        let (node, _driver) = node();
        node.deliver_frame(CanFrame::new(0x100, CanIdFlags::empty(), 0, [0; 8]));
        let client = node.open(true);
        let state = node.state.lock().unwrap();
        assert_eq!(state.clients[&client].offset, 1);
    }

    #[test]
    fn nonblocking_read_with_nothing_pending_is_empty() {
        let (node, _driver) = node();
        let client = node.open(false);
        let (tx, _rx) = unbounded();
        let reply = node.read(client, true, tx);
        assert!(matches!(reply, Some(ServerMessage::Empty)));
    }

    #[test]
    fn blocking_read_parks_and_is_completed_by_delivery() {
        let (node, _driver) = node();
        let client = node.open(false);
        let (tx, rx) = unbounded();
        assert!(node.read(client, false, tx).is_none());

        node.deliver_frame(CanFrame::new(0x321, CanIdFlags::empty(), 1, [7, 0, 0, 0, 0, 0, 0, 0]));

        match rx.try_recv().unwrap() {
            ServerMessage::Frame(f) => assert_eq!(f.can_id, 0x321),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn close_unblocks_a_parked_reader_exactly_once() {
        let (node, _driver) = node();
        let client = node.open(false);
        let (tx, rx) = unbounded();
        assert!(node.read(client, false, tx).is_none());

        node.close(client);

        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Status(ProtocolStatus::Unblocked)));
        assert!(rx.try_recv().is_err());
        let state = node.state.lock().unwrap();
        assert!(!state.clients.contains_key(&client));
        assert!(!state.delayed.iter().any(|e| e.client() == client));
    }

    #[test]
    fn fast_forward_on_read_skips_to_new_bottom_after_overflow() {
        let (node, _driver) = node();
        let client = node.open(false);
        for i in 0..20u32 {
            node.deliver_frame(CanFrame::new(i, CanIdFlags::empty(), 0, [0; 8]));
        }
        let (tx, _rx) = unbounded();
        let reply = node.read(client, true, tx);
        let bottom = node.state.lock().unwrap().ring.bottom();
        match reply {
            Some(ServerMessage::Frame(f)) => assert_eq!(f.can_id, bottom),
            other => panic!("expected the frame at the new bottom, got {other:?}"),
        }
    }

    #[test]
    fn notify_arm_reports_ready_immediately_when_a_frame_already_matches() {
        let (node, _driver) = node();
        let client = node.open(false);
        node.deliver_frame(CanFrame::new(0x10, CanIdFlags::empty(), 0, [0; 8]));
        let (tx, _rx) = unbounded();
        assert!(node.notify_arm(client, tx));
    }

    #[test]
    fn notify_arm_parks_when_nothing_matches_yet() {
        let (node, _driver) = node();
        let client = node.open(false);
        let (tx, rx) = unbounded();
        assert!(!node.notify_arm(client, tx));

        node.deliver_frame(CanFrame::new(0x10, CanIdFlags::empty(), 0, [0; 8]));

        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::NotifyReady));
    }
}
