//! The dispatcher loop: binds the device node as a Unix-domain socket and
//! turns each accepted connection into a client of [`canrm_core::protocol::Node`].
//!
//! One reader thread and one writer thread per connection. The reader
//! thread parses requests off the wire and calls straight into `Node`; the
//! writer thread drains a per-connection reply channel and serializes
//! whatever arrives on it — an immediate reply the reader produced, or a
//! frame the broadcast feeder later delivered through the scheduler. This
//! keeps exactly one code path formatting replies regardless of how they
//! were produced.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use canrm_core::wire::{self, OpenFlags};
use canrm_core::{Filter, Node, ProtocolStatus, RegisterAccess, ServerMessage};
use crossbeam_channel::unbounded;

/// Binds the device node's Unix-domain socket, removing a stale socket file
/// left behind by an unclean previous shutdown.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(path)
}

/// Accepts connections until `should_stop` reports true, spawning a thread
/// pair per client. Blocks the calling thread; run it on its own.
pub fn accept_loop<R>(listener: &UnixListener, node: Arc<Node<R>>, should_stop: impl Fn() -> bool)
where
    R: RegisterAccess + 'static,
{
    listener
        .set_nonblocking(true)
        .expect("a freshly bound UnixListener accepts nonblocking mode");

    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let node = node.clone();
                thread::spawn(move || handle_connection(stream, node));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if should_stop() {
                    return;
                }
                thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(err) => {
                log::warn!("accept failed: {err}");
            }
        }
    }
}

fn handle_connection<R: RegisterAccess>(mut stream: UnixStream, node: Arc<Node<R>>) {
    let flags = match wire::read_handshake(&mut stream) {
        Ok(flags) => flags,
        Err(err) => {
            log::debug!("connection dropped before sending its open handshake: {err}");
            return;
        }
    };
    let nonblocking = flags.contains(OpenFlags::NONBLOCK);
    let writable = flags.contains(OpenFlags::WRITE);
    let client = node.open(flags.contains(OpenFlags::APPEND));

    let (reply_tx, reply_rx) = unbounded::<ServerMessage>();

    let mut writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            log::warn!("failed to clone client stream for the writer thread: {err}");
            node.close(client);
            return;
        }
    };
    let writer = thread::spawn(move || {
        for message in reply_rx {
            let (status, payload) = encode_reply(message);
            if wire::write_reply(&mut writer_stream, status, &payload).is_err() {
                break;
            }
        }
    });

    loop {
        let request = match wire::read_request(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                log::debug!("client {} read error: {err}", client.0);
                break;
            }
        };

        match request.opcode {
            wire::opcode::READ => {
                if let Some(message) = node.read(client, nonblocking, reply_tx.clone()) {
                    let _ = reply_tx.send(message);
                }
            }
            wire::opcode::WRITE => {
                let message = if !writable {
                    ServerMessage::Status(ProtocolStatus::InvalidArgument)
                } else {
                    match wire::decode_frame(&request.payload) {
                        Some(frame) if frame.is_valid() => {
                            node.write(frame);
                            ServerMessage::Status(ProtocolStatus::Ok)
                        }
                        _ => ServerMessage::Status(ProtocolStatus::InvalidArgument),
                    }
                };
                let _ = reply_tx.send(message);
            }
            wire::opcode::NOTIFY => {
                if node.notify_arm(client, reply_tx.clone()) {
                    let _ = reply_tx.send(ServerMessage::NotifyReady);
                }
            }
            wire::opcode::CONTROL => {
                let message = match wire::decode_devctl(&request.payload) {
                    Some((wire::devctl::SET_MASK, rest)) => {
                        match wire::decode_filter_wire(rest).and_then(|fw| Filter::try_from(fw).ok()) {
                            Some(filter) => ServerMessage::Status(node.set_filter(client, filter)),
                            None => ServerMessage::Status(ProtocolStatus::InvalidArgument),
                        }
                    }
                    Some(_) => ServerMessage::Status(ProtocolStatus::NotSupported),
                    None => ServerMessage::Status(ProtocolStatus::InvalidArgument),
                };
                let _ = reply_tx.send(message);
            }
            other => {
                log::debug!("client {} sent unknown opcode {other}", client.0);
                let _ = reply_tx.send(ServerMessage::Status(ProtocolStatus::NotSupported));
            }
        }
    }

    node.close(client);
    drop(reply_tx);
    let _ = writer.join();
}

fn encode_reply(message: ServerMessage) -> (i32, Vec<u8>) {
    match message {
        ServerMessage::Frame(frame) => (ProtocolStatus::Ok.code(), wire::encode_frame(&frame).to_vec()),
        ServerMessage::Empty => (ProtocolStatus::WouldBlock.code(), Vec::new()),
        ServerMessage::NotifyReady => (ProtocolStatus::Ok.code(), Vec::new()),
        ServerMessage::Status(status) => (status.code(), Vec::new()),
    }
}

/// Registers `path` as cleanup-on-drop: removes the socket file so a later
/// start doesn't have to rely on `bind`'s stale-file removal.
pub struct SocketGuard(PathBuf);

impl SocketGuard {
    pub fn new(path: PathBuf) -> Self {
        SocketGuard(path)
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove socket {}: {err}", self.0.display());
            }
        }
    }
}
