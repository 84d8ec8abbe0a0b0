//! The concrete wire framing for the device-node protocol's transport
//! binding: a length-prefixed request from client to daemon, and a
//! status-prefixed reply going the other way. Shared by the daemon and
//! both CLI collaborators so the three stay in sync by construction.

use std::io::{self, Read, Write};

use bitflags::bitflags;

use crate::frame::{CanFrame, FilterWire, FRAME_WIRE_SIZE};
use zerocopy::{FromBytes, IntoBytes};

/// Request opcodes sent after the connection handshake. Open has no opcode
/// of its own: accepting the connection already creates the client record,
/// mirroring the original resource manager's connect-time OCB allocation —
/// see [`read_handshake`] for the one preamble byte that stands in for the
/// open flags a real `open(2)` would have carried.
pub mod opcode {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const NOTIFY: u8 = 2;
    pub const CONTROL: u8 = 3;
}

/// Devctl codes carried in the first 4 bytes of a `Control` request's
/// payload, mirroring the original resource manager's `_IO_DEVCTL` opcode
/// space: `SET_MASK` is the only one this protocol implements; anything
/// else is rejected with `NotSupported` per `spec.md` §4.F/§7.
pub mod devctl {
    pub const SET_MASK: u32 = 0;
}

bitflags! {
    /// The handshake byte every connection sends immediately after
    /// connecting, before its first request. Stands in for the flags a
    /// real `open(2)` call would have passed through `_IO_CONNECT`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        /// Permits `Write` requests on this connection.
        const WRITE = 1 << 0;
        /// Start at the current head instead of the oldest surviving frame.
        const APPEND = 1 << 1;
        /// `Read`/`Notify` never park; they answer immediately.
        const NONBLOCK = 1 << 2;
    }
}

/// Reads the one-byte open-flags handshake a connection sends before its
/// first request.
pub fn read_handshake(stream: &mut impl Read) -> io::Result<OpenFlags> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf)?;
    Ok(OpenFlags::from_bits_truncate(buf[0]))
}

pub fn write_handshake(stream: &mut impl Write, flags: OpenFlags) -> io::Result<()> {
    stream.write_all(&[flags.bits()])?;
    stream.flush()
}

const MAX_PAYLOAD: u32 = 4096;

/// A parsed request: an opcode plus its raw payload bytes.
pub struct Request {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Reads one length-prefixed request. Returns `Ok(None)` on a clean EOF at
/// a message boundary (the client closed its connection).
pub fn read_request(stream: &mut impl Read) -> io::Result<Option<Request>> {
    let mut opcode_buf = [0u8; 1];
    match stream.read_exact(&mut opcode_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request payload too large"));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Some(Request { opcode: opcode_buf[0], payload }))
}

pub fn write_request(stream: &mut impl Write, opcode: u8, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&[opcode])?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Reads one status-prefixed reply: a little-endian `i32` status code
/// (`ProtocolStatus::code()`, with `0` meaning success) followed by a
/// length-prefixed payload (a frame on a successful read, otherwise empty).
pub fn read_reply(stream: &mut impl Read) -> io::Result<(i32, Vec<u8>)> {
    let mut status_buf = [0u8; 4];
    stream.read_exact(&mut status_buf)?;
    let status = i32::from_le_bytes(status_buf);

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "reply payload too large"));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok((status, payload))
}

pub fn write_reply(stream: &mut impl Write, status: i32, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&status.to_le_bytes())?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Encodes a frame reply's payload.
pub fn encode_frame(frame: &CanFrame) -> [u8; FRAME_WIRE_SIZE] {
    let mut buf = [0u8; FRAME_WIRE_SIZE];
    frame.write_to(&mut buf[..]).expect("CanFrame has a fixed known-layout size");
    buf
}

/// Decodes a `Write` or `Read`-reply frame payload. `None` on anything
/// other than exactly one frame's worth of bytes.
pub fn decode_frame(payload: &[u8]) -> Option<CanFrame> {
    CanFrame::read_from_bytes(payload).ok()
}

/// Decodes a `Control` request's payload into its devctl code (see
/// [`devctl`]) and the remaining code-specific bytes.
pub fn decode_devctl(payload: &[u8]) -> Option<(u32, &[u8])> {
    if payload.len() < 4 {
        return None;
    }
    let code = u32::from_le_bytes(payload[..4].try_into().unwrap());
    Some((code, &payload[4..]))
}

/// Encodes a `SET_MASK` control request's payload: the devctl code followed
/// by the filter record.
pub fn encode_set_mask(filter: FilterWire) -> Vec<u8> {
    let mut buf = devctl::SET_MASK.to_le_bytes().to_vec();
    buf.extend_from_slice(filter.as_bytes());
    buf
}

/// Decodes a bare filter record, once the devctl code has already been
/// stripped by [`decode_devctl`].
pub fn decode_filter_wire(payload: &[u8]) -> Option<FilterWire> {
    FilterWire::read_from_bytes(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips_through_the_wire() {
        let mut buf = Vec::new();
        write_request(&mut buf, opcode::WRITE, &[1, 2, 3]).unwrap();
        let mut cursor = Cursor::new(buf);
        let req = read_request(&mut cursor).unwrap().unwrap();
        assert_eq!(req.opcode, opcode::WRITE);
        assert_eq!(req.payload, vec![1, 2, 3]);
    }

    #[test]
    fn reply_round_trips_through_the_wire() {
        let mut buf = Vec::new();
        write_reply(&mut buf, -1, &[9, 9]).unwrap();
        let mut cursor = Cursor::new(buf);
        let (status, payload) = read_reply(&mut cursor).unwrap();
        assert_eq!(status, -1);
        assert_eq!(payload, vec![9, 9]);
    }

    #[test]
    fn empty_stream_reads_as_clean_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn open_flags_decode_independently() {
        let flags = OpenFlags::WRITE | OpenFlags::NONBLOCK;
        assert!(flags.contains(OpenFlags::WRITE));
        assert!(flags.contains(OpenFlags::NONBLOCK));
        assert!(!flags.contains(OpenFlags::APPEND));
    }

    #[test]
    fn handshake_round_trips_through_the_wire() {
        let mut buf = Vec::new();
        write_handshake(&mut buf, OpenFlags::APPEND | OpenFlags::NONBLOCK).unwrap();
        let mut cursor = Cursor::new(buf);
        let flags = read_handshake(&mut cursor).unwrap();
        assert_eq!(flags, OpenFlags::APPEND | OpenFlags::NONBLOCK);
    }

    #[test]
    fn set_mask_devctl_round_trips_to_a_filter_wire() {
        let filter = FilterWire { mode: 1, first: 0x700, second: 0x100 };
        let payload = encode_set_mask(filter);
        let (code, rest) = decode_devctl(&payload).unwrap();
        assert_eq!(code, devctl::SET_MASK);
        let decoded = decode_filter_wire(rest).unwrap();
        assert_eq!(decoded.mode, filter.mode);
        assert_eq!(decoded.first, filter.first);
        assert_eq!(decoded.second, filter.second);
    }

    #[test]
    fn unrecognized_devctl_code_is_still_extracted_for_the_caller_to_reject() {
        let mut payload = 99u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0; 12]);
        let (code, _rest) = decode_devctl(&payload).unwrap();
        assert_ne!(code, devctl::SET_MASK);
    }

    #[test]
    fn devctl_payload_shorter_than_the_code_itself_is_rejected() {
        assert!(decode_devctl(&[1, 2, 3]).is_none());
    }
}
