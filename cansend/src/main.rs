//! One-shot sender: writes a single CAN frame, parsed from the
//! `<id>#<data>` grammar, to a `canrm-daemon` device node.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context};

use canrm_core::wire::{self, OpenFlags};
use canrm_core::{CanFrame, CanIdFlags};

fn usage(progname: &str) -> String {
    format!(
        "{progname} - send CAN-frames via a canrm device node.\n\n\
         Usage: {progname} <device> <can_frame>.\n\n\
         <can_frame>:\n\
         \x20<can_id>#{{data}}          for CAN CC (Classical CAN 2.0B) data frames\n\
         \x20<can_id>#R{{len}}          for CAN CC (Classical CAN 2.0B) data frames\n\
         <can_id>:\n\
         \x203 (SFF) or 8 (EFF) hex chars\n\
         {{data}}:\n\
         \x200..8 ASCII hex-values (optionally separated by '.')\n\
         {{len}}:\n\
         \x20an optional 0..8 value as RTR frames can contain a valid dlc field\n\
         Examples:\n\
         \x20 5A1#11.2233.44556677.88 / 123#DEADBEEF / 5AA# /\n\
         \x20 1F334455#1122334455667788 / 123#R / 00000123#R3 / 333#R8 /\n"
    )
}

fn is_hex_char(c: char) -> bool {
    c.is_ascii_hexdigit()
}

/// Parses the `<can_id>#{data|R[len]}` grammar. The ID is extended iff it
/// is more than 3 hex characters long or numerically exceeds the 11-bit
/// standard range, matching the sender's own precedence (EFF wins).
fn parse_can_frame(text: &str) -> Option<CanFrame> {
    let (id_str, data_str) = text.split_once('#')?;
    if id_str.is_empty() || id_str.len() > 8 {
        return None;
    }
    if !id_str.chars().all(is_hex_char) {
        return None;
    }
    let raw_id = u32::from_str_radix(id_str, 16).ok()?;

    let mut flags = CanIdFlags::empty();
    if id_str.len() > 3 || raw_id > canrm_core::SFF_MASK {
        flags |= CanIdFlags::EFF;
    }

    let mut data = [0u8; 8];
    let len;

    if data_str.is_empty() {
        len = 0;
    } else if data_str.starts_with(['r', 'R']) {
        flags |= CanIdFlags::RTR;
        len = match data_str.len() {
            1 => 0,
            2 => {
                let digit = data_str.as_bytes()[1];
                if digit.is_ascii_digit() && digit <= b'8' {
                    digit - b'0'
                } else {
                    return None;
                }
            }
            _ => return None,
        };
    } else {
        let mut bytes = Vec::new();
        for token in data_str.split('.') {
            if token.is_empty() {
                return None;
            }
            let mut chars = token.chars().peekable();
            while chars.peek().is_some() {
                let a = chars.next()?;
                if !is_hex_char(a) {
                    return None;
                }
                let pair: String = match chars.peek() {
                    Some(&b) if is_hex_char(b) => {
                        chars.next();
                        [a, b].iter().collect()
                    }
                    _ => a.to_string(),
                };
                bytes.push(u8::from_str_radix(&pair, 16).ok()?);
            }
        }
        if bytes.len() > 8 {
            return None;
        }
        len = bytes.len() as u8;
        data[..bytes.len()].copy_from_slice(&bytes);
    }

    Some(CanFrame::new(raw_id, flags, len, data))
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let progname = args.first().map(String::as_str).unwrap_or("cansend");

    if args.len() != 3 {
        eprint!("{}", usage(progname));
        std::process::exit(1);
    }

    let device = PathBuf::from(&args[1]);
    let frame = match parse_can_frame(&args[2]) {
        Some(frame) => frame,
        None => {
            eprint!("{}", usage(progname));
            std::process::exit(1);
        }
    };

    let mut stream = UnixStream::connect(&device)
        .with_context(|| format!("open {} controller error", device.display()))?;
    wire::write_handshake(&mut stream, OpenFlags::WRITE | OpenFlags::APPEND)?;

    wire::write_request(&mut stream, wire::opcode::WRITE, &wire::encode_frame(&frame))?;
    let (status, _payload) = wire::read_reply(&mut stream)?;
    if status != 0 {
        bail!("can not write message to the can controller");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sff_data_frame_parses() {
        let frame = parse_can_frame("123#DEADBEEF").unwrap();
        assert!(!frame.is_eff());
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.len, 4);
        assert_eq!(&frame.data[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn dot_separated_data_splits_into_bytes() {
        let frame = parse_can_frame("5A1#11.2233.44556677.88").unwrap();
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn long_id_sets_eff_flag() {
        let frame = parse_can_frame("1F334455#1122334455667788").unwrap();
        assert!(frame.is_eff());
        assert_eq!(frame.id(), 0x1F334455 & canrm_core::EFF_MASK);
    }

    #[test]
    fn short_id_above_sff_range_sets_eff_flag() {
        let frame = parse_can_frame("00000123#R3").unwrap();
        assert!(frame.is_eff());
        assert!(frame.is_rtr());
        assert_eq!(frame.len, 3);
    }

    #[test]
    fn rtr_without_length_defaults_to_zero() {
        let frame = parse_can_frame("123#R").unwrap();
        assert!(frame.is_rtr());
        assert_eq!(frame.len, 0);
    }

    #[test]
    fn rtr_with_length_is_captured() {
        let frame = parse_can_frame("333#R8").unwrap();
        assert!(frame.is_rtr());
        assert_eq!(frame.len, 8);
    }

    #[test]
    fn empty_data_is_a_zero_length_frame() {
        let frame = parse_can_frame("5AA#").unwrap();
        assert_eq!(frame.len, 0);
        assert!(!frame.is_rtr());
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(parse_can_frame("123DEADBEEF").is_none());
    }

    #[test]
    fn more_than_eight_data_bytes_is_rejected() {
        assert!(parse_can_frame("123#0011223344556677889900").is_none());
    }
}
