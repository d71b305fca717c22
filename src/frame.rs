//! Frame Codec (spec §4.1): translates between a [`Header`] plus
//! credential and payload byte strings, and the contiguous buffer that
//! goes on the wire.
//!
//! `encode` produces the full atomic unit described in spec §6's wire
//! table, length prefix included. `decode` consumes everything *after*
//! that length prefix — the caller (the Message Engine, which owns the
//! timed socket read) is the one that knows how many bytes to read off
//! the wire in the first place.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::header::Header;

/// A decoded frame: header plus the two opaque byte regions that follow
/// it. Neither region is interpreted here — the Auth Adapter and the
/// external payload codec own that (spec §1).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub credential: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Serializes `header` (with `body_length` set from `payload.len()`),
/// `credential`, and `payload` into one buffer, prefixed with the
/// big-endian length of everything that follows (spec §6).
pub fn encode(header: &Header, credential: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut framed = header.clone();
    framed.update_body_length(payload.len() as u32);

    let mut buf = Vec::with_capacity(4 + 32 + credential.len() + payload.len());
    buf.extend_from_slice(&[0u8; 4]);
    framed
        .write_to(&mut buf)
        .expect("writing a header into a Vec<u8> cannot fail");
    buf.write_u32::<BigEndian>(credential.len() as u32)
        .expect("writing into a Vec<u8> cannot fail");
    buf.extend_from_slice(credential);
    buf.extend_from_slice(payload);

    let body_len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&body_len.to_be_bytes());
    buf
}

/// Parses a [`Frame`] out of `buf`, which must contain exactly the bytes
/// following the wire length prefix (header + credential + payload, with
/// no trailing garbage).
///
/// Per spec §3's invariant, this rejects any header whose `body_length`
/// claims more bytes than remain after the header and credential have
/// been consumed.
pub fn decode(buf: &[u8]) -> Result<Frame, Error> {
    let mut cursor = Cursor::new(buf);
    let header = Header::read_from(&mut cursor)?;

    let cred_len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::IncompleteHeader)?;
    let pos = cursor.position() as usize;
    let remaining_for_cred = buf.len().saturating_sub(pos);
    if cred_len as usize > remaining_for_cred {
        return Err(Error::IncompletePacket {
            buffer_len: remaining_for_cred,
            expected: cred_len as usize,
        });
    }
    let mut credential = vec![0u8; cred_len as usize];
    cursor
        .read_exact(&mut credential)
        .map_err(|_| Error::IncompleteHeader)?;

    let remaining_for_payload = buf.len() - cursor.position() as usize;
    if header.body_length as usize > remaining_for_payload {
        return Err(Error::IncompletePacket {
            buffer_len: remaining_for_payload,
            expected: header.body_length as usize,
        });
    }
    let mut payload = vec![0u8; header.body_length as usize];
    cursor
        .read_exact(&mut payload)
        .map_err(|_| Error::IncompleteHeader)?;

    Ok(Frame {
        header,
        credential,
        payload,
    })
}

/// Strips the 4-byte wire length prefix `encode` wrote, returning the
/// slice `decode` expects. Exists so tests (and anything else that has a
/// whole framed buffer in hand, rather than having read it off a socket
/// incrementally) don't have to know the prefix width.
pub fn strip_length_prefix(framed: &[u8]) -> Result<&[u8], Error> {
    framed.get(4..).ok_or(Error::IncompleteHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::Forward;
    use crate::header::GLOBAL_AUTH_KEY;
    use hex_literal::hex;

    #[test]
    fn round_trips_header_credential_and_payload() {
        let header = Header::init_from_message(9, 42, GLOBAL_AUTH_KEY, Forward::none(), None);
        let credential = b"cred-bytes".to_vec();
        let payload = b"payload-bytes".to_vec();

        let framed = encode(&header, &credential, &payload);
        let body = strip_length_prefix(&framed).unwrap();
        let decoded = decode(body).unwrap();

        assert_eq!(decoded.header.message_type, 42);
        assert!(decoded.header.has_global_auth_key());
        assert_eq!(decoded.credential, credential);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn length_prefix_covers_exactly_the_remaining_bytes() {
        let header = Header::init_from_message(9, 1, 0, Forward::none(), None);
        let framed = encode(&header, b"c", b"pp");
        let declared = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, framed.len() - 4);
    }

    #[test]
    fn truncated_payload_is_incomplete_packet() {
        let header = Header::init_from_message(9, 1, 0, Forward::none(), None);
        let framed = encode(&header, b"c", b"0123456789");
        let body = strip_length_prefix(&framed).unwrap();
        // Chop off the last 5 bytes of the declared 10-byte payload.
        let truncated = &body[..body.len() - 5];

        match decode(truncated) {
            Err(Error::IncompletePacket { expected, .. }) => assert_eq!(expected, 10),
            other => panic!("expected IncompletePacket, got {other:?}"),
        }
    }

    #[test]
    fn encoding_twice_is_byte_identical() {
        let header = Header::init_from_message(9, 5, 0, Forward::new("a,b", 2, None), None);
        let a = encode(&header, b"cred", b"body");
        let b = encode(&header, b"cred", b"body");
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_buffer_never_panics() {
        // A handful of short/garbage inputs that a fuzzer would find in
        // the first few iterations; none of them should panic.
        let samples: &[&[u8]] = &[
            &[],
            &[0x00],
            &hex!("00090002"),
            &hex!("ffffffffffffffff"),
        ];
        for sample in samples {
            let _ = decode(sample);
        }
    }
}
