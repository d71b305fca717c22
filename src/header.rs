//! Header Model (spec §4.2): a typed view over the envelope header plus
//! the version-compatibility check.

use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;

use crate::error::Error;
use crate::forward::Forward;

/// Bit 0x1 in `header.flags`: sign/verify this message with the
/// process-wide auth secret instead of the default configured one.
pub const GLOBAL_AUTH_KEY: u16 = 0x1;

/// Bit 0x2 in `header.flags`: the caller wants the raw received buffer
/// retained (rather than freed) once the message has been decoded.
pub const KEEP_BUFFER: u16 = 0x2;

/// The inclusive range of protocol versions this build accepts on the
/// wire. Kept as a single compile-time constant so every version check in
/// the crate agrees on what "compatible" means.
pub const SUPPORTED_VERSIONS: RangeInclusive<u16> = 8..=10;

/// `NO_VAL`-equivalent ceiling used to reject obviously-corrupt array
/// length prefixes (spec §6, address-array encoding) before they're used
/// to size an allocation.
pub const NO_VAL: u32 = 0xFFFF_FFFE;

/// Typed view of the on-wire envelope header (spec §6's table), minus the
/// credential and payload regions which the Frame Codec owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub message_type: u16,
    pub body_length: u32,
    pub forward: Forward,
    pub return_count: u16,
    pub return_list: Vec<ReturnListEntry>,
    pub origin_address: Option<std::net::SocketAddrV4>,
}

/// An already-serialized child reply, as carried inline in an aggregated
/// response's `return_list` (spec §6). This is distinct from the
/// higher-level [`crate::message::ReturnEntry`] the Forwarding Tree hands
/// back to callers — this is the raw bytes form that travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnListEntry {
    pub node_name: String,
    pub message_type: u16,
    pub error_code: u32,
    pub payload: Vec<u8>,
}

impl Header {
    /// Builds a header for an outgoing message, applying `flags` on top of
    /// whatever the message itself carries (spec §4.2).
    pub fn init_from_message(
        version: u16,
        message_type: u16,
        flags: u16,
        forward: Forward,
        origin_address: Option<std::net::SocketAddrV4>,
    ) -> Self {
        Self {
            version,
            flags,
            message_type,
            body_length: 0,
            forward,
            return_count: 0,
            return_list: Vec::new(),
            origin_address,
        }
    }

    /// Rewrites `body_length` after the payload has actually been
    /// serialized (spec §4.1: write order is header-with-placeholder,
    /// then recompute and rewrite in place).
    pub fn update_body_length(&mut self, n: u32) {
        self.body_length = n;
    }

    /// Returns `Ok(())` iff `self.version` lies in [`SUPPORTED_VERSIONS`].
    pub fn check_version(&self) -> Result<(), Error> {
        if SUPPORTED_VERSIONS.contains(&self.version) {
            Ok(())
        } else {
            Err(Error::VersionError {
                got: self.version,
                supported: SUPPORTED_VERSIONS,
                peer_uid: None,
            })
        }
    }

    pub fn has_global_auth_key(&self) -> bool {
        self.flags & GLOBAL_AUTH_KEY != 0
    }

    pub fn keep_buffer(&self) -> bool {
        self.flags & KEEP_BUFFER != 0
    }

    /// Serializes the header (not including credential/payload) into
    /// `buf`, big-endian throughout per spec §4.1.
    pub fn write_to<W: Write>(&self, mut buf: W) -> io::Result<()> {
        buf.write_u16::<BigEndian>(self.version)?;
        buf.write_u16::<BigEndian>(self.flags)?;
        buf.write_u16::<BigEndian>(self.message_type)?;
        buf.write_u32::<BigEndian>(self.body_length)?;

        buf.write_u32::<BigEndian>(self.forward.count)?;
        let hostlist_bytes = self.forward.hostlist.as_bytes();
        buf.write_u32::<BigEndian>(hostlist_bytes.len() as u32)?;
        buf.write_all(hostlist_bytes)?;
        buf.write_u32::<BigEndian>(self.forward.timeout.map(|d| d.as_millis() as u32).unwrap_or(0))?;
        buf.write_u16::<BigEndian>(self.forward.tree_width)?;

        buf.write_u16::<BigEndian>(self.return_count)?;
        for entry in &self.return_list {
            let name_bytes = entry.node_name.as_bytes();
            buf.write_u32::<BigEndian>(name_bytes.len() as u32)?;
            buf.write_all(name_bytes)?;
            buf.write_u16::<BigEndian>(entry.message_type)?;
            buf.write_u32::<BigEndian>(entry.error_code)?;
            buf.write_u32::<BigEndian>(entry.payload.len() as u32)?;
            buf.write_all(&entry.payload)?;
        }

        match self.origin_address {
            Some(addr) => {
                buf.write_all(&addr.ip().octets())?;
                buf.write_u16::<BigEndian>(addr.port())?;
                buf.write_u16::<BigEndian>(0)?; // reserved, zero when local
            }
            None => buf.write_all(&[0u8; 8])?,
        }

        Ok(())
    }

    /// Parses a header from `r`, without consuming the credential or
    /// payload regions that follow it.
    pub fn read_from<R: Read>(mut r: R) -> Result<Self, Error> {
        let version = r.read_u16::<BigEndian>()?;
        let flags = r.read_u16::<BigEndian>()?;
        let message_type = r.read_u16::<BigEndian>()?;
        let body_length = r.read_u32::<BigEndian>()?;

        let count = r.read_u32::<BigEndian>()?;
        let hostlist_len = r.read_u32::<BigEndian>()?;
        if hostlist_len > NO_VAL {
            return Err(Error::InvalidLength);
        }
        let mut hostlist_buf = vec![0u8; hostlist_len as usize];
        r.read_exact(&mut hostlist_buf)?;
        let hostlist = String::from_utf8(hostlist_buf).map_err(|_| Error::InvalidLength)?;
        let timeout_ms = r.read_u32::<BigEndian>()?;
        let tree_width = r.read_u16::<BigEndian>()?;

        let forward = Forward {
            count,
            hostlist,
            tree_width,
            timeout: if timeout_ms == 0 {
                None
            } else {
                Some(std::time::Duration::from_millis(timeout_ms as u64))
            },
            // Any descriptor that made it onto the wire was, by
            // definition, explicitly set by the sender.
            ..forward_marked_set()
        };

        let return_count = r.read_u16::<BigEndian>()?;
        let mut return_list: SmallVec<[ReturnListEntry; 4]> = SmallVec::with_capacity(return_count as usize);
        for _ in 0..return_count {
            let name_len = r.read_u32::<BigEndian>()?;
            if name_len > NO_VAL {
                return Err(Error::InvalidLength);
            }
            let mut name_buf = vec![0u8; name_len as usize];
            r.read_exact(&mut name_buf)?;
            let node_name = String::from_utf8(name_buf).map_err(|_| Error::InvalidLength)?;

            let message_type = r.read_u16::<BigEndian>()?;
            let error_code = r.read_u32::<BigEndian>()?;
            let payload_len = r.read_u32::<BigEndian>()?;
            if payload_len > NO_VAL {
                return Err(Error::InvalidLength);
            }
            let mut payload = vec![0u8; payload_len as usize];
            r.read_exact(&mut payload)?;

            return_list.push(ReturnListEntry {
                node_name,
                message_type,
                error_code,
                payload,
            });
        }

        let mut origin_buf = [0u8; 8];
        r.read_exact(&mut origin_buf)?;
        let origin_address = if origin_buf == [0u8; 8] {
            None
        } else {
            let ip = Ipv4Addr::new(origin_buf[0], origin_buf[1], origin_buf[2], origin_buf[3]);
            let port = u16::from_be_bytes([origin_buf[4], origin_buf[5]]);
            Some(std::net::SocketAddrV4::new(ip, port))
        };

        Ok(Header {
            version,
            flags,
            message_type,
            body_length,
            forward,
            return_count,
            return_list: return_list.into_vec(),
            origin_address,
        })
    }
}

/// Just enough of `Forward` to mark a wire-parsed descriptor as "was set",
/// reusing `Forward`'s private `init_marker` through its public
/// constructor rather than duplicating the field here.
fn forward_marked_set() -> Forward {
    Forward::new("", 0, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn header_round_trips_with_forward_and_origin() {
        let mut h = Header::init_from_message(
            9,
            42,
            GLOBAL_AUTH_KEY,
            Forward::new("nodeA,nodeB", 3, Some(std::time::Duration::from_secs(5))),
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6818)),
        );
        h.update_body_length(16);

        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();

        let got = Header::read_from(Cursor::new(buf.as_slice())).unwrap();
        assert_eq!(got.version, 9);
        assert_eq!(got.message_type, 42);
        assert!(got.has_global_auth_key());
        assert_eq!(got.body_length, 16);
        assert_eq!(got.forward.hostlist, "nodeA,nodeB");
        assert_eq!(got.forward.tree_width, 3);
        assert_eq!(got.forward.timeout, Some(std::time::Duration::from_secs(5)));
        assert_eq!(
            got.origin_address,
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6818))
        );
    }

    #[test]
    fn header_round_trips_with_return_list() {
        let mut h = Header::init_from_message(9, 7, 0, Forward::none(), None);
        h.return_count = 2;
        h.return_list = vec![
            ReturnListEntry {
                node_name: "node1".into(),
                message_type: 7,
                error_code: 0,
                payload: vec![0xBE, 0xEF],
            },
            ReturnListEntry {
                node_name: "node2".into(),
                message_type: 0xFFFF,
                error_code: 111,
                payload: vec![],
            },
        ];

        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        let got = Header::read_from(Cursor::new(buf.as_slice())).unwrap();
        assert_eq!(got.return_count, 2);
        assert_eq!(got.return_list, h.return_list);
    }

    #[test]
    fn check_version_rejects_out_of_range() {
        let mut h = Header::init_from_message(9, 0, 0, Forward::none(), None);
        h.version = *SUPPORTED_VERSIONS.end() + 1;
        match h.check_version() {
            Err(Error::VersionError { got, .. }) => assert_eq!(got, *SUPPORTED_VERSIONS.end() + 1),
            other => panic!("expected VersionError, got {other:?}"),
        }
    }

    #[test]
    fn check_version_accepts_in_range() {
        for v in SUPPORTED_VERSIONS {
            let h = Header::init_from_message(v, 0, 0, Forward::none(), None);
            assert!(h.check_version().is_ok());
        }
    }

    #[test]
    fn zero_origin_address_decodes_to_none() {
        let h = Header::init_from_message(9, 0, 0, Forward::none(), None);
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        let got = Header::read_from(Cursor::new(buf.as_slice())).unwrap();
        assert_eq!(got.origin_address, None);
    }
}
