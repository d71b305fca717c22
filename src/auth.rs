//! Auth Adapter (spec §4.3): the thin contract this crate depends on for
//! credential creation, (de)serialization, and verification, plus the
//! `authinfo` options-string parser that feeds it a TTL and an optional
//! socket path.
//!
//! The concrete authentication mechanism (munge, JWT, whatever a
//! deployment plugs in) is explicitly out of scope (spec §1); this module
//! only defines the seam and a pair of reference implementations used by
//! this crate's own tests.

use std::time::{Duration, SystemTime};

use crate::error::Error;

/// Parsed form of the `authinfo` configuration string: `key=value[,key=value]*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthInfo<'a> {
    pub ttl: Duration,
    pub socket: Option<&'a str>,
}

/// Parses an `authinfo` string (spec §4.3). Unknown keys are ignored (the
/// string is a shared options bag; other auth plugins may define keys this
/// crate doesn't care about). A missing or negative `ttl=` yields a TTL of
/// zero, matching spec §8's quantified TTL-parsing invariant.
pub fn parse_authinfo(raw: &str) -> AuthInfo<'_> {
    let mut ttl = Duration::ZERO;
    let mut socket = None;

    for kv in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((key, value)) = kv.split_once('=') else {
            continue;
        };
        match key.trim() {
            "ttl" => {
                if let Ok(secs) = value.trim().parse::<i64>() {
                    if secs >= 0 {
                        ttl = Duration::from_secs(secs as u64);
                    }
                }
            }
            "socket" => socket = Some(value.trim()),
            _ => {}
        }
    }

    AuthInfo { ttl, socket }
}

/// An opaque auth credential, created and consumed only through this
/// trait. Implementations are free to store whatever internal shape they
/// like (a signed token, a kernel credential handle, ...); the core only
/// ever touches the packed bytes.
pub trait Authenticator: Send + Sync {
    /// The opaque in-memory credential type this implementation produces.
    type Credential: Clone + Send + Sync;

    /// Creates a new credential bound to `secret`, stamped with the
    /// current time so callers can later decide whether it has outlived
    /// its TTL.
    fn create(&self, index: u32, secret: &[u8]) -> Result<Self::Credential, Error>;

    /// Serializes `cred` into `buf`, length-prefixed, for a message
    /// encoded under the given protocol `version`.
    fn pack(&self, cred: &Self::Credential, buf: &mut Vec<u8>, version: u16) -> Result<(), Error>;

    /// Parses a credential out of `buf` (which contains exactly one
    /// packed credential, produced by [`Authenticator::pack`]).
    fn unpack(&self, buf: &[u8], version: u16) -> Result<Self::Credential, Error>;

    /// Verifies `cred` was produced for `secret` and hasn't expired.
    fn verify(&self, cred: &Self::Credential, secret: &[u8]) -> Result<(), Error>;

    /// The uid embedded in `cred`, when it can be derived without a full
    /// verification pass (used for version-mismatch diagnostics, spec §4.2).
    fn uid(&self, cred: &Self::Credential) -> Option<u32>;

    /// The replica index this credential was minted against (spec §4.3's
    /// `index_of`), used to detect credentials signed for the wrong
    /// controller in a failover scenario.
    fn index_of(&self, cred: &Self::Credential) -> u32;

    /// Releases any resources held by `cred` (a no-op for most
    /// implementations; exists for parity with plugins that hold external
    /// handles, e.g. a kernel keyring entry).
    fn destroy(&self, _cred: Self::Credential) {}
}

/// A minimal, deliberately insecure [`Authenticator`] used by this crate's
/// own tests and as a template for a real implementation. It signs
/// `(index, uid, created_at, secret)` with a trivial checksum — not a real
/// MAC — and should never be used outside tests.
#[derive(Debug, Default)]
pub struct InsecureTestAuthenticator {
    pub uid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsecureCredential {
    pub index: u32,
    pub uid: u32,
    pub created_at: Duration,
    checksum: u64,
}

impl InsecureTestAuthenticator {
    fn checksum(index: u32, uid: u32, created_at: Duration, secret: &[u8]) -> u64 {
        let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in index
            .to_be_bytes()
            .iter()
            .chain(uid.to_be_bytes().iter())
            .chain(created_at.as_secs().to_be_bytes().iter())
            .chain(secret.iter())
        {
            acc ^= *byte as u64;
            acc = acc.wrapping_mul(0x0000_0100_0000_01B3);
        }
        acc
    }
}

impl Authenticator for InsecureTestAuthenticator {
    type Credential = InsecureCredential;

    fn create(&self, index: u32, secret: &[u8]) -> Result<Self::Credential, Error> {
        let created_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let checksum = Self::checksum(index, self.uid, created_at, secret);
        Ok(InsecureCredential {
            index,
            uid: self.uid,
            created_at,
            checksum,
        })
    }

    fn pack(&self, cred: &Self::Credential, buf: &mut Vec<u8>, _version: u16) -> Result<(), Error> {
        buf.extend_from_slice(&cred.index.to_be_bytes());
        buf.extend_from_slice(&cred.uid.to_be_bytes());
        buf.extend_from_slice(&cred.created_at.as_secs().to_be_bytes());
        buf.extend_from_slice(&cred.checksum.to_be_bytes());
        Ok(())
    }

    fn unpack(&self, buf: &[u8], _version: u16) -> Result<Self::Credential, Error> {
        if buf.len() != 4 + 4 + 8 + 8 {
            return Err(Error::AuthError("truncated credential".into()));
        }
        let index = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let uid = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let created_at = Duration::from_secs(u64::from_be_bytes(buf[8..16].try_into().unwrap()));
        let checksum = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        Ok(InsecureCredential {
            index,
            uid,
            created_at,
            checksum,
        })
    }

    fn verify(&self, cred: &Self::Credential, secret: &[u8]) -> Result<(), Error> {
        let want = Self::checksum(cred.index, cred.uid, cred.created_at, secret);
        if want == cred.checksum {
            Ok(())
        } else {
            Err(Error::AuthError("credential checksum mismatch".into()))
        }
    }

    fn uid(&self, cred: &Self::Credential) -> Option<u32> {
        Some(cred.uid)
    }

    fn index_of(&self, cred: &Self::Credential) -> u32 {
        cred.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authinfo_parses_ttl() {
        assert_eq!(parse_authinfo("ttl=30").ttl, Duration::from_secs(30));
    }

    #[test]
    fn authinfo_negative_ttl_is_zero() {
        assert_eq!(parse_authinfo("ttl=-5").ttl, Duration::ZERO);
    }

    #[test]
    fn authinfo_missing_ttl_is_zero() {
        assert_eq!(parse_authinfo("socket=/run/auth.sock").ttl, Duration::ZERO);
    }

    #[test]
    fn authinfo_parses_socket_and_ttl_together() {
        let a = parse_authinfo("ttl=60,socket=/run/auth.sock");
        assert_eq!(a.ttl, Duration::from_secs(60));
        assert_eq!(a.socket, Some("/run/auth.sock"));
    }

    #[test]
    fn authinfo_ignores_unknown_keys() {
        let a = parse_authinfo("foo=bar,ttl=12");
        assert_eq!(a.ttl, Duration::from_secs(12));
    }

    #[test]
    fn credential_round_trips() {
        let auth = InsecureTestAuthenticator { uid: 501 };
        let secret = b"shared-secret";
        let cred = auth.create(0, secret).unwrap();

        let mut buf = Vec::new();
        auth.pack(&cred, &mut buf, 9).unwrap();
        let got = auth.unpack(&buf, 9).unwrap();

        assert_eq!(got, cred);
        auth.verify(&got, secret).expect("verification should pass");
        assert_eq!(auth.uid(&got), Some(501));
        assert_eq!(auth.index_of(&got), 0);
    }

    #[test]
    fn credential_fails_verification_under_wrong_secret() {
        let auth = InsecureTestAuthenticator { uid: 501 };
        let cred = auth.create(0, b"secret-a").unwrap();
        assert!(auth.verify(&cred, b"secret-b").is_err());
    }
}
