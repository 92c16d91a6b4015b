//! Content fingerprints used to join packets across the two captures.
//!
//! The device under test may rewrite transport checksums (NAT does), so the
//! checksum bytes are cut out of the payload before hashing:
//!
//! - TCP: hex characters `[32, 36)` (header bytes 16-17)
//! - UDP: hex characters `[12, 16)` (header bytes 6-7)
//!
//! The remaining characters are hashed with SHA-256 and the first 8 bytes of
//! the digest form the fingerprint. Collisions are tolerated; the fingerprint
//! is a join key, not an identity guarantee.

use std::fmt;
use std::ops::Range;

use sha2::{Digest, Sha256};

use crate::record::Protocol;

/// Checksum-invariant payload hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprints a payload prefix for the given protocol.
    pub fn compute(protocol: Protocol, payload: &str) -> Self {
        let mut hasher = Sha256::new();
        match checksum_range(protocol) {
            Some(range) => {
                let bytes = payload.as_bytes();
                let start = range.start.min(bytes.len());
                let end = range.end.min(bytes.len());
                hasher.update(&bytes[..start]);
                hasher.update(&bytes[end..]);
            }
            None => hasher.update(payload.as_bytes()),
        }

        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(head))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hex-character range of the transport checksum, if the protocol has one we skip.
pub fn checksum_range(protocol: Protocol) -> Option<Range<usize>> {
    match protocol {
        Protocol::Tcp => Some(32..36),
        Protocol::Udp => Some(12..16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TCP_PAYLOAD: &str = "13880050000000010000000050180200abcd0000474554202f20485454502f312e31";

    fn with_range_replaced(payload: &str, range: Range<usize>, fill: &str) -> String {
        let mut out = String::new();
        out.push_str(&payload[..range.start]);
        out.push_str(fill);
        out.push_str(&payload[range.end..]);
        out
    }

    #[test]
    fn test_tcp_checksum_ignored() {
        let rewritten = with_range_replaced(TCP_PAYLOAD, 32..36, "1234");
        assert_eq!(
            Fingerprint::compute(Protocol::Tcp, TCP_PAYLOAD),
            Fingerprint::compute(Protocol::Tcp, &rewritten)
        );
    }

    #[test]
    fn test_udp_checksum_ignored() {
        let payload = "0035c3500020ab12deadbeefcafef00d";
        let rewritten = with_range_replaced(payload, 12..16, "0000");
        assert_eq!(
            Fingerprint::compute(Protocol::Udp, payload),
            Fingerprint::compute(Protocol::Udp, &rewritten)
        );
    }

    #[test]
    fn test_change_outside_checksum_detected() {
        let rewritten = with_range_replaced(TCP_PAYLOAD, 40..44, "ffff");
        assert_ne!(
            Fingerprint::compute(Protocol::Tcp, TCP_PAYLOAD),
            Fingerprint::compute(Protocol::Tcp, &rewritten)
        );
    }

    #[test]
    fn test_icmp_hashes_everything() {
        let a = "0800f7ff00010001";
        let b = "0800f7fe00010001";
        assert_ne!(
            Fingerprint::compute(Protocol::Icmp, a),
            Fingerprint::compute(Protocol::Icmp, b)
        );
    }

    #[test]
    fn test_short_payload_does_not_panic() {
        let fp = Fingerprint::compute(Protocol::Tcp, "1388");
        assert_eq!(fp, Fingerprint::compute(Protocol::Tcp, "1388"));
    }

    #[test]
    fn test_display_is_hex() {
        let fp = Fingerprint::compute(Protocol::Udp, "00350035");
        assert_eq!(fp.to_string().len(), 16);
    }

    proptest! {
        #[test]
        fn checksum_bytes_never_change_tcp_fingerprint(
            payload in "[0-9a-f]{40,120}",
            fill in "[0-9a-f]{4}",
        ) {
            let rewritten = with_range_replaced(&payload, 32..36, &fill);
            prop_assert_eq!(
                Fingerprint::compute(Protocol::Tcp, &payload),
                Fingerprint::compute(Protocol::Tcp, &rewritten)
            );
        }

        #[test]
        fn payload_bytes_change_tcp_fingerprint(
            payload in "[0-9a-f]{40,120}",
            offset in 0usize..32,
        ) {
            let original = &payload[offset..offset + 1];
            let replacement = if original == "0" { "1" } else { "0" };
            let rewritten = with_range_replaced(&payload, offset..offset + 1, replacement);
            prop_assert_ne!(
                Fingerprint::compute(Protocol::Tcp, &payload),
                Fingerprint::compute(Protocol::Tcp, &rewritten)
            );
        }
    }
}
