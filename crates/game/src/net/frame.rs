use crc32fast::Hasher;

/// Largest datagram the transport will emit or accept.
pub const MTU: usize = 1200;

/// Wire magic mixed into every checksum. Doubles as a wrong-game filter:
/// datagrams from anything else fail CRC verification and are dropped.
pub const PROTOCOL_ID: [u8; 4] = [0xAB, 0x55, 0xD7, 0x01];

pub fn checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&PROTOCOL_ID);
    hasher.update(body);
    hasher.finalize()
}

/// Prefix `body` with the big-endian CRC32 of `protocol_id ‖ body`.
pub fn seal(body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + 4);
    data.extend_from_slice(&checksum(body).to_be_bytes());
    data.extend_from_slice(body);
    data
}

pub fn verify(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    data[..4] == checksum(&data[4..]).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_round_trip() {
        let body = b"hello world";
        let framed = seal(body);
        assert!(verify(&framed));
        assert_eq!(&framed[4..], body);
    }

    #[test]
    fn corruption_fails_verification() {
        let mut framed = seal(b"payload");
        framed[6] ^= 0x40;
        assert!(!verify(&framed));
    }

    #[test]
    fn short_datagrams_fail_verification() {
        assert!(!verify(&[]));
        assert!(!verify(&[1, 2, 3]));
    }

    #[test]
    fn empty_body_round_trip() {
        assert!(verify(&seal(&[])));
    }
}
