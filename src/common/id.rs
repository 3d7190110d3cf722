//! Kademlia node Id or a storage key, and the XOR metric over them.
use bytes::Bytes;
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

/// The default size of node Ids and keys in bits.
pub const DEFAULT_ID_BITS: usize = 160;
/// The size in bits of Ids derived from an address with [Id::from_address].
pub const ADDRESS_ID_BITS: usize = 160;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kademlia node Id or a storage key.
///
/// The width is fixed when the Id is created; all Ids within one node share
/// the same width `B`.
pub struct Id(Bytes);

impl Id {
    /// Generate a random Id with `bits` width.
    ///
    /// # Panics
    ///
    /// If `bits` is zero or not a multiple of 8.
    pub fn random(bits: usize) -> Id {
        assert!(
            bits > 0 && bits % 8 == 0,
            "Id width must be a non zero multiple of 8, got {bits}"
        );

        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..bits / 8).map(|_| rng.gen()).collect();

        Id(bytes.into())
    }

    /// Create a new Id from some bytes. Returns `None` if `bytes` is empty.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Option<Id> {
        let bytes = bytes.as_ref();

        if bytes.is_empty() {
            return None;
        }

        Some(Id(Bytes::copy_from_slice(bytes)))
    }

    /// Id from a non empty hash digest.
    pub(crate) fn from_digest(digest: Vec<u8>) -> Id {
        debug_assert!(!digest.is_empty(), "empty digest");

        Id(digest.into())
    }

    /// Deterministic 160 bits Id for a node listening on `address`.
    ///
    /// SHA-1 over the 16 bytes IPv6 form of the ip (IPv4 addresses are mapped)
    /// followed by the port as a little endian u32.
    pub fn from_address(address: SocketAddr) -> Id {
        let ip = match address.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };

        let mut hasher = Sha1::new();
        hasher.update(&ip.octets());
        hasher.update(&(address.port() as u32).to_le_bytes());

        Id(Bytes::copy_from_slice(&hasher.digest().bytes()))
    }

    /// Random Id that shares exactly `prefix_len` leading bits with `self`,
    /// which is the range of the bucket at that index in a routing table owned by `self`.
    pub fn random_at_prefix(&self, prefix_len: usize) -> Id {
        assert!(prefix_len < self.bits(), "prefix_len out of range");

        let mut bytes: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..self.0.len()).map(|_| rng.gen()).collect()
        };

        for index in 0..=prefix_len {
            let byte = index / 8;
            let mask = 0x80 >> (index % 8);

            // Same bits up to the prefix, then the first differing bit.
            let same = self.0[byte] & mask != 0;
            let bit = if index == prefix_len { !same } else { same };

            if bit {
                bytes[byte] |= mask;
            } else {
                bytes[byte] &= !mask;
            }
        }

        Id(bytes.into())
    }

    // === Getters ===

    /// Width of this Id in bits.
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    /// Width of this Id in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false, Ids are never empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    // === Metric ===

    /// XOR distance between this Id and another Id.
    ///
    /// # Panics
    ///
    /// If the two Ids have different widths.
    pub fn xor(&self, other: &Id) -> Distance {
        assert_eq!(
            self.0.len(),
            other.0.len(),
            "XOR distance between Ids of different widths"
        );

        Distance(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| a ^ b)
                .collect(),
        )
    }

    /// Number of leading bits shared between this Id and `other`.
    ///
    /// Equals [Self::bits] if both Ids are equal.
    pub fn common_prefix_len(&self, other: &Id) -> usize {
        self.xor(other).leading_zeros()
    }

    /// Compare `a` and `b` by their distance to `self`, ties broken by the raw value.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        a.xor(self).cmp(&b.xor(self)).then_with(|| a.cmp(b))
    }

    /// Returns `true` if `a` is strictly closer to `self` than `b`.
    pub fn closer_to(&self, a: &Id, b: &Id) -> bool {
        self.cmp_distance(a, b) == Ordering::Less
    }
}

/// Shorthand for `a.xor(b)`.
pub fn distance(a: &Id, b: &Id) -> Distance {
    a.xor(b)
}

/// Shorthand for `target.closer_to(a, b)`.
pub fn closer_to(target: &Id, a: &Id, b: &Id) -> bool {
    target.closer_to(a, b)
}

/// Shorthand for `a.common_prefix_len(b)`.
pub fn common_prefix_len(a: &Id, b: &Id) -> usize {
    a.common_prefix_len(b)
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl From<[u8; 20]> for Id {
    fn from(bytes: [u8; 20]) -> Id {
        Id(Bytes::copy_from_slice(&bytes))
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Id {
    type Err = InvalidIdHex;

    fn from_str(s: &str) -> Result<Id, InvalidIdHex> {
        if s.is_empty() || s.len() % 2 != 0 || !s.is_ascii() {
            return Err(InvalidIdHex(s.to_string()));
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| InvalidIdHex(s.to_string()))?;

        Ok(Id(bytes.into()))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid hex encoded Id: {0:?}")]
/// Failed to parse an [Id] from a hex string.
pub struct InvalidIdHex(String);

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// XOR of two [Id]s, ordered as an unsigned big endian integer.
pub struct Distance(Box<[u8]>);

impl Distance {
    /// Returns `true` if the two Ids were equal.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        self.0.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(")?;
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_address_golden_values() {
        let table = [
            (
                "127.0.0.1:0",
                "5fbda2308f8be2c4f2e58a8469f1e2b43e5b1f37",
            ),
            (
                "192.168.99.100:5000",
                "d61f08a1ee4b32c8d5846f9c7feff6148ffb9017",
            ),
        ];

        for (address, expected) in table {
            let id = Id::from_address(address.parse().unwrap());

            assert_eq!(id, Id::from_str(expected).unwrap());
            assert_eq!(id.to_string(), expected);
        }
    }

    #[test]
    fn from_address_is_deterministic_and_distinct() {
        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:6882".parse().unwrap();

        assert_eq!(Id::from_address(a), Id::from_address(a));
        assert_ne!(Id::from_address(a), Id::from_address(b));
        assert_eq!(Id::from_address(a).bits(), ADDRESS_ID_BITS);
    }

    #[test]
    fn distance_is_symmetric() {
        for bits in [8, 64, 160, 256] {
            let a = Id::random(bits);
            let b = Id::random(bits);

            assert_eq!(distance(&a, &b), distance(&b, &a));
            assert!(distance(&a, &a).is_zero());
            assert_eq!(a == b, distance(&a, &b).is_zero());
        }
    }

    #[test]
    fn common_prefix_len() {
        let a = Id::from_str("ff00").unwrap();

        assert_eq!(a.common_prefix_len(&a), 16);
        assert_eq!(a.common_prefix_len(&Id::from_str("7f00").unwrap()), 0);
        assert_eq!(a.common_prefix_len(&Id::from_str("fe00").unwrap()), 7);
        assert_eq!(a.common_prefix_len(&Id::from_str("ff80").unwrap()), 8);
        assert_eq!(a.common_prefix_len(&Id::from_str("ff01").unwrap()), 15);
    }

    #[test]
    fn closer_to() {
        let target = Id::from_str("0000").unwrap();
        let a = Id::from_str("0001").unwrap();
        let b = Id::from_str("0100").unwrap();

        assert!(target.closer_to(&a, &b));
        assert!(!target.closer_to(&b, &a));
        assert!(!target.closer_to(&a, &a));
        assert_eq!(target.cmp_distance(&a, &a), Ordering::Equal);
    }

    #[test]
    #[should_panic]
    fn mismatched_widths() {
        Id::random(160).xor(&Id::random(256));
    }

    #[test]
    fn random_at_prefix() {
        let id = Id::random(160);

        for prefix_len in [0, 1, 7, 8, 100, 159] {
            for _ in 0..10 {
                let random = id.random_at_prefix(prefix_len);
                assert_eq!(id.common_prefix_len(&random), prefix_len);
            }
        }
    }

    #[test]
    fn hex() {
        assert!(Id::from_str("").is_err());
        assert!(Id::from_str("abc").is_err());
        assert!(Id::from_str("zz").is_err());
        assert_eq!(Id::from_str("0aff").unwrap().as_bytes(), &[0x0a, 0xff]);
    }
}
