use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An opaque peer identifier in the overlay's ring space.
///
/// Addresses are fixed-width big-endian integers, so the derived ordering is
/// the numeric ordering and is the same on every node. The ring topology only
/// relies on that total order; how far two addresses are from each other is
/// decided elsewhere.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; Address::MEM_SIZE]);

impl Address {
    /// Size in bytes of an address when written on the wire.
    pub const MEM_SIZE: usize = 20;

    const URI_PREFIX: &'static str = "ringlink:node:";

    pub const fn new(bytes: [u8; Self::MEM_SIZE]) -> Self {
        Address(bytes)
    }

    /// Returns a new random address.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; Self::MEM_SIZE];
        rand::thread_rng().fill(&mut bytes);
        Address(bytes)
    }

    /// Reads an address from the first [`Address::MEM_SIZE`] bytes of `buf`.
    pub fn from_slice(buf: &[u8]) -> Result<Self, AddressError> {
        if buf.len() < Self::MEM_SIZE {
            return Err(AddressError::Truncated {
                len: buf.len(),
                expected: Self::MEM_SIZE,
            });
        }
        let mut bytes = [0u8; Self::MEM_SIZE];
        bytes.copy_from_slice(&buf[..Self::MEM_SIZE]);
        Ok(Address(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::MEM_SIZE] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address needs {expected} bytes, got {len}")]
    Truncated { len: usize, expected: usize },
    #[error("address must start with `{}`", Address::URI_PREFIX)]
    MissingPrefix,
    #[error("invalid address encoding: {0}")]
    Encoding(#[from] bs58::decode::Error),
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            Self::URI_PREFIX,
            bs58::encode(&self.0).into_string()
        )
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the full form is unwieldy in logs
        let encoded = bs58::encode(&self.0).into_string();
        write!(f, "Address({})", &encoded[..encoded.len().min(8)])
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(Self::URI_PREFIX)
            .ok_or(AddressError::MissingPrefix)?;
        let decoded = bs58::decode(encoded).into_vec()?;
        if decoded.len() != Self::MEM_SIZE {
            return Err(AddressError::Truncated {
                len: decoded.len(),
                expected: Self::MEM_SIZE,
            });
        }
        Address::from_slice(&decoded)
    }
}

impl From<[u8; Address::MEM_SIZE]> for Address {
    fn from(bytes: [u8; Address::MEM_SIZE]) -> Self {
        Address(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_with_tail(tail: u8) -> Address {
        let mut bytes = [0u8; Address::MEM_SIZE];
        bytes[Address::MEM_SIZE - 1] = tail;
        Address::new(bytes)
    }

    #[test]
    fn ordering_is_numeric() {
        let low = addr_with_tail(4);
        let high = Address::new([0xFF; Address::MEM_SIZE]);
        assert!(low < high);
        assert!(addr_with_tail(3) < low);

        let mut leading = [0u8; Address::MEM_SIZE];
        leading[0] = 1;
        assert!(Address::new(leading) > addr_with_tail(0xFF));
    }

    #[test]
    fn display_parses_back() {
        let addr = Address::random();
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn rejects_foreign_prefix() {
        assert!(matches!(
            "node:abc".parse::<Address>(),
            Err(AddressError::MissingPrefix)
        ));
    }

    #[test]
    fn from_slice_needs_full_width() {
        assert!(matches!(
            Address::from_slice(&[1, 2, 3]),
            Err(AddressError::Truncated { len: 3, .. })
        ));
        let mut buf = vec![7u8; Address::MEM_SIZE];
        buf.extend_from_slice(b"trailing payload");
        assert_eq!(
            Address::from_slice(&buf).unwrap(),
            Address::new([7; Address::MEM_SIZE])
        );
    }
}
