//! # 256-bit Identifiers
//!
//! Everything in the network is addressed by a 32-byte big-endian integer:
//! node identities, document keys, and routing targets all share the [`Id`]
//! type.
//!
//! Distance between two IDs is their bitwise XOR interpreted as an unsigned
//! 256-bit integer. [`distance_cmp`] orders raw distances, and the small
//! arithmetic helpers ([`Id::midpoint`], [`Id::successor`]) support the
//! routing table's interval bookkeeping.

use serde::{Deserialize, Serialize};

/// Byte length of every identifier.
pub const ID_LENGTH: usize = 32;

/// A 256-bit identifier, ordered as a big-endian unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; ID_LENGTH]);

/// Error for malformed identifier encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    /// Input was not exactly 32 bytes.
    InvalidLength(usize),
    /// Input was not valid hex.
    InvalidHex,
}

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdError::InvalidLength(n) => {
                write!(f, "identifier must be {} bytes, got {}", ID_LENGTH, n)
            }
            IdError::InvalidHex => write!(f, "identifier is not valid hex"),
        }
    }
}

impl std::error::Error for IdError {}

impl Id {
    /// The zero identifier (lower bound of the ID space).
    pub const ZERO: Id = Id([0x00; ID_LENGTH]);

    /// The all-ones identifier (upper bound of the ID space).
    pub const MAX: Id = Id([0xFF; ID_LENGTH]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != ID_LENGTH {
            return Err(IdError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; ID_LENGTH];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Sample a uniformly random identifier.
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// XOR distance to another identifier.
    #[inline]
    pub fn distance(&self, other: &Id) -> [u8; ID_LENGTH] {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading zero bits in the XOR distance to `other`.
    pub fn prefix_len(&self, other: &Id) -> u32 {
        let mut zeros = 0u32;
        for byte in self.distance(other) {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        Self::from_slice(&bytes)
    }

    /// `lo + (hi - lo) / 2`, the midpoint of the inclusive interval `[lo, hi]`.
    ///
    /// Requires `lo <= hi`.
    pub fn midpoint(lo: &Id, hi: &Id) -> Id {
        debug_assert!(lo <= hi);
        let span = sub(hi.as_bytes(), lo.as_bytes());
        let half = shr1(&span);
        Id(add(lo.as_bytes(), &half))
    }

    /// The next identifier, `self + 1`. Saturates at [`Id::MAX`].
    pub fn successor(&self) -> Id {
        if *self == Id::MAX {
            return Id::MAX;
        }
        let one = {
            let mut b = [0u8; ID_LENGTH];
            b[ID_LENGTH - 1] = 1;
            b
        };
        Id(add(&self.0, &one))
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LENGTH], b: &[u8; ID_LENGTH]) -> std::cmp::Ordering {
    a.cmp(b)
}

fn add(a: &[u8; ID_LENGTH], b: &[u8; ID_LENGTH]) -> [u8; ID_LENGTH] {
    let mut out = [0u8; ID_LENGTH];
    let mut carry = 0u16;
    for i in (0..ID_LENGTH).rev() {
        let sum = a[i] as u16 + b[i] as u16 + carry;
        out[i] = (sum & 0xFF) as u8;
        carry = sum >> 8;
    }
    out
}

fn sub(a: &[u8; ID_LENGTH], b: &[u8; ID_LENGTH]) -> [u8; ID_LENGTH] {
    let mut out = [0u8; ID_LENGTH];
    let mut borrow = 0i16;
    for i in (0..ID_LENGTH).rev() {
        let diff = a[i] as i16 - b[i] as i16 - borrow;
        if diff < 0 {
            out[i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            out[i] = diff as u8;
            borrow = 0;
        }
    }
    out
}

fn shr1(a: &[u8; ID_LENGTH]) -> [u8; ID_LENGTH] {
    let mut out = [0u8; ID_LENGTH];
    let mut carry = 0u8;
    for i in 0..ID_LENGTH {
        out[i] = (a[i] >> 1) | (carry << 7);
        carry = a[i] & 1;
    }
    out
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LENGTH]> for Id {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<Id> for [u8; ID_LENGTH] {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
