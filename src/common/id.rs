//! Kademlia node Id or a lookup target
use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;

use rand::Rng;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Bitwise XOR distance to `other`.
    ///
    /// The result compares as a 160-bit big-endian unsigned integer, so
    /// `a.xor(t) < b.xor(t)` means `a` is closer to `t` than `b` is.
    pub fn xor(&self, other: &Id) -> [u8; ID_SIZE] {
        let mut distance = [0; ID_SIZE];
        for i in 0..ID_SIZE {
            distance[i] = self.0[i] ^ other.0[i];
        }

        distance
    }

    /// The first 4 bytes as a big-endian u32.
    ///
    /// A 32-bit prefix is all the ranking hot paths need; full 160-bit
    /// distances are only compared where routing loops must be ruled out.
    pub fn prefix(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// True iff `self` is strictly closer to `target` than `other` is.
    pub fn closer_to(&self, other: &Id, target: &Id) -> bool {
        self.xor(target) < other.xor(target)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() % 2 != 0 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);
        for i in (0..s.len()).step_by(2) {
            let byte = u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| Error::InvalidIdSize(s.len() / 2))?;
            bytes.push(byte);
        }

        Id::from_bytes(bytes)
    }
}
