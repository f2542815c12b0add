use const_hex::FromHex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Debug, Display, Error, Formatter},
    str::FromStr,
};

use crate::{KEY_LEN, N_BUCKETS};

/// 160-bit identifier for nodes and stored values.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Default, Deserialize, Serialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Returns a uniformly random Key.
    pub fn random() -> Key {
        Key(rand::random())
    }

    /// Returns the SHA-1 Key of data.
    pub fn hash(data: &[u8]) -> Key {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data);
        Key(hasher.digest().bytes())
    }

    /// XORs two Keys
    pub fn distance(&self, y: &Key) -> Distance {
        let mut res = [0; KEY_LEN];
        for i in 0usize..KEY_LEN {
            res[i] = self.0[i] ^ y.0[i];
        }
        Distance(res)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        for x in self.0.iter() {
            write!(f, "{0:02x}", x)?;
        }
        Ok(())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        Debug::fmt(self, f)
    }
}

impl FromStr for Key {
    type Err = const_hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_hex(s)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromHex for Key {
    type Error = const_hex::FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        let mut key = [0u8; KEY_LEN];
        const_hex::decode_to_slice(hex, &mut key)?;
        Ok(Key(key))
    }
}

/// XOR distance between two Keys, ordered by unsigned magnitude.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    /// Number of leading zero bits, in `0..=160`. A distance of zero
    /// yields [N_BUCKETS], which maps to no bucket.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        N_BUCKETS
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        for x in self.0.iter() {
            write!(f, "{0:02x}", x)?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Distance {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
