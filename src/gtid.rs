use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::OplogError;

pub const GTID_KEY_LEN: usize = 16;

/// Global transaction identifier. Ordered by primary sequence first, then by
/// the sequence number handed out within that primary's term.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Gtid {
    pub primary: u64,
    pub seq: u64,
}

impl Gtid {
    pub const MIN: Gtid = Gtid { primary: 0, seq: 0 };
    pub const MAX: Gtid = Gtid {
        primary: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(primary: u64, seq: u64) -> Self {
        Self { primary, seq }
    }

    /// `None` once the sequence space of this primary is exhausted.
    pub fn next(&self) -> Option<Self> {
        Some(Self {
            primary: self.primary,
            seq: self.seq.checked_add(1)?,
        })
    }

    /// Big-endian so the byte order of keys matches `Ord`.
    pub fn to_key(&self) -> [u8; GTID_KEY_LEN] {
        let mut key = [0u8; GTID_KEY_LEN];
        key[..8].copy_from_slice(&self.primary.to_be_bytes());
        key[8..].copy_from_slice(&self.seq.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != GTID_KEY_LEN {
            bail!(OplogError::InvalidKey {
                what: "gtid",
                len: key.len(),
            });
        }

        let mut primary = [0u8; 8];
        let mut seq = [0u8; 8];
        primary.copy_from_slice(&key[..8]);
        seq.copy_from_slice(&key[8..]);

        Ok(Self {
            primary: u64::from_be_bytes(primary),
            seq: u64::from_be_bytes(seq),
        })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GTID({}, {})", self.primary, self.seq)
    }
}
