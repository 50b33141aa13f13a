//! Assertion payload layout
//!
//! ```text
//! version: u8 (= 1)
//! repeated:
//!   address:          [u8; 32]
//!   expected_balance: u64 LE
//!   owner:            [u8; 32]   all zero = unchecked
//!   hash_len:         u32 LE
//!   hash:             [u8; hash_len]
//! ```

use crate::errors::DecodeError;
use crate::types::display_fromstr;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

pub const ASSERTION_LAYOUT_VERSION: u8 = 1;

const ENTRY_FIXED_LEN: usize = 32 + 8 + 32 + 4;

/// One asserted account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionEntry {
    #[serde(with = "display_fromstr")]
    pub address: Pubkey,
    /// Lamport floor, or token amount floor for token accounts
    pub expected_balance: u64,
    #[serde(default, with = "optional_pubkey")]
    pub owner: Option<Pubkey>,
    /// SHA-256 of the data or delegate; empty when unchecked
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

pub fn encode_entries(entries: &[AssertionEntry]) -> Vec<u8> {
    let capacity = 1 + entries
        .iter()
        .map(|e| ENTRY_FIXED_LEN + e.hash.len())
        .sum::<usize>();
    let mut out = Vec::with_capacity(capacity);
    out.push(ASSERTION_LAYOUT_VERSION);

    for entry in entries {
        out.extend_from_slice(entry.address.as_ref());
        out.extend_from_slice(&entry.expected_balance.to_le_bytes());
        match &entry.owner {
            Some(owner) => out.extend_from_slice(owner.as_ref()),
            None => out.extend_from_slice(&[0u8; 32]),
        }
        out.extend_from_slice(&(entry.hash.len() as u32).to_le_bytes());
        out.extend_from_slice(&entry.hash);
    }
    out
}

pub fn decode_entries(data: &[u8]) -> Result<Vec<AssertionEntry>, DecodeError> {
    let (&version, mut rest) = data
        .split_first()
        .ok_or_else(|| DecodeError::malformed("empty assertion payload"))?;
    if version != ASSERTION_LAYOUT_VERSION {
        return Err(DecodeError::UnexpectedDiscriminant {
            expected: ASSERTION_LAYOUT_VERSION as u32,
            found: version as u32,
        });
    }

    let mut entries = Vec::new();
    while !rest.is_empty() {
        if rest.len() < ENTRY_FIXED_LEN {
            return Err(DecodeError::malformed(format!(
                "truncated assertion entry: {} bytes left",
                rest.len()
            )));
        }
        let (address, tail) = rest.split_at(32);
        let (balance, tail) = tail.split_at(8);
        let (owner, tail) = tail.split_at(32);
        let (len, tail) = tail.split_at(4);

        let hash_len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if tail.len() < hash_len {
            return Err(DecodeError::malformed(format!(
                "assertion hash needs {} bytes, {} left",
                hash_len,
                tail.len()
            )));
        }
        let (hash, tail) = tail.split_at(hash_len);

        let mut balance_bytes = [0u8; 8];
        balance_bytes.copy_from_slice(balance);
        let owner = Pubkey::try_from(owner).map_err(|e| DecodeError::malformed(e.to_string()))?;

        entries.push(AssertionEntry {
            address: Pubkey::try_from(address).map_err(|e| DecodeError::malformed(e.to_string()))?,
            expected_balance: u64::from_le_bytes(balance_bytes),
            owner: (owner != Pubkey::default()).then_some(owner),
            hash: hash.to_vec(),
        });
        rest = tail;
    }
    Ok(entries)
}

mod optional_pubkey {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &Option<Pubkey>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(key) => serializer.collect_str(key),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Pubkey>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| Pubkey::from_str(&s).map_err(D::Error::custom))
            .transpose()
    }
}

mod hex_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let address = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let payload = encode_entries(&[AssertionEntry {
            address,
            expected_balance: 0x0102,
            owner: Some(owner),
            hash: vec![0xaa, 0xbb],
        }]);

        assert_eq!(payload.len(), 1 + ENTRY_FIXED_LEN + 2);
        assert_eq!(payload[0], 1);
        assert_eq!(&payload[1..33], address.as_ref());
        assert_eq!(&payload[33..41], &0x0102u64.to_le_bytes());
        assert_eq!(&payload[41..73], owner.as_ref());
        assert_eq!(&payload[73..77], &2u32.to_le_bytes());
        assert_eq!(&payload[77..], &[0xaa, 0xbb]);
    }

    #[test]
    fn test_unchecked_owner_is_zeroed() {
        let entry = AssertionEntry {
            address: Pubkey::new_unique(),
            expected_balance: 5,
            owner: None,
            hash: vec![],
        };
        let payload = encode_entries(std::slice::from_ref(&entry));
        assert!(payload[41..73].iter().all(|b| *b == 0));
        assert_eq!(decode_entries(&payload).unwrap(), vec![entry]);
    }

    #[test]
    fn test_decode_rejects_truncated_and_wrong_version() {
        let payload = encode_entries(&[AssertionEntry {
            address: Pubkey::new_unique(),
            expected_balance: 1,
            owner: None,
            hash: vec![1, 2, 3],
        }]);
        assert!(decode_entries(&payload[..payload.len() - 1]).is_err());
        assert!(decode_entries(&payload[..40]).is_err());

        let mut wrong = payload.clone();
        wrong[0] = 2;
        assert!(matches!(
            decode_entries(&wrong),
            Err(DecodeError::UnexpectedDiscriminant { found: 2, .. })
        ));
        assert!(decode_entries(&[]).is_err());
    }

    #[test]
    fn test_empty_payload_is_version_only() {
        assert_eq!(encode_entries(&[]), vec![ASSERTION_LAYOUT_VERSION]);
        assert!(decode_entries(&[ASSERTION_LAYOUT_VERSION]).unwrap().is_empty());
    }
}
