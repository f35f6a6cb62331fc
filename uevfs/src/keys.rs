//! Encryption key identifiers, AES keys, and the provider's key store.
//!
//! Encrypted containers declare a [`KeyId`] (a 128-bit GUID) naming the key
//! that decrypts them. Several containers may share one id, e.g. a base
//! archive and its patch chunks. The [`KeyStore`] records which ids have been
//! resolved to a working [`AesKey`] and which ids are still blocking at least
//! one container.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VfsError;

/// Length of an AES-256 key in bytes.
pub const AES_KEY_LEN: usize = 32;

/// Identifier correlating an encrypted container with its key.
///
/// Stored as four 32-bit words. Parsed from 32 hex digits, with an optional
/// `0x` prefix and optional `-` separators. The all-zero id is used by
/// containers encrypted with the game's main key.
///
/// # Example
///
/// ```
/// use uevfs::keys::KeyId;
///
/// let id: KeyId = "0x1A2B3C4D-00000000-00000000-DEADBEEF".parse().unwrap();
/// assert_eq!(id.to_string(), "1A2B3C4D0000000000000000DEADBEEF");
/// assert!(!id.is_main());
/// assert!(KeyId::MAIN.is_main());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KeyId {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}

impl KeyId {
    /// The all-zero id naming the main key.
    pub const MAIN: KeyId = KeyId::new(0, 0, 0, 0);

    /// Create a key id from its four words.
    pub const fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self { a, b, c, d }
    }

    /// Check if this is the main-key id.
    pub fn is_main(&self) -> bool {
        *self == Self::MAIN
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}{:08X}", self.a, self.b, self.c, self.d)
    }
}

impl FromStr for KeyId {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| VfsError::InvalidKeyId {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let digits: String = strip_hex_prefix(s.trim())
            .chars()
            .filter(|c| *c != '-')
            .collect();

        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("not hexadecimal"));
        }
        if digits.len() != 32 {
            return Err(invalid("expected 32 hex digits"));
        }

        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let chunk = &digits[i * 8..(i + 1) * 8];
            *word = u32::from_str_radix(chunk, 16).map_err(|_| invalid("not hexadecimal"))?;
        }

        Ok(Self::new(words[0], words[1], words[2], words[3]))
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 256-bit AES key.
///
/// The `Debug` output is redacted so keys never end up in logs by accident.
///
/// # Example
///
/// ```
/// use uevfs::keys::AesKey;
///
/// let key: AesKey = format!("0x{}", "AB".repeat(32)).parse().unwrap();
/// assert_eq!(key.as_bytes()[0], 0xAB);
/// assert_eq!(format!("{:?}", key), "AesKey(..)");
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AesKey([u8; AES_KEY_LEN]);

impl AesKey {
    /// Create a key from raw bytes.
    pub const fn new(bytes: [u8; AES_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }

    /// Uppercase hex representation with a `0x` prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

impl FromStr for AesKey {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| VfsError::InvalidAesKey(e.to_string()))?;

        let bytes: [u8; AES_KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            VfsError::InvalidAesKey(format!(
                "expected {} bytes, got {}",
                AES_KEY_LEN,
                v.len()
            ))
        })?;

        Ok(Self(bytes))
    }
}

impl From<[u8; AES_KEY_LEN]> for AesKey {
    fn from(bytes: [u8; AES_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Resolved keys and still-required key ids.
///
/// Every operation is safe to call concurrently from independent mount tasks.
/// A resolved id keeps the first key recorded for it.
#[derive(Debug, Default)]
pub struct KeyStore {
    resolved: DashMap<KeyId, AesKey>,
    required: DashSet<KeyId>,
}

impl KeyStore {
    /// Create an empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a working key for `id`.
    ///
    /// Returns `true` if the id was newly resolved. An already-resolved id
    /// keeps its existing key.
    pub fn resolve(&self, id: KeyId, key: AesKey) -> bool {
        match self.resolved.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(key);
                true
            }
        }
    }

    /// Check if `id` has a resolved key.
    pub fn is_resolved(&self, id: &KeyId) -> bool {
        self.resolved.contains_key(id)
    }

    /// Get the resolved key for `id`.
    pub fn get(&self, id: &KeyId) -> Option<AesKey> {
        self.resolved.get(id).map(|k| k.value().clone())
    }

    /// Mark `id` as blocking at least one container.
    pub fn mark_required(&self, id: KeyId) {
        self.required.insert(id);
    }

    /// Remove `id` from the required set.
    pub fn clear_required(&self, id: &KeyId) {
        self.required.remove(id);
    }

    /// Check if `id` is in the required set.
    pub fn is_required(&self, id: &KeyId) -> bool {
        self.required.contains(id)
    }

    /// Snapshot of all resolved keys.
    pub fn resolved(&self) -> HashMap<KeyId, AesKey> {
        self.resolved
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Snapshot of still-required ids, sorted.
    pub fn required(&self) -> Vec<KeyId> {
        let mut ids: Vec<KeyId> = self.required.iter().map(|id| *id).collect();
        ids.sort();
        ids
    }
}
