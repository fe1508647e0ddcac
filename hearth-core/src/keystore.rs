//! Keyed attribute bags with per-entry guest visibility.
//!
//! Characters, token data and map data all use the same shape: a map from
//! key to `{data, user}`, where `user` marks entries guests may see. Every
//! mutation yields a [`KeyDelta`] describing what changed for admins and
//! what changed for guests, or nothing when the update was a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::error::{Error, Result};

/// One entry in a bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyData {
    pub data: Value,
    #[serde(default)]
    pub user: bool,
}

impl KeyData {
    pub fn new(data: Value, user: bool) -> Self {
        Self { data, user }
    }
}

pub type KeyMap = BTreeMap<String, KeyData>;

/// Changes as seen by one audience.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyChange {
    pub setting: KeyMap,
    pub removing: Vec<String>,
}

impl KeyChange {
    pub fn is_empty(&self) -> bool {
        self.setting.is_empty() && self.removing.is_empty()
    }
}

/// Admin and guest views of one mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyDelta {
    pub admin: KeyChange,
    pub guest: KeyChange,
}

/// Apply `updates`, skipping entries identical to what is stored.
pub fn set_keys(entries: &mut KeyMap, updates: KeyMap) -> Option<KeyDelta> {
    let mut delta = KeyDelta::default();
    for (key, value) in updates {
        let was_visible = match entries.get(&key) {
            Some(old) if *old == value => continue,
            Some(old) => old.user,
            None => false,
        };
        if value.user {
            delta.guest.setting.insert(key.clone(), value.clone());
        } else if was_visible {
            delta.guest.removing.push(key.clone());
        }
        delta.admin.setting.insert(key.clone(), value.clone());
        entries.insert(key, value);
    }
    (!delta.admin.is_empty()).then_some(delta)
}

/// Remove `keys`; unknown keys are ignored.
pub fn remove_keys(entries: &mut KeyMap, keys: &[String]) -> Option<KeyDelta> {
    let mut delta = KeyDelta::default();
    for key in keys {
        if let Some(old) = entries.remove(key) {
            if old.user {
                delta.guest.removing.push(key.clone());
            }
            delta.admin.removing.push(key.clone());
        }
    }
    (!delta.admin.is_empty()).then_some(delta)
}

/// Read `keys` (or everything when `None`), hiding non-user entries from
/// guests.
pub fn get_keys(entries: &KeyMap, keys: Option<&[String]>, admin: bool) -> KeyMap {
    let visible = |v: &KeyData| admin || v.user;
    match keys {
        None => entries
            .iter()
            .filter(|(_, v)| visible(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Some(keys) => keys
            .iter()
            .filter_map(|k| entries.get_key_value(k))
            .filter(|(_, v)| visible(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// The guest-visible subset of a bag.
pub fn user_visible(entries: &KeyMap) -> KeyMap {
    get_keys(entries, None, false)
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    data: String,
    user: bool,
}

/// Encode a bag for the blob store. Values are kept as JSON text so the
/// binary framing never has to describe them.
pub fn encode_bag(entries: &KeyMap) -> Result<Vec<u8>> {
    let stored = entries
        .iter()
        .map(|(k, v)| -> Result<(String, StoredKey)> {
            let data = serde_json::to_string(&v.data).map_err(|e| Error::Codec(e.to_string()))?;
            Ok((k.clone(), StoredKey { data, user: v.user }))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    codec::pack(&stored)
}

pub fn decode_bag(bytes: &[u8]) -> Result<KeyMap> {
    let stored: BTreeMap<String, StoredKey> = codec::unpack(bytes)?;
    stored
        .into_iter()
        .map(|(k, v)| -> Result<(String, KeyData)> {
            let data = serde_json::from_str(&v.data).map_err(|e| Error::Codec(e.to_string()))?;
            Ok((k, KeyData { data, user: v.user }))
        })
        .collect()
}
