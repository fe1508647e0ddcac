use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::ItemId;
use crate::keystore::{self, KeyMap};

pub type TokenId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Colour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Colour {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// A placed token.
///
/// Rotation is a byte where 256 steps make a full turn. The three lighting
/// arrays describe a light cycle: one colour row per stage, one colour per
/// timing step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Token {
    pub id: TokenId,
    pub source: ItemId,
    pub x: i64,
    pub y: i64,
    pub width: u64,
    pub height: u64,
    pub rotation: u8,
    pub flip: bool,
    pub flop: bool,
    pub snap: bool,
    pub light_colours: Vec<Vec<Colour>>,
    pub light_stages: Vec<u64>,
    pub light_timings: Vec<u64>,
    pub token_data: KeyMap,
}

impl Token {
    pub fn check_lighting(&self) -> Result<()> {
        check_lighting(&self.light_colours, &self.light_stages, &self.light_timings)
    }

    /// The token with admin-only data removed.
    pub fn guest_view(&self) -> Token {
        Token {
            token_data: keystore::user_visible(&self.token_data),
            ..self.clone()
        }
    }

    /// Apply a partial update, returning the admin and guest diffs, or
    /// `None` when nothing changed. Lighting must have been checked with
    /// [`TokenUpdate::check`] first.
    pub fn apply(&mut self, update: TokenUpdate) -> Option<(TokenUpdate, TokenUpdate)> {
        let mut admin = TokenUpdate {
            id: self.id,
            ..TokenUpdate::default()
        };

        macro_rules! diff {
            ($($field:ident),*) => {$(
                if let Some(value) = update.$field {
                    if self.$field != value {
                        self.$field = value.clone();
                        admin.$field = Some(value);
                    }
                }
            )*};
        }
        diff!(source, x, y, width, height, rotation, flip, flop, snap, light_colours, light_stages, light_timings);

        let mut guest = TokenUpdate {
            token_data: None,
            remove_token_data: None,
            ..admin.clone()
        };

        let mut deltas = Vec::new();
        if let Some(updates) = update.token_data {
            deltas.extend(keystore::set_keys(&mut self.token_data, updates));
        }
        if let Some(keys) = update.remove_token_data {
            deltas.extend(keystore::remove_keys(&mut self.token_data, &keys));
        }
        for delta in deltas {
            merge_key_change(&mut admin, delta.admin);
            merge_key_change(&mut guest, delta.guest);
        }

        (!admin.is_empty()).then_some((admin, guest))
    }
}

fn merge_key_change(update: &mut TokenUpdate, change: keystore::KeyChange) {
    if !change.setting.is_empty() {
        update.token_data.get_or_insert_with(KeyMap::new).extend(change.setting);
    }
    if !change.removing.is_empty() {
        update.remove_token_data.get_or_insert_with(Vec::new).extend(change.removing);
    }
}

/// Every stage needs a colour row and every row needs one colour per timing.
pub fn check_lighting(colours: &[Vec<Colour>], stages: &[u64], timings: &[u64]) -> Result<()> {
    if colours.len() != stages.len() || colours.iter().any(|row| row.len() != timings.len()) {
        return Err(Error::InvalidLighting);
    }
    Ok(())
}

/// Partial token update. `None` fields are left alone; serialized diffs only
/// carry the fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUpdate {
    pub id: TokenId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ItemId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flop: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_colours: Option<Vec<Vec<Colour>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_stages: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_timings: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_data: Option<KeyMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_token_data: Option<Vec<String>>,
}

impl TokenUpdate {
    /// Validate the lighting arrays this update would leave on `token`.
    pub fn check(&self, token: &Token) -> Result<()> {
        check_lighting(
            self.light_colours.as_deref().unwrap_or(&token.light_colours),
            self.light_stages.as_deref().unwrap_or(&token.light_stages),
            self.light_timings.as_deref().unwrap_or(&token.light_timings),
        )
    }

    /// True when only the ID is set.
    pub fn is_empty(&self) -> bool {
        *self == TokenUpdate {
            id: self.id,
            ..TokenUpdate::default()
        }
    }
}
