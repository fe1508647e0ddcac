//! Fog-of-war masks.
//!
//! A mask is a base opacity plus an ordered list of shapes, each encoded as
//! `[kind, ...coords]`:
//!
//! | kind | shape           | length          |
//! |------|-----------------|-----------------|
//! | 0, 1 | rect add/sub    | 5               |
//! | 2, 3 | ellipse add/sub | 5               |
//! | 4, 5 | polygon add/sub | odd, at least 7 |

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type Shape = Vec<u64>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mask {
    pub base_opaque: bool,
    pub masks: Vec<Shape>,
}

impl Mask {
    pub fn validate(&self) -> Result<()> {
        self.masks.iter().try_for_each(|shape| check_shape(shape))
    }
}

pub fn check_shape(shape: &[u64]) -> Result<()> {
    let valid = match shape.first() {
        Some(0..=3) => shape.len() == 5,
        Some(4 | 5) => shape.len() >= 7 && shape.len() % 2 == 1,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidMask)
    }
}
