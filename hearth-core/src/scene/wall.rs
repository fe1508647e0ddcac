use serde::{Deserialize, Serialize};

use super::token::Colour;

pub type WallId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wall {
    pub id: WallId,
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
    pub colour: Colour,
    pub scattering: u8,
}
