use serde::{Deserialize, Serialize};

use super::token::{Token, TokenId};
use super::wall::{Wall, WallId};

pub type LayerId = u32;

pub(crate) const ROOT: LayerId = 0;

pub const GRID: &str = "Grid";
pub const LIGHT: &str = "Light";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    Folder(Vec<LayerId>),
    Tokens { tokens: Vec<TokenId>, walls: Vec<WallId> },
    Grid,
    Light,
}

impl LayerKind {
    pub(crate) fn tokens() -> Self {
        LayerKind::Tokens {
            tokens: Vec::new(),
            walls: Vec::new(),
        }
    }

    /// Grid and Light are pinned to the root.
    pub fn is_fixed(&self) -> bool {
        matches!(self, LayerKind::Grid | LayerKind::Light)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub hidden: bool,
    pub parent: Option<LayerId>,
    pub kind: LayerKind,
}

/// Which layer kinds a path lookup accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFilter {
    /// Token layers only.
    Leaf,
    Folder,
    Any,
}

impl LayerFilter {
    pub fn accepts(self, kind: &LayerKind) -> bool {
        match self {
            LayerFilter::Leaf => matches!(kind, LayerKind::Tokens { .. }),
            LayerFilter::Folder => matches!(kind, LayerKind::Folder(_)),
            LayerFilter::Any => true,
        }
    }
}

/// Serialized form of one layer and everything below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LayerSnapshot {
    Folder {
        name: String,
        #[serde(default)]
        hidden: bool,
        #[serde(default)]
        children: Vec<LayerSnapshot>,
    },
    Tokens {
        name: String,
        #[serde(default)]
        hidden: bool,
        #[serde(default)]
        tokens: Vec<Token>,
        #[serde(default)]
        walls: Vec<Wall>,
    },
    Grid {
        #[serde(default)]
        hidden: bool,
    },
    Light {
        #[serde(default)]
        hidden: bool,
    },
}
