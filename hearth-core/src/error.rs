use thiserror::Error;

/// Coarse classification of [`Error`], used by the RPC layer to decide
/// how much detail a caller gets to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    InvalidState,
}

/// Domain errors for folders, keystores and scenes.
///
/// The `Display` strings travel verbatim in RPC `error` fields, so they are
/// kept short and stable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("folder not found")]
    FolderNotFound,
    #[error("item not found")]
    ItemNotFound,
    #[error("unknown key")]
    UnknownKey,
    #[error("unknown layer")]
    UnknownLayer,
    #[error("invalid layer path")]
    InvalidLayerPath,
    #[error("unknown token")]
    UnknownToken,
    #[error("unknown wall")]
    UnknownWall,
    #[error("invalid lighting")]
    InvalidLighting,
    #[error("invalid mask")]
    InvalidMask,
    #[error("invalid path")]
    InvalidPath,
    #[error("ids exhausted")]
    IdsExhausted,
    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FolderNotFound
            | Error::ItemNotFound
            | Error::UnknownKey
            | Error::UnknownLayer
            | Error::UnknownToken
            | Error::UnknownWall => ErrorKind::NotFound,
            Error::InvalidMask | Error::InvalidPath | Error::Codec(_) => ErrorKind::InvalidInput,
            Error::InvalidLayerPath | Error::InvalidLighting | Error::IdsExhausted => ErrorKind::InvalidState,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
