use thiserror::Error;

use crate::storage::StoreError;

/// Errors surfaced to RPC callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] hearth_core::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    /// Also returned to guests calling admin methods.
    #[error("unknown method")]
    UnknownMethod,
    #[error("unknown map")]
    UnknownMap,
    #[error("map in use")]
    Conflict,
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("invalid password")]
    InvalidPassword,
}

impl Error {
    /// Message for the `error` field. Guests never see storage detail.
    pub fn public_message(&self, admin: bool) -> String {
        match self {
            Error::Storage(_) if !admin => "storage error".to_owned(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
