//! Error types for the core library.

use thiserror::Error;

use crate::codec::{DecodeError, EncodeError};
use crate::coordinator::{ConnectError, ConnectFailure};
use crate::primitive::TransportError;
use crate::registry::TransitionError;
use crate::store::StoreError;

/// Umbrella error for hosts that surface every core failure through one type.
#[derive(Error, Debug)]
pub enum Error {
    /// Connect, accept or decline could not be started
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Session could not be established or was lost
    #[error("could not connect: {0}")]
    ConnectFailed(#[from] ConnectFailure),

    /// Persistence failure
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
