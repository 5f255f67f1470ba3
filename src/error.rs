//! Error taxonomy.
//!
//! Framing problems never leave the transport, and a correlator timeout is
//! just `None`; what surfaces here are the failures a caller can act on:
//! value-domain rejections from the write path versus bus-level trouble.

use thiserror::Error;

use crate::codec::CodecError;

/// Failures of `write_param`, split so the REST layer can map the
/// value-domain cases to 4xx and the bus cases to 503.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("parameter not found: {0}")]
    NotFound(String),
    #[error("no structure info for parameter: {0}")]
    NoStruct(String),
    #[error("parameter is read-only: {0}")]
    ReadOnly(String),
    #[error("value {value} below minimum {min}")]
    BelowMinimum { value: f64, min: f64 },
    #[error("value {value} above maximum {max}")]
    AboveMaximum { value: f64, max: f64 },
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error("controller did not acknowledge write")]
    NotAcknowledged,
    #[error("controller not connected")]
    NotConnected,
}

impl WriteError {
    /// Value-domain rejection (caller's input) as opposed to a bus fault.
    pub fn is_validation(&self) -> bool {
        !matches!(self, WriteError::NotAcknowledged | WriteError::NotConnected)
    }
}
