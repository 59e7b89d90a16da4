//! Error types surfaced by every public entry point.

use thiserror::Error;

/// The error type returned by all fallible `spline_store` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested key is not present in the engine.
    #[error("key not found")]
    NotFound,

    /// The fixed-size record for the key was found, but its variable-length
    /// blob has been overwritten by variable-data region wrap.
    #[error("variable data for key has been evicted by region wrap")]
    VarDataEvicted,

    /// A read or write against the underlying storage failed.
    #[error("storage I/O failure")]
    Io(#[from] std::io::Error),

    /// The supplied configuration describes an impossible geometry.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The spline index has exhausted its knot capacity; further inserts
    /// cannot be indexed. Prior state (all previously inserted knots) is
    /// left intact.
    #[error("spline knot capacity exhausted")]
    SplineOverflow,

    /// The caller attempted to insert a key smaller than the current
    /// maximum key, violating the monotone-insert contract.
    #[error("order violation: attempted to insert {attempted} after max key {previous_max}")]
    OrderViolation { previous_max: u64, attempted: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
