// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared error type for the acquisition and correlation plane.
//!
//! Individual modules (parsers, the fingerprint utility, SFTP reads) never
//! propagate errors for malformed input or missing files — those resolve to
//! `None` per the propagation policy. `KeyspiderError` exists for the
//! operations that genuinely cannot proceed: a pool that can't open a
//! session, a store that can't commit a transaction, a cancelled scan.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyspiderError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("SSH connect error: {0}")]
    Connect(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("cancelled")]
    Cancelled,
}

impl KeyspiderError {
    /// True for errors that represent a row already existing under a unique
    /// key, as opposed to a transport or logic failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KeyspiderError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyspiderError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, KeyspiderError>;
