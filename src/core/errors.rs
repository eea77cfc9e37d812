// src/core/errors.rs

//! Defines the primary error type for the daemon.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the group membership core.
///
/// Most of these are never returned across the client IPC boundary (per
/// spec §7, user-visible failure travels back through callbacks and
/// `dump`, not numeric error codes); this type exists to give every
/// fallible internal path a typed, loggable shape.
#[derive(Error, Debug, Clone)]
pub enum GroupdError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("incomplete data in stream")]
    IncompleteData,

    #[error("malformed wire message: {0}")]
    MalformedMessage(String),

    #[error("malformed client command: {0}")]
    MalformedCommand(String),

    #[error("group ({level}, {name}) already exists")]
    AlreadyExists { level: u8, name: String },

    #[error("no such group ({level}, {name})")]
    NoSuchGroup { level: u8, name: String },

    #[error("level {0} is out of range")]
    InvalidLevel(u8),

    #[error("group name '{0}' exceeds the maximum length")]
    NameTooLong(String),

    #[error("group ({level}, {name}) is already at its member cap of {max}")]
    GroupFull { level: u8, name: String, max: usize },

    #[error("client protocol violation: {0}")]
    ClientProtocolViolation(String),

    #[error("client is not registered with setup")]
    ClientNotSetup,

    #[error("the messaging bus rejected the send and local retries were exhausted: {0}")]
    BusSendFailed(String),

    #[error("the membership oracle is unavailable: {0}")]
    OracleUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for GroupdError {
    fn from(e: std::io::Error) -> Self {
        GroupdError::Io(Arc::new(e))
    }
}

impl From<String> for GroupdError {
    fn from(s: String) -> Self {
        GroupdError::Internal(s)
    }
}
