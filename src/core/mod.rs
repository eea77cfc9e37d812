// src/core/mod.rs

//! The central module containing the core logic and data structures of groupd.

pub mod barrier;
pub mod daemon;
pub mod endpoint;
pub mod errors;
pub mod event;
pub mod group;
pub mod introspection;
pub mod messaging;
pub mod node;
pub mod oracle;
pub mod recovery;
pub mod registry;
pub mod wire;

pub use errors::GroupdError;

/// Maximum number of levels a group may be created at (`gd_internal.h: MAX_LEVELS`).
pub const MAX_LEVELS: u8 = 4;

/// Maximum length, in bytes, of a group name.
pub const MAX_NAMELEN: usize = 32;

/// Maximum number of members a single group may hold.
pub const MAX_MEMBERS: usize = 256;

/// Fixed back-off applied to an event re-entering `DELAY` before retry.
pub const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);
