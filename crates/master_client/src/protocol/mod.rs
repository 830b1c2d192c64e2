//! Wire protocol spoken with the master.
//!
//! - `wire` - Variable-length field encoding over an in-memory frame
//! - `version` - Protocol versions and negotiation
//! - `command` - Command ordinals, response status bytes, frame limits

pub mod command;
pub mod version;
pub mod wire;

pub use command::{Command, Status, DEFAULT_MAX_FRAME_LENGTH};
pub use version::ProtocolVersion;
pub use wire::{WireReader, WireWriter};
