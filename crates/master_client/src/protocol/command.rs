//! Command ordinals and response status bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MasterError;

/// Largest frame accepted from or sent to the master (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A request command. Every request frame starts with its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Close the session.
    Quit,
    /// Round-trip check.
    Ping,
    /// Fetch every row of one table.
    GetTable,
    /// Fetch one row by primary key.
    GetRow,
    /// Tell the master some tables changed.
    Invalidate,
    /// Turn the session into an invalidation push channel.
    ListenCaches,
}

impl Command {
    /// Wire ordinal.
    pub fn ordinal(self) -> u64 {
        match self {
            Self::Quit => 0,
            Self::Ping => 1,
            Self::GetTable => 2,
            Self::GetRow => 3,
            Self::Invalidate => 4,
            Self::ListenCaches => 5,
        }
    }

    /// Parse a wire ordinal.
    pub fn from_ordinal(ordinal: u64) -> Result<Self, MasterError> {
        match ordinal {
            0 => Ok(Self::Quit),
            1 => Ok(Self::Ping),
            2 => Ok(Self::GetTable),
            3 => Ok(Self::GetRow),
            4 => Ok(Self::Invalidate),
            5 => Ok(Self::ListenCaches),
            other => Err(MasterError::decode(format!("unknown command ordinal {other}"))),
        }
    }

    /// Whether repeating the command has no additional effect on the master.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Ping | Self::GetTable | Self::GetRow)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quit => "QUIT",
            Self::Ping => "PING",
            Self::GetTable => "GET_TABLE",
            Self::GetRow => "GET_ROW",
            Self::Invalidate => "INVALIDATE",
            Self::ListenCaches => "LISTEN_CACHES",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First byte of every response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A row follows in this frame.
    Next,
    /// The exchange completed.
    Done,
    /// The master failed the command; code and message follow.
    Error,
}

impl Status {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Next => 1,
            Self::Done => 2,
            Self::Error => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, MasterError> {
        match byte {
            1 => Ok(Self::Next),
            2 => Ok(Self::Done),
            3 => Ok(Self::Error),
            other => Err(MasterError::decode(format!("unknown status byte {other:#04x}"))),
        }
    }
}
