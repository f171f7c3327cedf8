//! Replication Protocol
//!
//! Defines the messages exchanged between nodes. Every command uses one
//! message variant for both the request and its successful reply: the
//! caller fills in the request fields, the callee echoes them back with
//! the reply fields populated.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::HostRecord;
use crate::wal::entry::{LogChunk, LogEntry, LogId};

/// Header carrying the numeric command id
pub const COMMAND_HEADER: &str = "x-wolfkv-command";
/// Header carrying the cluster shared secret
pub const SECRET_HEADER: &str = "x-wolfkv-secret";
/// Header carrying the numeric error code of a failed call
pub const ERROR_CODE_HEADER: &str = "x-wolfkv-error-code";

/// Replication commands and their wire ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Command {
    /// Follower announces itself to the master
    Register = 1,
    /// Fetch one log entry by id
    ReadOne = 2,
    /// Pull a chunk of log entries
    ReadLog = 3,
    /// Bulk replace of a follower's host table
    SetHosts = 4,
    /// Single host upsert, follower only
    AddHost = 5,
    /// Best-effort push of a fresh entry, follower only
    PushTransaction = 6,
    /// Role and position probe
    Status = 7,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Register,
        Command::ReadOne,
        Command::ReadLog,
        Command::SetHosts,
        Command::AddHost,
        Command::PushTransaction,
        Command::Status,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(id: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_u32() == id)
            .ok_or(Error::UnknownCommand(id))
    }

    /// Endpoint an outbound call for this command goes to
    pub fn endpoint(self) -> Endpoint {
        match self {
            Command::Register | Command::ReadOne | Command::ReadLog => Endpoint::Master,
            Command::SetHosts | Command::AddHost | Command::PushTransaction | Command::Status => {
                Endpoint::Remote
            }
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register => write!(f, "REGISTER"),
            Command::ReadOne => write!(f, "READ_ONE"),
            Command::ReadLog => write!(f, "READ_LOG"),
            Command::SetHosts => write!(f, "SET_HOSTS"),
            Command::AddHost => write!(f, "ADD_HOST"),
            Command::PushTransaction => write!(f, "PUSH_TRANSACTION"),
            Command::Status => write!(f, "STATUS"),
        }
    }
}

/// The two inbound replication paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Calls addressed to a node acting as a log source
    Master,
    /// Calls addressed to a follower
    Remote,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Master => "/replication/master",
            Endpoint::Remote => "/replication/remote",
        }
    }

    /// Check whether this path serves `command`
    pub fn accepts(self, command: Command) -> bool {
        command.endpoint() == self || matches!(command, Command::Status | Command::ReadOne)
    }
}

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// REGISTER: request carries the follower, reply carries the host table
    Register {
        url: String,
        log_position: LogId,
        hosts: Vec<HostRecord>,
    },

    /// READ_ONE: `entry` is `None` in the request and when not found
    ReadOne { id: LogId, entry: Option<LogEntry> },

    /// READ_LOG: `url` is the caller, `chunk` is filled by the reply
    ReadLog {
        url: String,
        last_seen: LogId,
        limit: u32,
        chunk: LogChunk,
    },

    SetHosts { hosts: Vec<HostRecord> },

    AddHost { host: HostRecord },

    /// PUSH_TRANSACTION: `source` is the pushing master, `accepted`
    /// reports whether the follower buffered the entry
    PushTransaction {
        source: String,
        entry: LogEntry,
        accepted: bool,
    },

    /// STATUS: empty in the request, describes the callee in the reply
    Status {
        url: String,
        log_position: LogId,
        is_master: bool,
        master_address: String,
    },
}

impl Message {
    pub fn register(url: impl Into<String>, log_position: LogId) -> Self {
        Message::Register {
            url: url.into(),
            log_position,
            hosts: Vec::new(),
        }
    }

    pub fn read_one(id: LogId) -> Self {
        Message::ReadOne { id, entry: None }
    }

    pub fn read_log(url: impl Into<String>, last_seen: LogId, limit: u32) -> Self {
        Message::ReadLog {
            url: url.into(),
            last_seen,
            limit,
            chunk: LogChunk::default(),
        }
    }

    pub fn push(source: impl Into<String>, entry: LogEntry) -> Self {
        Message::PushTransaction {
            source: source.into(),
            entry,
            accepted: false,
        }
    }

    pub fn status() -> Self {
        Message::Status {
            url: String::new(),
            log_position: 0,
            is_master: false,
            master_address: String::new(),
        }
    }

    /// Command this message belongs to
    pub fn command(&self) -> Command {
        match self {
            Message::Register { .. } => Command::Register,
            Message::ReadOne { .. } => Command::ReadOne,
            Message::ReadLog { .. } => Command::ReadLog,
            Message::SetHosts { .. } => Command::SetHosts,
            Message::AddHost { .. } => Command::AddHost,
            Message::PushTransaction { .. } => Command::PushTransaction,
            Message::Status { .. } => Command::Status,
        }
    }

    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Encode as an HTTP body
    pub fn to_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.serialize()?))
    }

    /// Decode an HTTP body
    pub fn from_base64(body: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(body.trim())
            .map_err(|e| Error::Protocol(format!("body is not base64: {}", e)))?;
        Self::deserialize(&bytes).map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
    }

    /// Check that this message answers a `command` request
    pub fn expect(self, command: Command) -> Result<Self> {
        if self.command() == command {
            Ok(self)
        } else {
            Err(Error::Protocol(format!(
                "expected {} message, got {}",
                command,
                self.command()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_are_stable() {
        let ids: Vec<u32> = Command::ALL.iter().map(|c| c.as_u32()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(Command::from_u32(3).unwrap(), Command::ReadLog);
        assert!(matches!(Command::from_u32(42), Err(Error::UnknownCommand(42))));
    }

    #[test]
    fn test_endpoints_route_commands() {
        assert!(Endpoint::Master.accepts(Command::ReadLog));
        assert!(Endpoint::Master.accepts(Command::Status));
        assert!(!Endpoint::Master.accepts(Command::PushTransaction));
        assert!(Endpoint::Remote.accepts(Command::AddHost));
        assert!(Endpoint::Remote.accepts(Command::ReadOne));
        assert!(!Endpoint::Remote.accepts(Command::Register));
    }

    #[test]
    fn test_body_encoding() {
        let msg = Message::read_log("http://b:7700", 41, 500);
        let body = msg.to_base64().unwrap();
        assert_eq!(Message::from_base64(&body).unwrap(), msg);

        assert!(matches!(Message::from_base64("%%%"), Err(Error::Protocol(_))));
        assert!(matches!(Message::from_base64("AAAA"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_expect_rejects_mismatched_reply() {
        assert!(Message::status().expect(Command::Status).is_ok());
        let err = Message::read_one(1).expect(Command::ReadLog).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
