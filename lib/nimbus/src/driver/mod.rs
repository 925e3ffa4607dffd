// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message channel to out-of-process drivers.
//!
//! Every message is one line: `<TYPE> <STATUS> <OID> <PAYLOAD>`. Requests
//! carry `-` as status; replies carry `SUCCESS` or `FAILURE` (or a log
//! severity for `LOG` lines). The payload is the rest of the line.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use nimbus_types::ObjectId;
use thiserror::Error;

mod process;

pub use process::ProcessDriver;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver {0} is not running")]
    Closed(String),

    #[error("no driver named {0:?}")]
    NotFound(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("missing {0} in message")]
    Missing(&'static str),

    #[error("invalid object id {0:?}")]
    BadOid(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Placeholder used on requests.
    None,
    Success,
    Failure,
    Other(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::None => write!(f, "-"),
            Status::Success => write!(f, "SUCCESS"),
            Status::Failure => write!(f, "FAILURE"),
            Status::Other(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s {
            "-" => Status::None,
            "SUCCESS" => Status::Success,
            "FAILURE" => Status::Failure,
            other => Status::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<T> {
    pub kind: T,
    pub status: Status,
    pub oid: ObjectId,
    pub payload: String,
}

impl<T> Message<T> {
    pub fn request(kind: T, oid: ObjectId, payload: impl Into<String>) -> Self {
        Self { kind, status: Status::None, oid, payload: payload.into() }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// The driver diagnostic, unless the payload is empty or starts with `-`.
    pub fn diagnostic(&self) -> Option<&str> {
        let p = self.payload.trim();
        if p.is_empty() || p.starts_with('-') {
            None
        } else {
            Some(p)
        }
    }
}

impl<T: fmt::Display> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.status, self.oid)?;
        if !self.payload.is_empty() {
            write!(f, " {}", self.payload)?;
        }
        Ok(())
    }
}

impl<T: FromStr> FromStr for Message<T> {
    type Err = MessageParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.trim().splitn(4, ' ');
        let kind = parts.next().filter(|s| !s.is_empty()).ok_or(MessageParseError::Empty)?;
        let kind = kind
            .parse::<T>()
            .map_err(|_| MessageParseError::UnknownType(kind.to_string()))?;
        let status = parts.next().ok_or(MessageParseError::Missing("status"))?;
        let oid = parts.next().ok_or(MessageParseError::Missing("object id"))?;
        let oid = oid
            .parse::<ObjectId>()
            .map_err(|_| MessageParseError::BadOid(oid.to_string()))?;
        Ok(Self {
            kind,
            status: Status::from(status),
            oid,
            payload: parts.next().unwrap_or("").to_string(),
        })
    }
}

/// Outbound half of a driver connection.
#[cfg_attr(test, mockall::automock)]
pub trait DriverChannel: Send + Sync {
    fn write(&self, message: &str) -> Result<(), DriverError>;
}

/// A driver that records every message written to it.
#[derive(Default)]
pub struct RecordingDriver {
    messages: Mutex<Vec<String>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Returns and clears the recorded messages.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }
}

impl DriverChannel for RecordingDriver {
    fn write(&self, message: &str) -> Result<(), DriverError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}
