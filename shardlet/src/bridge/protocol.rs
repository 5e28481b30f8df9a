//! Wire protocol types for daemon-worker communication.
//!
//! One JSON object per line in each direction:
//! - **Inbound** (daemon → worker): [`Request`]
//! - **Outbound** (worker → daemon): [`Response`]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Position of a record within its shard.
///
/// The daemon sends these either as JSON integers or as numeric strings.
/// Kinesis sequence numbers run to 56 decimal digits, wider than any
/// primitive integer, so the value is held as its canonical decimal digits
/// (no sign, no leading zeros). Anything that is not an exact non-negative
/// integer is rejected rather than rounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceNumber(String);

/// A sequence number that is not a non-negative decimal integer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sequence number {0:?}: expected decimal digits")]
pub struct ParseSequenceNumberError(String);

impl SequenceNumber {
    /// The canonical decimal digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value as a `u64`, when it fits.
    pub fn to_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<u128> for SequenceNumber {
    fn from(value: u128) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for SequenceNumber {
    type Err = ParseSequenceNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseSequenceNumberError(s.to_string()));
        }
        let digits = s.trim_start_matches('0');
        Ok(Self(if digits.is_empty() { "0" } else { digits }.to_string()))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        // Canonical form has no leading zeros, so longer means larger.
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SequenceNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SequenceNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SequenceNumberVisitor)
    }
}

struct SequenceNumberVisitor;

impl Visitor<'_> for SequenceNumberVisitor {
    type Value = SequenceNumber;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or a numeric string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(SequenceNumber::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Self::Value, E> {
        Ok(SequenceNumber::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(SequenceNumber::from)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse()
            .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

/// A single record delivered in a `processRecords` batch.
///
/// `data` is kept exactly as received (base64 text); the driver never
/// decodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub data: String,
    pub partition_key: String,
    pub sequence_number: SequenceNumber,
}

impl Record {
    /// Decode the base64 payload into raw bytes.
    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Messages from the daemon to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Request {
    /// First message of every run; names the shard this worker owns.
    #[serde(rename = "initialize")]
    Initialize {
        #[serde(rename = "shardId")]
        shard_id: String,
    },

    #[serde(rename = "processRecords")]
    ProcessRecords { records: Vec<Record> },

    /// Last message of every run. Absent reason means zombie.
    #[serde(rename = "shutdown")]
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Reply to a checkpoint request; `error` set means it was rejected.
    #[serde(rename = "checkpoint")]
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Request {
    /// Wire name of the action, as echoed back in `responseFor`.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::ProcessRecords { .. } => "processRecords",
            Self::Shutdown { .. } => "shutdown",
            Self::Checkpoint { .. } => "checkpoint",
        }
    }
}

/// Messages from the worker to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Response {
    /// Acknowledges that the named request was handled.
    Status {
        #[serde(rename = "responseFor")]
        response_for: String,
    },

    /// Asks the daemon to persist progress. `None` means everything
    /// delivered so far.
    Checkpoint { checkpoint: Option<SequenceNumber> },
}

impl Response {
    pub fn status(action: impl Into<String>) -> Self {
        Self::Status {
            response_for: action.into(),
        }
    }

    pub fn checkpoint(position: Option<SequenceNumber>) -> Self {
        Self::Checkpoint {
            checkpoint: position,
        }
    }
}
