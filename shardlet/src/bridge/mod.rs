//! Wire layer between the worker and the multilang daemon.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Record, SequenceNumber, Response)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **channel**: The single duplex channel shared by dispatch and checkpointing

pub mod channel;
pub mod codec;
pub mod protocol;
