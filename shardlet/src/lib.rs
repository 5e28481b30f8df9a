//! shardlet: worker-side driver for the KCL multilang protocol.

pub mod bridge;
pub mod checkpoint;
pub mod fd_redirect;
pub mod processor;
pub mod telemetry;
pub mod worker;

pub use bridge::protocol::{ParseSequenceNumberError, Record, Request, Response, SequenceNumber};
pub use checkpoint::{CheckpointError, Checkpointer};
pub use processor::{RecordProcessor, ShutdownKind};
pub use worker::{DecodePolicy, LifecycleState, Worker, WorkerConfig, WorkerError, run_worker};
