//! Worker lifecycle - the dispatch loop that runs inside the worker process.
//!
//! The daemon drives the worker over stdin/stdout:
//! - `initialize` once, then any number of `processRecords`, then `shutdown`
//! - every handled request except `shutdown` is answered with a `status`
//! - checkpoint requests are issued from inside callbacks (see [`Checkpointer`])
//!
//! Everything runs on one control flow. There is never more than one request
//! in flight, and nothing is read while a callback is running unless the
//! callback itself is waiting for a checkpoint reply.

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bridge::channel::Channel;
use crate::bridge::codec::{DEFAULT_MAX_LINE_BYTES, DecodeError};
use crate::bridge::protocol::Request;
use crate::checkpoint::Checkpointer;
use crate::fd_redirect;
use crate::processor::{RecordProcessor, ShutdownKind};

/// What to do with a line that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Log it and read the next line.
    #[default]
    Skip,
    /// Treat it as fatal.
    Fail,
}

impl FromStr for DecodePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "unknown decode policy '{other}', expected 'skip' or 'fail'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub decode_policy: DecodePolicy,
    /// Longest accepted input line, in bytes.
    pub max_line_length: usize,
    /// Move the protocol off fds 0/1 so stray output cannot corrupt it (unix only).
    pub isolate_stdout: bool,
    /// Also answer `shutdown` with a `status`. Some daemon builds wait for one.
    pub acknowledge_shutdown: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            decode_policy: DecodePolicy::Skip,
            max_line_length: DEFAULT_MAX_LINE_BYTES,
            isolate_stdout: false,
            acknowledge_shutdown: false,
        }
    }
}

impl WorkerConfig {
    /// Build from `SHARDLET_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable values are
    /// logged and replaced by their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("SHARDLET_DECODE_POLICY") {
            match raw.parse() {
                Ok(policy) => config.decode_policy = policy,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid SHARDLET_DECODE_POLICY, using default")
                }
            }
        }

        if let Some(raw) = lookup("SHARDLET_MAX_LINE_BYTES") {
            match raw.trim().parse::<usize>() {
                Ok(max) if max > 0 => config.max_line_length = max,
                _ => {
                    tracing::warn!(value = %raw, "Invalid SHARDLET_MAX_LINE_BYTES, using default")
                }
            }
        }

        if let Some(raw) = lookup("SHARDLET_ISOLATE_STDOUT") {
            config.isolate_stdout = parse_flag("SHARDLET_ISOLATE_STDOUT", &raw);
        }

        if let Some(raw) = lookup("SHARDLET_ACK_SHUTDOWN") {
            config.acknowledge_shutdown = parse_flag("SHARDLET_ACK_SHUTDOWN", &raw);
        }

        config
    }
}

fn parse_flag(key: &str, raw: &str) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            tracing::warn!(key, value = %raw, "Invalid boolean, using false");
            false
        }
    }
}

/// Position in the worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    AwaitInit,
    Active,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitInit => f.write_str("awaiting initialize"),
            Self::Active => f.write_str("active"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Unrecoverable worker errors. Any of these ends the run; the process
/// should exit non-zero and let the daemon restart it.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("I/O error on daemon channel: {0}")]
    Io(#[from] io::Error),

    /// Only produced under [`DecodePolicy::Fail`].
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unsupported action '{action}' while {state}")]
    UnsupportedAction {
        action: &'static str,
        state: LifecycleState,
    },

    #[error("input ended while {state}, before a shutdown request")]
    UnexpectedEndOfStream { state: LifecycleState },

    #[error("input ended while awaiting a checkpoint acknowledgement")]
    EndOfStreamDuringCheckpoint,

    #[error("expected a checkpoint acknowledgement, received '{received}'")]
    ProtocolDesync { received: String },

    /// The awaited reply arrived but could not be decoded. Never skipped,
    /// whatever the [`DecodePolicy`].
    #[error("could not decode checkpoint acknowledgement: {0}")]
    MalformedReply(#[source] DecodeError),

    #[error("record processor failed during {action}: {source:#}")]
    Processor {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Drives one [`RecordProcessor`] through the lifecycle of one shard.
pub struct Worker {
    checkpointer: Checkpointer,
    state: LifecycleState,
    acknowledge_shutdown: bool,
}

impl Worker {
    pub fn new<R, W>(reader: R, writer: W, config: &WorkerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            checkpointer: Checkpointer::new(Channel::new(reader, writer, config)),
            state: LifecycleState::AwaitInit,
            acknowledge_shutdown: config.acknowledge_shutdown,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Run until a shutdown request has been handled or a fatal error occurs.
    pub async fn run<P>(mut self, processor: &mut P) -> Result<(), WorkerError>
    where
        P: RecordProcessor + ?Sized,
    {
        while self.state != LifecycleState::Terminated {
            if let Err(e) = self.step(processor).await {
                tracing::error!(error = %e, state = %self.state, "Worker failed");
                return Err(e);
            }
        }
        tracing::info!("Worker exiting");
        Ok(())
    }

    async fn step<P>(&mut self, processor: &mut P) -> Result<(), WorkerError>
    where
        P: RecordProcessor + ?Sized,
    {
        match self.checkpointer.channel().next_request().await? {
            Some(request) => self.dispatch(request, processor).await,
            None => Err(WorkerError::UnexpectedEndOfStream { state: self.state }),
        }
    }

    async fn dispatch<P>(
        &mut self,
        request: Request,
        processor: &mut P,
    ) -> Result<(), WorkerError>
    where
        P: RecordProcessor + ?Sized,
    {
        let action = request.action();
        let (outcome, next) = match (self.state, request) {
            (LifecycleState::AwaitInit, Request::Initialize { shard_id }) => {
                tracing::info!(%shard_id, "Initializing record processor");
                (processor.initialize(&shard_id).await, LifecycleState::Active)
            }
            (LifecycleState::Active, Request::ProcessRecords { records }) => {
                tracing::debug!(count = records.len(), "Processing records");
                let mut abort = self.checkpointer.arm();
                // A broken channel ends the callback at its checkpoint.
                let outcome = tokio::select! {
                    biased;
                    Ok(fatal) = &mut abort => return Err(fatal),
                    outcome = processor.process_records(records, &mut self.checkpointer) => outcome,
                };
                (outcome, LifecycleState::Active)
            }
            (LifecycleState::Active, Request::Shutdown { reason }) => {
                let kind = ShutdownKind::from_reason(reason.as_deref());
                if kind == ShutdownKind::Zombie {
                    // Before the callback runs, so it cannot checkpoint.
                    self.checkpointer.revoke();
                }
                tracing::info!(
                    %kind,
                    reason = reason.as_deref(),
                    "Shutting down record processor"
                );
                let mut abort = self.checkpointer.arm();
                let outcome = tokio::select! {
                    biased;
                    Ok(fatal) = &mut abort => return Err(fatal),
                    outcome = processor.shutdown(kind, &mut self.checkpointer) => outcome,
                };
                (outcome, LifecycleState::Terminated)
            }
            (state, _) => return Err(WorkerError::UnsupportedAction { action, state }),
        };

        outcome.map_err(|source| WorkerError::Processor { action, source })?;

        self.state = next;
        if next != LifecycleState::Terminated || self.acknowledge_shutdown {
            self.checkpointer.channel().write_ack(action).await?;
        }
        Ok(())
    }
}

/// Run a record processor against this process's stdin/stdout.
///
/// Returns once the daemon's shutdown request has been handled. An error
/// means the worker must exit non-zero.
pub async fn run_worker<P>(processor: &mut P, config: WorkerConfig) -> Result<(), WorkerError>
where
    P: RecordProcessor + ?Sized,
{
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "shardlet worker starting");

    let worker = if config.isolate_stdout {
        let stdio = fd_redirect::isolate_protocol_stdio()?;
        Worker::new(stdio.input, stdio.output, &config)
    } else {
        Worker::new(tokio::io::stdin(), tokio::io::stdout(), &config)
    };

    worker.run(processor).await
}
