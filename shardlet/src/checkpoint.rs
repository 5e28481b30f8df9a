//! Checkpointing from inside record processor callbacks.
//!
//! A checkpoint is a synchronous round trip nested inside a callback: write
//! the request, then read exactly one reply from the same channel the
//! dispatcher uses. The [`Checkpointer`] owns that channel for the whole run,
//! and the dispatcher only reads through it while no callback holds it.
//!
//! A round trip that breaks the channel never returns to the callback. The
//! error is handed to the dispatcher, which drops the callback and ends the
//! run with it.

use tokio::sync::oneshot;

use crate::bridge::channel::Channel;
use crate::bridge::protocol::{Request, SequenceNumber};
use crate::worker::WorkerError;

const CHECKPOINT_ACK: &str = "checkpoint";

/// Checkpoint failures a record processor can react to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// Zombie shutdown was observed: another worker may own the shard now.
    #[error("attempted to checkpoint after zombie shutdown")]
    ProtocolViolation,

    /// The daemon refused the checkpoint (throttling, invalid state, ...).
    #[error("checkpoint rejected: {message}")]
    Rejected { message: String },
}

/// Handle passed to record processor callbacks for checkpointing progress.
pub struct Checkpointer {
    channel: Channel,
    allowed: bool,
    broken: bool,
    abort: Option<oneshot::Sender<WorkerError>>,
}

impl Checkpointer {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            channel,
            allowed: true,
            broken: false,
            abort: None,
        }
    }

    /// False once a zombie shutdown has been observed. Never becomes true again.
    pub fn checkpoints_allowed(&self) -> bool {
        self.allowed
    }

    /// Checkpoint everything delivered so far.
    ///
    /// If the channel to the daemon fails, the returned future never
    /// completes; the worker abandons the callback and exits with the error.
    pub async fn checkpoint_all(&mut self) -> Result<(), CheckpointError> {
        self.checkpoint(None).await
    }

    /// Checkpoint up to and including `sequence`. Same failure behaviour as
    /// [`checkpoint_all`](Self::checkpoint_all).
    pub async fn checkpoint_at(
        &mut self,
        sequence: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        self.checkpoint(Some(sequence)).await
    }

    async fn checkpoint(
        &mut self,
        position: Option<SequenceNumber>,
    ) -> Result<(), CheckpointError> {
        if self.broken {
            return std::future::pending().await;
        }
        if !self.allowed {
            tracing::error!(?position, "Checkpoint attempted after zombie shutdown");
            return Err(CheckpointError::ProtocolViolation);
        }

        match self.round_trip(position.clone()).await {
            Ok(None) => {
                tracing::debug!(?position, "Checkpoint acknowledged");
                Ok(())
            }
            Ok(Some(message)) => {
                tracing::warn!(?position, %message, "Checkpoint rejected");
                Err(CheckpointError::Rejected { message })
            }
            Err(e) => {
                tracing::error!(error = %e, "Checkpoint round trip failed");
                self.broken = true;
                if let Some(abort) = self.abort.take() {
                    let _ = abort.send(e);
                }
                std::future::pending().await
            }
        }
    }

    /// Returns the daemon's error message, if any.
    async fn round_trip(
        &mut self,
        position: Option<SequenceNumber>,
    ) -> Result<Option<String>, WorkerError> {
        self.channel.write_checkpoint_request(position).await?;
        match self.channel.next_reply(CHECKPOINT_ACK).await? {
            Some(Request::Checkpoint { error }) => Ok(error),
            Some(other) => Err(WorkerError::ProtocolDesync {
                received: other.action().to_string(),
            }),
            None => Err(WorkerError::EndOfStreamDuringCheckpoint),
        }
    }

    /// Arm the abort signal for the next callback. The receiver yields the
    /// fatal error if a round trip breaks the channel.
    pub(crate) fn arm(&mut self) -> oneshot::Receiver<WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.abort = Some(tx);
        rx
    }

    /// Forbid all further checkpoints. Called when zombie shutdown is seen.
    pub(crate) fn revoke(&mut self) {
        self.allowed = false;
    }

    pub(crate) fn channel(&mut self) -> &mut Channel {
        &mut self.channel
    }
}
