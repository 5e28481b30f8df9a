//! The record processor contract implemented by applications.

use std::fmt;

use crate::bridge::protocol::Record;
use crate::checkpoint::Checkpointer;

/// Shutdown reason the daemon sends when the lease was lost.
pub const ZOMBIE_REASON: &str = "ZOMBIE";

/// Shutdown reason the daemon sends when the shard was closed or the
/// daemon is stopping cleanly.
pub const TERMINATE_REASON: &str = "TERMINATE";

/// Why the worker is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// A final checkpoint is permitted.
    Graceful,
    /// Another worker may already own the shard. Checkpointing is forbidden.
    Zombie,
}

impl ShutdownKind {
    /// Classify a `shutdown` request's reason. No reason means zombie.
    pub fn from_reason(reason: Option<&str>) -> Self {
        match reason {
            None | Some(ZOMBIE_REASON) => Self::Zombie,
            Some(_) => Self::Graceful,
        }
    }

    pub fn allows_checkpoint(self) -> bool {
        matches!(self, Self::Graceful)
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Zombie => f.write_str("zombie"),
        }
    }
}

/// Application logic driven by the worker, one instance per shard.
///
/// Any error returned from a callback is fatal: the worker stops without
/// acknowledging the request and exits non-zero, and the daemon restarts it.
#[async_trait::async_trait]
pub trait RecordProcessor: Send {
    /// Called once, before any records, with the shard this worker owns.
    async fn initialize(&mut self, shard_id: &str) -> anyhow::Result<()>;

    /// Called for each batch of records, in delivery order.
    async fn process_records(
        &mut self,
        records: Vec<Record>,
        checkpointer: &mut Checkpointer,
    ) -> anyhow::Result<()>;

    /// Called once, last. Checkpointing here only succeeds for
    /// [`ShutdownKind::Graceful`].
    async fn shutdown(
        &mut self,
        kind: ShutdownKind,
        checkpointer: &mut Checkpointer,
    ) -> anyhow::Result<()>;
}
