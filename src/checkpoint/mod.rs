//! Checkpoint-barrier alignment across input channels.
//!
//! The [`BarrierGate`] sits between the channel multiplexer and the
//! watermark valve. It intercepts barrier elements so that, for every
//! checkpoint id, the downstream consumer observes all pre-barrier elements
//! from every channel before any post-barrier element from any channel,
//! without a global pause.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use anyhow::{anyhow, Result};

use crate::types::{Barrier, ChannelIndex, CheckpointId, StreamElement};

mod gate;

pub use gate::*;

#[cfg(test)]
#[path = "tests/gate_tests.rs"]
mod tests;

/// How barriers interact with data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    /// Exactly-once: channels that delivered their barrier are blocked
    /// (buffered) until the barrier arrives on every channel.
    #[default]
    Aligned,
    /// At-least-once: elements are forwarded immediately; barrier arrivals
    /// are only tracked, and the snapshot fires on the last arrival.
    Unaligned,
}

/// Barrier gate configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub mode: AlignmentMode,
    /// Per-channel cap on elements buffered while the channel is blocked.
    /// Exceeding it aborts the blocking checkpoint rather than the task.
    pub max_buffered_per_channel: usize,
    /// How long an alignment may stay incomplete before it is reported as
    /// timed out. `None` disables timeout detection.
    pub alignment_timeout: Option<Duration>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            mode: AlignmentMode::Aligned,
            max_buffered_per_channel: 10_000,
            alignment_timeout: None,
        }
    }
}

/// Collaborator notified of checkpoint outcomes.
///
/// `trigger_snapshot` is invoked exactly once per completed alignment, on the
/// processing thread, before any post-barrier element is forwarded. The
/// timeout notification is advisory: the gate keeps waiting, and the owner
/// decides whether to abort via the task mailbox.
pub trait SnapshotHook: Send {
    fn trigger_snapshot(&mut self, barrier: Barrier) -> Result<()>;

    fn alignment_timed_out(&mut self, _checkpoint_id: CheckpointId) {}

    fn checkpoint_aborted(&mut self, _checkpoint_id: CheckpointId) {}
}

/// Snapshot hook that ignores every notification. Useful when checkpointing
/// is driven entirely externally or disabled.
pub struct NoopSnapshotHook;

impl SnapshotHook for NoopSnapshotHook {
    fn trigger_snapshot(&mut self, _barrier: Barrier) -> Result<()> {
        Ok(())
    }
}
