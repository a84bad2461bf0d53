//! # Conflux
//!
//! Record-ingestion pipeline for a single stream-processing task.
//!
//! Conflux merges several independent, concurrently arriving input channels
//! into one ordered sequence of elements for a downstream consumer, while
//! preserving checkpoint consistency (barrier alignment across channels) and
//! event-time progress (cross-channel watermark merging with idle-channel
//! exclusion).
//!
//! The pipeline, left to right:
//!
//! ```text
//! ChannelReader xN -> ChannelMultiplexer -> BarrierGate -> StatusWatermarkValve -> SinkOutput
//! ```
//!
//! driven once per iteration by [`IngestionTask`](task::IngestionTask), a
//! single-threaded cooperative loop that suspends when no input is available.
//!
//! - [`types`] — Core element types: [`StreamElement`](types::StreamElement),
//!   [`StreamRecord`](types::StreamRecord), [`Watermark`](types::Watermark),
//!   [`Barrier`](types::Barrier), [`ChannelStatus`](types::ChannelStatus).
//! - [`frame`] — Wire frames and the [`PayloadCodec`](frame::PayloadCodec)
//!   decoding seam.
//! - [`channel`] — Bounded transport channels and the per-channel
//!   [`ChannelReader`](channel::ChannelReader).
//! - [`multiplexer`] — Fair, non-blocking N-way merge.
//! - [`checkpoint`] — Barrier alignment: [`BarrierGate`](checkpoint::BarrierGate),
//!   [`SnapshotHook`](checkpoint::SnapshotHook).
//! - [`valve`] — Watermark/status merging: [`StatusWatermarkValve`](valve::StatusWatermarkValve).
//! - [`output`] — The consumer hand-off: [`StreamConsumer`](output::StreamConsumer),
//!   [`WatermarkGauge`](output::WatermarkGauge).
//! - [`task`] — The processing loop and its mailbox.

pub mod channel;
pub mod checkpoint;
pub mod frame;
pub mod multiplexer;
pub mod output;
pub mod task;
pub mod types;
pub mod valve;
