//! Cross-channel watermark and status merging.
//!
//! The valve consumes the gate's output one element at a time, tracks
//! per-channel watermark and activity state, and forwards a single merged
//! view to the sink:
//!
//! - the merged watermark is the minimum over channels currently active,
//!   emitted only when it strictly increases;
//! - the merged status is idle only when every channel is idle (quorum
//!   rule), so status changes are rare — one emission per genuine flip.
//!
//! Excluding idle channels from the minimum keeps one stalled upstream from
//! freezing downstream event-time progress.

use anyhow::{anyhow, bail, Result};

use crate::output::SinkOutput;
use crate::types::{
    ChannelIndex, ChannelStatus, EventTime, StreamElement, Watermark, EVENT_TIME_MIN,
};

/// Per-channel record kept by the valve.
#[derive(Debug, Clone, Copy)]
struct ChannelState {
    /// Last watermark seen on this channel; non-decreasing by contract.
    last_watermark: EventTime,
    status: ChannelStatus,
    /// Set on end-of-channel: terminally idle, never rejoins the min set.
    ended: bool,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            last_watermark: EVENT_TIME_MIN,
            status: ChannelStatus::Active,
            ended: false,
        }
    }

    /// Whether this channel participates in the merged-watermark minimum.
    fn contributes(&self) -> bool {
        !self.ended && self.status == ChannelStatus::Active
    }
}

/// Merges per-channel watermarks and statuses into single downstream values.
pub struct StatusWatermarkValve {
    channels: Vec<ChannelState>,
    /// Merged watermark last forwarded downstream.
    last_emitted_watermark: EventTime,
    merged_status: ChannelStatus,
    ended_count: usize,
}

impl StatusWatermarkValve {
    pub fn new(num_channels: usize) -> Self {
        Self {
            channels: vec![ChannelState::new(); num_channels],
            last_emitted_watermark: EVENT_TIME_MIN,
            merged_status: ChannelStatus::Active,
            ended_count: 0,
        }
    }

    /// Feed one element from `channel`, forwarding merged results to `output`.
    pub fn input<T>(
        &mut self,
        channel: ChannelIndex,
        element: StreamElement<T>,
        output: &mut dyn SinkOutput<T>,
    ) -> Result<()> {
        if channel >= self.channels.len() {
            return Err(anyhow!("channel index {} out of bounds", channel));
        }
        match element {
            StreamElement::Record(record) => {
                self.mark_active(channel, output)?;
                output.emit_record(record)
            }
            StreamElement::Watermark(wm) => self.input_watermark(channel, wm, output),
            StreamElement::Status(status) => match status {
                ChannelStatus::Idle => self.input_idle(channel, output),
                ChannelStatus::Active => self.mark_active(channel, output),
            },
            StreamElement::LatencyMarker(marker) => output.emit_latency_marker(marker),
            StreamElement::End => self.input_end(channel, output),
            StreamElement::CheckpointBarrier(barrier) => {
                // Barriers terminate at the alignment gate.
                bail!(
                    "barrier {} reached the valve on channel {}",
                    barrier.checkpoint_id,
                    channel
                )
            }
        }
    }

    /// Merged watermark currently in effect downstream.
    pub fn merged_watermark(&self) -> EventTime {
        self.last_emitted_watermark
    }

    /// Merged status currently in effect downstream.
    pub fn merged_status(&self) -> ChannelStatus {
        self.merged_status
    }

    fn input_watermark<T>(
        &mut self,
        channel: ChannelIndex,
        wm: Watermark,
        output: &mut dyn SinkOutput<T>,
    ) -> Result<()> {
        let state = &mut self.channels[channel];
        if wm.timestamp < state.last_watermark {
            // Upstream guarantees per-channel monotonicity; a regression is
            // a contract breach, not something to paper over.
            return Err(anyhow!(
                "watermark regression on channel {}: {} < {}",
                channel,
                wm.timestamp,
                state.last_watermark
            ));
        }
        state.last_watermark = wm.timestamp;
        // A watermark is activity: a quiet channel waking up rejoins the min
        // set before the merge is recomputed.
        self.mark_active(channel, output)?;
        self.emit_watermark_if_advanced(output)
    }

    fn input_idle<T>(
        &mut self,
        channel: ChannelIndex,
        output: &mut dyn SinkOutput<T>,
    ) -> Result<()> {
        let state = &mut self.channels[channel];
        if state.ended || state.status == ChannelStatus::Idle {
            return Ok(());
        }
        state.status = ChannelStatus::Idle;

        if self.merged_status == ChannelStatus::Active && self.all_idle() {
            self.merged_status = ChannelStatus::Idle;
            output.emit_status(ChannelStatus::Idle)?;
        }
        // Dropping a channel from the min set may advance the merge.
        self.emit_watermark_if_advanced(output)
    }

    fn mark_active<T>(
        &mut self,
        channel: ChannelIndex,
        output: &mut dyn SinkOutput<T>,
    ) -> Result<()> {
        let state = &mut self.channels[channel];
        if state.ended || state.status == ChannelStatus::Active {
            return Ok(());
        }
        state.status = ChannelStatus::Active;
        if self.merged_status == ChannelStatus::Idle {
            self.merged_status = ChannelStatus::Active;
            output.emit_status(ChannelStatus::Active)?;
        }
        // Rejoining can only lower the minimum; the merged watermark never
        // regresses, so nothing is emitted here.
        Ok(())
    }

    fn input_end<T>(&mut self, channel: ChannelIndex, output: &mut dyn SinkOutput<T>) -> Result<()> {
        let state = &mut self.channels[channel];
        if state.ended {
            return Ok(());
        }
        state.ended = true;
        self.ended_count += 1;

        if self.ended_count == self.channels.len() {
            return output.emit_end();
        }

        // The remaining channels define the merge now.
        self.emit_watermark_if_advanced(output)?;
        if self.merged_status == ChannelStatus::Active && self.all_idle() {
            self.merged_status = ChannelStatus::Idle;
            output.emit_status(ChannelStatus::Idle)?;
        }
        Ok(())
    }

    /// Minimum last watermark over contributing channels, if any contribute.
    fn min_watermark(&self) -> Option<EventTime> {
        self.channels
            .iter()
            .filter(|state| state.contributes())
            .map(|state| state.last_watermark)
            .min()
    }

    fn emit_watermark_if_advanced<T>(&mut self, output: &mut dyn SinkOutput<T>) -> Result<()> {
        if let Some(min) = self.min_watermark() {
            if min > self.last_emitted_watermark {
                self.last_emitted_watermark = min;
                output.emit_watermark(Watermark::new(min))?;
            }
        }
        Ok(())
    }

    fn all_idle(&self) -> bool {
        self.channels.iter().all(|state| !state.contributes())
    }
}

#[cfg(test)]
#[path = "tests/valve_tests.rs"]
mod tests;
