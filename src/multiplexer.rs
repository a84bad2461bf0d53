//! Fair, non-blocking merge of N input channels.
//!
//! The multiplexer owns all [`ChannelReader`]s of a task and hands out one
//! element per poll, tagged with its origin channel. It never blocks: when no
//! channel has input it reports [`Polled::NothingAvailable`] and the driver
//! suspends on the readiness `Select` instead.
//!
//! Selection is starvation-free: each poll starts from a rotating offset, so
//! a busy low-index channel cannot shadow the others.

use anyhow::Result;
use crossbeam_channel::Select;

use crate::channel::ChannelReader;
use crate::types::{ChannelIndex, StreamElement};

/// Outcome of one multiplexer poll.
#[derive(Debug)]
pub enum Polled<T> {
    /// One element became available on `channel`.
    Event {
        channel: ChannelIndex,
        element: StreamElement<T>,
    },
    /// No channel has input right now; the driver should suspend.
    NothingAvailable,
    /// Every channel has delivered its end marker.
    AllExhausted,
}

/// Merges N input channels into one element-at-a-time stream.
pub struct ChannelMultiplexer<T> {
    readers: Vec<ChannelReader<T>>,
    ended: Vec<bool>,
    ended_count: usize,
    /// Rotating start offset for fair selection.
    next_start: usize,
}

impl<T> ChannelMultiplexer<T> {
    /// Create a multiplexer over the given readers. Reader order defines the
    /// channel indexing used throughout the pipeline.
    pub fn new(readers: Vec<ChannelReader<T>>) -> Self {
        let num_channels = readers.len();
        Self {
            readers,
            ended: vec![false; num_channels],
            ended_count: 0,
            next_start: 0,
        }
    }

    /// Poll for the next element from any channel, without blocking.
    ///
    /// End markers are forwarded tagged with their channel so downstream
    /// stages can observe per-channel termination; after the last channel's
    /// end marker has been delivered, further polls return
    /// [`Polled::AllExhausted`].
    pub fn poll(&mut self) -> Result<Polled<T>> {
        let num_channels = self.readers.len();
        if self.ended_count == num_channels {
            return Ok(Polled::AllExhausted);
        }

        let start = self.next_start;
        self.next_start = (self.next_start + 1) % num_channels;

        for i in 0..num_channels {
            let channel = (start + i) % num_channels;
            if self.ended[channel] {
                continue;
            }
            if let Some(element) = self.readers[channel].try_poll()? {
                if matches!(element, StreamElement::End) {
                    self.mark_ended(channel);
                }
                return Ok(Polled::Event { channel, element });
            }
        }

        Ok(Polled::NothingAvailable)
    }

    /// Register all non-ended channel receivers with a readiness `Select`.
    ///
    /// Used by the processing loop's suspend point. Returns the number of
    /// receivers registered.
    pub fn register_ready<'a>(&'a self, select: &mut Select<'a>) -> usize {
        let mut registered = 0;
        for (channel, reader) in self.readers.iter().enumerate() {
            if !self.ended[channel] {
                select.recv(reader.receiver());
                registered += 1;
            }
        }
        registered
    }

    fn mark_ended(&mut self, channel: ChannelIndex) {
        if !self.ended[channel] {
            self.ended[channel] = true;
            self.ended_count += 1;
        }
    }

    /// Check if all input channels have ended.
    pub fn all_ended(&self) -> bool {
        self.ended_count == self.readers.len()
    }

    /// Get the number of input channels.
    pub fn num_channels(&self) -> usize {
        self.readers.len()
    }

    /// Get the number of channels that have ended.
    pub fn num_ended(&self) -> usize {
        self.ended_count
    }
}
