//! Transport channels feeding one task.
//!
//! Uses crossbeam-channel for bounded, backpressure-aware hand-off from the
//! per-channel transport threads to the single processing thread. The
//! transport side only enqueues raw frames; all decoding happens on the
//! processing thread via [`ChannelReader`], so channel state is never touched
//! concurrently.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::frame::{decode_element, encode_element, Frame, PayloadCodec};
use crate::types::{ChannelIndex, ChannelStatus, CheckpointId, EventTime, StreamElement};

/// Default channel buffer size (bounded for backpressure).
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Producing side of an input channel. Held by the upstream transport.
///
/// Encodes typed elements into frames before enqueueing, so the consuming
/// side observes exactly what a network channel would deliver.
pub struct ChannelProducer<T> {
    sender: Sender<Frame>,
    codec: std::sync::Arc<dyn PayloadCodec<T> + Sync>,
}

impl<T> Clone for ChannelProducer<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> ChannelProducer<T> {
    /// Send a typed element. Blocks when the channel is full (backpressure).
    pub fn send(&self, element: StreamElement<T>) -> Result<()> {
        let frame = encode_element(&element, self.codec.as_ref())?;
        self.send_frame(frame)
    }

    /// Send a raw frame. Blocks when the channel is full.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        self.sender
            .send(frame)
            .map_err(|_| anyhow!("channel closed: reader dropped"))
    }

    pub fn send_record(&self, value: T) -> Result<()> {
        self.send(StreamElement::record(value))
    }

    pub fn send_watermark(&self, timestamp: EventTime) -> Result<()> {
        self.send(StreamElement::watermark(timestamp))
    }

    pub fn send_status(&self, status: ChannelStatus) -> Result<()> {
        self.send(StreamElement::Status(status))
    }

    pub fn send_barrier(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.send(StreamElement::barrier(checkpoint_id))
    }

    pub fn send_end(&self) -> Result<()> {
        self.send(StreamElement::End)
    }
}

/// Consuming side of one input channel.
///
/// Owned by the multiplexer and polled only from the processing thread.
/// Decode failures are fatal for the task: the channel's byte stream is
/// unrecoverable once corrupt.
pub struct ChannelReader<T> {
    channel: ChannelIndex,
    receiver: Receiver<Frame>,
    codec: Box<dyn PayloadCodec<T>>,
}

impl<T> ChannelReader<T> {
    pub fn new(channel: ChannelIndex, receiver: Receiver<Frame>, codec: Box<dyn PayloadCodec<T>>) -> Self {
        Self {
            channel,
            receiver,
            codec,
        }
    }

    /// Poll for the next element without blocking.
    ///
    /// Returns `Ok(None)` when no frame is currently available. A producer
    /// that disconnects without sending an end marker, or a frame that fails
    /// to decode, yields a channel error.
    pub fn try_poll(&mut self) -> Result<Option<StreamElement<T>>> {
        match self.receiver.try_recv() {
            Ok(frame) => {
                let element = decode_element(&frame, self.codec.as_ref())
                    .with_context(|| format!("corrupt input on channel {}", self.channel))?;
                Ok(Some(element))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(anyhow!(
                "channel {} disconnected before end of input",
                self.channel
            )),
        }
    }

    /// The channel index this reader decodes.
    pub fn channel(&self) -> ChannelIndex {
        self.channel
    }

    /// The raw frame receiver, for registration in a readiness `Select`.
    pub(crate) fn receiver(&self) -> &Receiver<Frame> {
        &self.receiver
    }
}

/// Create one bounded input channel: a producer for the transport side and a
/// reader for the processing thread.
pub fn input_channel<T>(
    channel: ChannelIndex,
    capacity: usize,
    codec: std::sync::Arc<dyn PayloadCodec<T> + Sync>,
) -> (ChannelProducer<T>, ChannelReader<T>)
where
    T: 'static,
{
    let (sender, receiver) = bounded(capacity);
    let reader_codec: Box<dyn PayloadCodec<T>> = Box::new(SharedCodec(codec.clone()));
    (
        ChannelProducer { sender, codec },
        ChannelReader::new(channel, receiver, reader_codec),
    )
}

/// Create an input channel with the default capacity.
pub fn input_channel_default<T>(
    channel: ChannelIndex,
    codec: std::sync::Arc<dyn PayloadCodec<T> + Sync>,
) -> (ChannelProducer<T>, ChannelReader<T>)
where
    T: 'static,
{
    input_channel(channel, DEFAULT_CHANNEL_CAPACITY, codec)
}

// Adapter so producer and reader can share one codec instance.
struct SharedCodec<T>(std::sync::Arc<dyn PayloadCodec<T> + Sync>);

impl<T> PayloadCodec<T> for SharedCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        self.0.encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        self.0.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BytesCodec, FrameType};
    use std::sync::Arc;

    fn bytes_channel() -> (ChannelProducer<Vec<u8>>, ChannelReader<Vec<u8>>) {
        input_channel_default(0, Arc::new(BytesCodec))
    }

    #[test]
    fn test_try_poll_empty() {
        let (_producer, mut reader) = bytes_channel();
        assert!(reader.try_poll().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_elements() {
        let (producer, mut reader) = bytes_channel();
        producer.send_record(vec![1, 2, 3]).unwrap();
        producer.send_watermark(100).unwrap();
        producer.send_end().unwrap();

        match reader.try_poll().unwrap().unwrap() {
            StreamElement::Record(rec) => assert_eq!(rec.value, vec![1, 2, 3]),
            other => panic!("expected Record, got {:?}", other),
        }
        assert_eq!(
            reader.try_poll().unwrap().unwrap(),
            StreamElement::watermark(100)
        );
        assert_eq!(reader.try_poll().unwrap().unwrap(), StreamElement::End);
    }

    #[test]
    fn test_corrupt_frame_is_channel_error() {
        let (producer, mut reader) = bytes_channel();
        // A barrier frame must carry exactly 16 payload bytes.
        producer
            .send_frame(Frame::new(FrameType::Barrier, vec![1, 2, 3]))
            .unwrap();
        let err = reader.try_poll().unwrap_err();
        assert!(
            err.to_string().contains("corrupt input on channel 0"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn test_disconnect_without_end_is_error() {
        let (producer, mut reader) = bytes_channel();
        drop(producer);
        let err = reader.try_poll().unwrap_err();
        assert!(err.to_string().contains("disconnected before end of input"));
    }
}
