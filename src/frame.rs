//! Wire frames at the transport edge of the pipeline.
//!
//! The transport delivers opaque frames per channel; decoding into typed
//! [`StreamElement`]s happens on the processing thread only. Control frames
//! (watermark, status, barrier, latency marker, end) use a fixed big-endian
//! layout; data frames carry a payload decoded by an external
//! [`PayloadCodec`].

use anyhow::{anyhow, Result};

use crate::types::{ChannelStatus, EventTime, StreamElement, StreamRecord};

/// Logical frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    Watermark = 2,
    Status = 3,
    Barrier = 4,
    LatencyMarker = 5,
    End = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Watermark),
            3 => Ok(FrameType::Status),
            4 => Ok(FrameType::Barrier),
            5 => Ok(FrameType::LatencyMarker),
            6 => Ok(FrameType::End),
            other => Err(anyhow!("unknown frame type: {}", other)),
        }
    }
}

/// One transport frame: `[type:u8][payload:bytes]`.
///
/// Field layouts per type (all integers big-endian):
/// - `Data`: `[has_ts:u8][ts:i64 if has_ts][record payload]`
/// - `Watermark`: `[ts:i64]`
/// - `Status`: `[0=active|1=idle:u8]`
/// - `Barrier`: `[checkpoint_id:u64][ts:i64]`
/// - `LatencyMarker`: `[marked_at:i64][source_task:u32]`
/// - `End`: empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Encode into a length-prefixed byte buffer: `[len:u32][type:u8][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 1 + self.payload.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.push(self.frame_type as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode from a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(anyhow!("empty frame body"));
        }
        let frame_type = FrameType::try_from(body[0])?;
        Ok(Self {
            frame_type,
            payload: body[1..].to_vec(),
        })
    }
}

/// Decodes data-frame payload bytes into user values.
///
/// This is the deserializer seam: the surrounding system supplies one codec
/// per channel. A decode failure is unrecoverable for the channel.
pub trait PayloadCodec<T>: Send {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Identity codec for raw byte payloads.
pub struct BytesCodec;

impl PayloadCodec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

fn read_i64(bytes: &[u8], what: &str) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("truncated {} field: {} bytes", what, bytes.len()))?;
    Ok(i64::from_be_bytes(arr))
}

fn read_u64(bytes: &[u8], what: &str) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("truncated {} field: {} bytes", what, bytes.len()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Decode one frame into a typed stream element using `codec` for data payloads.
pub fn decode_element<T>(frame: &Frame, codec: &dyn PayloadCodec<T>) -> Result<StreamElement<T>> {
    let payload = frame.payload.as_slice();
    match frame.frame_type {
        FrameType::Data => {
            let (has_ts, rest) = payload
                .split_first()
                .ok_or_else(|| anyhow!("empty data frame"))?;
            match *has_ts {
                0 => Ok(StreamElement::Record(StreamRecord::new(
                    codec.decode(rest)?,
                ))),
                1 => {
                    if rest.len() < 8 {
                        return Err(anyhow!("truncated record timestamp"));
                    }
                    let ts = read_i64(&rest[..8], "record timestamp")?;
                    Ok(StreamElement::Record(StreamRecord::with_timestamp(
                        codec.decode(&rest[8..])?,
                        ts,
                    )))
                }
                other => Err(anyhow!("invalid record timestamp flag: {}", other)),
            }
        }
        FrameType::Watermark => {
            let ts = read_i64(payload, "watermark")?;
            Ok(StreamElement::watermark(ts))
        }
        FrameType::Status => match payload {
            [0] => Ok(StreamElement::Status(ChannelStatus::Active)),
            [1] => Ok(StreamElement::Status(ChannelStatus::Idle)),
            _ => Err(anyhow!("invalid status payload: {:?}", payload)),
        },
        FrameType::Barrier => {
            if payload.len() != 16 {
                return Err(anyhow!("invalid barrier payload: {} bytes", payload.len()));
            }
            let checkpoint_id = read_u64(&payload[..8], "checkpoint id")?;
            let ts = read_i64(&payload[8..], "barrier timestamp")?;
            Ok(StreamElement::barrier_with_timestamp(checkpoint_id, ts))
        }
        FrameType::LatencyMarker => {
            if payload.len() != 12 {
                return Err(anyhow!(
                    "invalid latency marker payload: {} bytes",
                    payload.len()
                ));
            }
            let marked_at = read_i64(&payload[..8], "latency marker")?;
            let source_task = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
            Ok(StreamElement::latency_marker(marked_at, source_task))
        }
        FrameType::End => {
            if !payload.is_empty() {
                return Err(anyhow!("end frame carries payload"));
            }
            Ok(StreamElement::End)
        }
    }
}

/// Encode a typed stream element into a frame using `codec` for data payloads.
pub fn encode_element<T>(element: &StreamElement<T>, codec: &dyn PayloadCodec<T>) -> Result<Frame> {
    match element {
        StreamElement::Record(record) => {
            let value_bytes = codec.encode(&record.value)?;
            let mut payload = Vec::with_capacity(9 + value_bytes.len());
            match record.timestamp {
                Some(ts) => {
                    payload.push(1);
                    payload.extend_from_slice(&ts.to_be_bytes());
                }
                None => payload.push(0),
            }
            payload.extend_from_slice(&value_bytes);
            Ok(Frame::new(FrameType::Data, payload))
        }
        StreamElement::Watermark(wm) => Ok(Frame::new(
            FrameType::Watermark,
            wm.timestamp.to_be_bytes().to_vec(),
        )),
        StreamElement::Status(status) => {
            let tag = match status {
                ChannelStatus::Active => 0u8,
                ChannelStatus::Idle => 1u8,
            };
            Ok(Frame::new(FrameType::Status, vec![tag]))
        }
        StreamElement::CheckpointBarrier(barrier) => {
            let mut payload = Vec::with_capacity(16);
            payload.extend_from_slice(&barrier.checkpoint_id.to_be_bytes());
            payload.extend_from_slice(&barrier.timestamp.to_be_bytes());
            Ok(Frame::new(FrameType::Barrier, payload))
        }
        StreamElement::LatencyMarker(marker) => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&marker.marked_at.to_be_bytes());
            payload.extend_from_slice(&marker.source_task.to_be_bytes());
            Ok(Frame::new(FrameType::LatencyMarker, payload))
        }
        StreamElement::End => Ok(Frame::new(FrameType::End, Vec::new())),
    }
}
