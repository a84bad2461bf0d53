//! The hand-off point to the downstream consumer.
//!
//! Everything the valve decides to forward leaves the pipeline through a
//! [`SinkOutput`]. The default implementation, [`ConsumerOutput`], delivers
//! to a [`StreamConsumer`] (the operator) and maintains the input watermark
//! gauge — the single piece of pipeline state that other threads may read.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::types::{ChannelStatus, EventTime, LatencyMarker, StreamRecord, Watermark, EVENT_TIME_MIN};

/// The consumer ("operator") interface. All methods are invoked on the
/// processing thread only; errors propagate unchanged to the processing loop
/// and are fatal for the task.
pub trait StreamConsumer<T>: Send {
    /// Establish the per-key routing context for `record`. Always called
    /// immediately before [`process_record`](Self::process_record) for the
    /// same record, on the same thread, so any keyed state the consumer
    /// touches during processing is scoped to the correct key.
    fn set_key_context(&mut self, record: &StreamRecord<T>) -> Result<()>;

    fn process_record(&mut self, record: StreamRecord<T>) -> Result<()>;

    fn process_watermark(&mut self, watermark: Watermark) -> Result<()>;

    fn process_status(&mut self, status: ChannelStatus) -> Result<()>;

    fn process_latency_marker(&mut self, marker: LatencyMarker) -> Result<()>;

    /// All input channels have ended; no further calls will follow.
    fn end_of_input(&mut self) -> Result<()>;
}

/// Last watermark forwarded to the consumer, readable by telemetry
/// collaborators from any thread. Never read for control decisions inside
/// the pipeline.
#[derive(Clone)]
pub struct WatermarkGauge {
    value: Arc<AtomicI64>,
}

impl Default for WatermarkGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl WatermarkGauge {
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicI64::new(EVENT_TIME_MIN)),
        }
    }

    pub fn set(&self, timestamp: EventTime) {
        self.value.store(timestamp, Ordering::Relaxed);
    }

    pub fn get(&self) -> EventTime {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sink methods the valve forwards through. Split from [`StreamConsumer`] so
/// tests can observe the valve's decisions without a full consumer.
pub trait SinkOutput<T> {
    fn emit_record(&mut self, record: StreamRecord<T>) -> Result<()>;
    fn emit_watermark(&mut self, watermark: Watermark) -> Result<()>;
    fn emit_status(&mut self, status: ChannelStatus) -> Result<()>;
    fn emit_latency_marker(&mut self, marker: LatencyMarker) -> Result<()>;
    fn emit_end(&mut self) -> Result<()>;
}

/// Forwards synchronously to a consumer, keeping the watermark gauge current.
pub struct ConsumerOutput<T> {
    consumer: Box<dyn StreamConsumer<T>>,
    gauge: WatermarkGauge,
}

impl<T> ConsumerOutput<T> {
    pub fn new(consumer: Box<dyn StreamConsumer<T>>, gauge: WatermarkGauge) -> Self {
        Self { consumer, gauge }
    }
}

impl<T> SinkOutput<T> for ConsumerOutput<T> {
    fn emit_record(&mut self, record: StreamRecord<T>) -> Result<()> {
        // Key context and delivery form one atomic step on this thread.
        self.consumer.set_key_context(&record)?;
        self.consumer.process_record(record)
    }

    fn emit_watermark(&mut self, watermark: Watermark) -> Result<()> {
        self.gauge.set(watermark.timestamp);
        self.consumer.process_watermark(watermark)
    }

    fn emit_status(&mut self, status: ChannelStatus) -> Result<()> {
        self.consumer.process_status(status)
    }

    fn emit_latency_marker(&mut self, marker: LatencyMarker) -> Result<()> {
        self.consumer.process_latency_marker(marker)
    }

    fn emit_end(&mut self) -> Result<()> {
        self.consumer.end_of_input()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// What a sink observed, in order.
    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkCall<T> {
        KeyContext(Option<EventTime>),
        Record(T),
        Watermark(EventTime),
        Status(ChannelStatus),
        LatencyMarker(EventTime),
        End,
    }

    /// Records every emission. Cloning shares the call log, so a test can
    /// hand one handle to the pipeline and keep another for assertions.
    pub struct RecordingConsumer<T> {
        calls: Arc<Mutex<Vec<SinkCall<T>>>>,
    }

    impl<T> Clone for RecordingConsumer<T> {
        fn clone(&self) -> Self {
            Self {
                calls: self.calls.clone(),
            }
        }
    }

    impl<T: Clone> Default for RecordingConsumer<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T: Clone> RecordingConsumer<T> {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn calls(&self) -> Vec<SinkCall<T>> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: SinkCall<T>) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn records(&self) -> Vec<T> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    SinkCall::Record(value) => Some(value),
                    _ => None,
                })
                .collect()
        }

        pub fn watermarks(&self) -> Vec<EventTime> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    SinkCall::Watermark(ts) => Some(ts),
                    _ => None,
                })
                .collect()
        }

        pub fn statuses(&self) -> Vec<ChannelStatus> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    SinkCall::Status(status) => Some(status),
                    _ => None,
                })
                .collect()
        }
    }

    impl<T: Clone + Send> StreamConsumer<T> for RecordingConsumer<T> {
        fn set_key_context(&mut self, record: &StreamRecord<T>) -> Result<()> {
            self.push(SinkCall::KeyContext(record.timestamp));
            Ok(())
        }

        fn process_record(&mut self, record: StreamRecord<T>) -> Result<()> {
            self.push(SinkCall::Record(record.value));
            Ok(())
        }

        fn process_watermark(&mut self, watermark: Watermark) -> Result<()> {
            self.push(SinkCall::Watermark(watermark.timestamp));
            Ok(())
        }

        fn process_status(&mut self, status: ChannelStatus) -> Result<()> {
            self.push(SinkCall::Status(status));
            Ok(())
        }

        fn process_latency_marker(&mut self, marker: LatencyMarker) -> Result<()> {
            self.push(SinkCall::LatencyMarker(marker.marked_at));
            Ok(())
        }

        fn end_of_input(&mut self) -> Result<()> {
            self.push(SinkCall::End);
            Ok(())
        }
    }

    /// As a raw sink, the recorder skips key-context bookkeeping so valve
    /// tests see exactly what the valve decided to forward.
    impl<T: Clone> SinkOutput<T> for RecordingConsumer<T> {
        fn emit_record(&mut self, record: StreamRecord<T>) -> Result<()> {
            self.push(SinkCall::Record(record.value));
            Ok(())
        }

        fn emit_watermark(&mut self, watermark: Watermark) -> Result<()> {
            self.push(SinkCall::Watermark(watermark.timestamp));
            Ok(())
        }

        fn emit_status(&mut self, status: ChannelStatus) -> Result<()> {
            self.push(SinkCall::Status(status));
            Ok(())
        }

        fn emit_latency_marker(&mut self, marker: LatencyMarker) -> Result<()> {
            self.push(SinkCall::LatencyMarker(marker.marked_at));
            Ok(())
        }

        fn emit_end(&mut self) -> Result<()> {
            self.push(SinkCall::End);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingConsumer, SinkCall};
    use super::*;

    #[test]
    fn test_key_context_established_before_record_delivery() {
        let recorder = RecordingConsumer::<i32>::new();
        let mut output = ConsumerOutput::new(Box::new(recorder.clone()), WatermarkGauge::new());
        output
            .emit_record(StreamRecord::with_timestamp(7, 100))
            .unwrap();
        assert_eq!(
            recorder.calls(),
            vec![SinkCall::KeyContext(Some(100)), SinkCall::Record(7)]
        );
    }

    #[test]
    fn test_gauge_starts_at_no_watermark_sentinel() {
        // Both constructors must agree: no watermark seen yet, not zero.
        assert_eq!(WatermarkGauge::new().get(), EVENT_TIME_MIN);
        assert_eq!(WatermarkGauge::default().get(), EVENT_TIME_MIN);
    }

    #[test]
    fn test_gauge_updated_on_watermark_emission() {
        let gauge = WatermarkGauge::new();
        assert_eq!(gauge.get(), EVENT_TIME_MIN);
        let mut output: ConsumerOutput<i32> =
            ConsumerOutput::new(Box::new(RecordingConsumer::new()), gauge.clone());
        output.emit_watermark(Watermark::new(42)).unwrap();
        assert_eq!(gauge.get(), 42);
    }

    #[test]
    fn test_gauge_readable_from_another_thread() {
        let gauge = WatermarkGauge::new();
        gauge.set(17);
        let remote = gauge.clone();
        let handle = std::thread::spawn(move || remote.get());
        assert_eq!(handle.join().unwrap(), 17);
    }
}
