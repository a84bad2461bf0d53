//! The cooperative processing loop driving one task's ingestion pipeline.
//!
//! Each iteration pulls at most one element through
//! multiplexer -> gate -> valve -> sink, then services the mailbox. The loop
//! runs on a single thread; other threads interact with it only through the
//! [`TaskMailbox`] (cancellation, checkpoint aborts, deferred work) and the
//! channel producers. When no input is available the loop suspends on a
//! readiness select instead of spinning, bounded by the nearest alignment
//! deadline so barrier timeouts are detected while idle.

use std::time::Instant;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Select, Sender};

use crate::checkpoint::{BarrierGate, CheckpointConfig, GateEvent, SnapshotHook};
use crate::multiplexer::{ChannelMultiplexer, Polled};
use crate::output::SinkOutput;
use crate::types::CheckpointId;
use crate::valve::StatusWatermarkValve;

/// Work item delivered to the processing thread between poll iterations.
pub enum Mail {
    /// Stop the loop promptly, discarding unflushed alignment buffers.
    Cancel,
    /// Discard a pending checkpoint's alignment state and release the
    /// channels it blocks.
    AbortCheckpoint(CheckpointId),
    /// Deferred work (timer firings, completed async continuations) executed
    /// on the processing thread.
    Run(Box<dyn FnOnce() + Send>),
}

/// Cloneable handle for posting work to a running task.
#[derive(Clone)]
pub struct TaskMailbox {
    sender: Sender<Mail>,
}

impl TaskMailbox {
    /// Request prompt cancellation. Wakes the loop if it is suspended.
    pub fn cancel(&self) {
        let _ = self.sender.send(Mail::Cancel);
    }

    /// Abort a pending checkpoint (e.g. after an alignment timeout).
    pub fn abort_checkpoint(&self, checkpoint_id: CheckpointId) {
        let _ = self.sender.send(Mail::AbortCheckpoint(checkpoint_id));
    }

    /// Run `action` on the processing thread between poll iterations.
    pub fn execute(&self, action: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Mail::Run(Box::new(action)));
    }
}

/// How the processing loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Termination {
    /// Every input channel delivered its end marker.
    Finished,
    /// An external cancel unwound the loop.
    Cancelled,
}

/// Single-threaded driver for one task's ingestion pipeline.
pub struct IngestionTask<T, O> {
    multiplexer: ChannelMultiplexer<T>,
    gate: BarrierGate<T>,
    valve: StatusWatermarkValve,
    output: O,
    hook: Box<dyn SnapshotHook>,
    mailbox: Receiver<Mail>,
    mailbox_sender: Sender<Mail>,
    cancelled: bool,
}

impl<T, O: SinkOutput<T>> IngestionTask<T, O> {
    pub fn new(multiplexer: ChannelMultiplexer<T>, output: O, hook: Box<dyn SnapshotHook>) -> Self {
        let num_channels = multiplexer.num_channels();
        let (mailbox_sender, mailbox) = unbounded();
        Self {
            multiplexer,
            gate: BarrierGate::new(num_channels, CheckpointConfig::default()),
            valve: StatusWatermarkValve::new(num_channels),
            output,
            hook,
            mailbox,
            mailbox_sender,
            cancelled: false,
        }
    }

    /// Replace the default checkpoint configuration. Call before `run`.
    pub fn with_checkpoint_config(mut self, config: CheckpointConfig) -> Self {
        self.gate = BarrierGate::new(self.multiplexer.num_channels(), config);
        self
    }

    /// Handle for other threads to post work to this task.
    pub fn mailbox(&self) -> TaskMailbox {
        TaskMailbox {
            sender: self.mailbox_sender.clone(),
        }
    }

    /// Run the processing loop to termination.
    ///
    /// Errors from the pipeline (channel errors, order violations, consumer
    /// failures) propagate out and are fatal for the task.
    pub fn run(&mut self) -> Result<Termination> {
        loop {
            self.drain_mailbox()?;
            if self.cancelled {
                tracing::info!("task cancelled, discarding in-flight alignment state");
                return Ok(Termination::Cancelled);
            }

            for checkpoint_id in self.gate.expired(Instant::now()) {
                self.hook.alignment_timed_out(checkpoint_id);
            }

            match self.multiplexer.poll()? {
                Polled::Event { channel, element } => {
                    let events = self.gate.process(channel, element)?;
                    self.apply_gate_events(events)?;
                }
                Polled::NothingAvailable => self.suspend(),
                Polled::AllExhausted => {
                    tracing::debug!("all input channels exhausted, task finishing");
                    return Ok(Termination::Finished);
                }
            }
        }
    }

    fn apply_gate_events(&mut self, events: Vec<GateEvent<T>>) -> Result<()> {
        for event in events {
            match event {
                GateEvent::Forward(channel, element) => {
                    self.valve.input(channel, element, &mut self.output)?;
                }
                GateEvent::Snapshot(barrier) => self.hook.trigger_snapshot(barrier)?,
                GateEvent::Aborted(checkpoint_id) => self.hook.checkpoint_aborted(checkpoint_id),
            }
        }
        Ok(())
    }

    fn drain_mailbox(&mut self) -> Result<()> {
        while let Ok(mail) = self.mailbox.try_recv() {
            match mail {
                Mail::Cancel => self.cancelled = true,
                Mail::AbortCheckpoint(checkpoint_id) => {
                    let events = self.gate.abort(checkpoint_id);
                    self.apply_gate_events(events)?;
                }
                Mail::Run(action) => action(),
            }
        }
        Ok(())
    }

    /// Block until any channel has input, the mailbox has mail, or the
    /// nearest alignment deadline passes. The loop re-polls after waking.
    fn suspend(&self) {
        let mut select = Select::new();
        select.recv(&self.mailbox);
        self.multiplexer.register_ready(&mut select);
        match self.gate.next_deadline() {
            Some(deadline) => {
                let _ = select.ready_deadline(deadline);
            }
            None => {
                let _ = select.ready();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{input_channel_default, ChannelProducer};
    use crate::frame::BytesCodec;
    use crate::output::testing::{RecordingConsumer, SinkCall};
    use crate::output::{ConsumerOutput, WatermarkGauge};
    use crate::types::{Barrier, ChannelStatus};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingHook {
        snapshots: Arc<Mutex<Vec<CheckpointId>>>,
        timeouts: Arc<Mutex<Vec<CheckpointId>>>,
        aborts: Arc<Mutex<Vec<CheckpointId>>>,
    }

    impl SnapshotHook for RecordingHook {
        fn trigger_snapshot(&mut self, barrier: Barrier) -> Result<()> {
            self.snapshots.lock().unwrap().push(barrier.checkpoint_id);
            Ok(())
        }

        fn alignment_timed_out(&mut self, checkpoint_id: CheckpointId) {
            self.timeouts.lock().unwrap().push(checkpoint_id);
        }

        fn checkpoint_aborted(&mut self, checkpoint_id: CheckpointId) {
            self.aborts.lock().unwrap().push(checkpoint_id);
        }
    }

    fn task_with_channels(
        num_channels: usize,
        config: CheckpointConfig,
    ) -> (
        Vec<ChannelProducer<Vec<u8>>>,
        RecordingConsumer<Vec<u8>>,
        RecordingHook,
        WatermarkGauge,
        IngestionTask<Vec<u8>, ConsumerOutput<Vec<u8>>>,
    ) {
        let mut producers = Vec::new();
        let mut readers = Vec::new();
        for channel in 0..num_channels {
            let (producer, reader) = input_channel_default(channel, Arc::new(BytesCodec));
            producers.push(producer);
            readers.push(reader);
        }
        let consumer = RecordingConsumer::new();
        let hook = RecordingHook::default();
        let gauge = WatermarkGauge::new();
        let task = IngestionTask::new(
            ChannelMultiplexer::new(readers),
            ConsumerOutput::new(Box::new(consumer.clone()), gauge.clone()),
            Box::new(hook.clone()),
        )
        .with_checkpoint_config(config);
        (producers, consumer, hook, gauge, task)
    }

    #[test]
    fn test_run_to_completion_forwards_and_snapshots() {
        let (producers, consumer, hook, gauge, mut task) =
            task_with_channels(2, CheckpointConfig::default());

        producers[0].send_record(vec![1]).unwrap();
        producers[0].send_watermark(10).unwrap();
        producers[0].send_barrier(1).unwrap();
        producers[0].send_record(vec![2]).unwrap(); // post-barrier
        producers[1].send_watermark(5).unwrap();
        producers[1].send_barrier(1).unwrap();
        producers[0].send_end().unwrap();
        producers[1].send_end().unwrap();

        let termination = task.run().unwrap();
        assert_eq!(termination, Termination::Finished);

        assert_eq!(consumer.records(), vec![vec![1], vec![2]]);
        // 5 when both channels have reported, 10 once channel 1 ends and
        // drops out of the min set.
        assert_eq!(consumer.watermarks(), vec![5, 10]);
        assert_eq!(*hook.snapshots.lock().unwrap(), vec![1]);
        assert_eq!(gauge.get(), 10);
        assert_eq!(consumer.calls().last(), Some(&SinkCall::End));
    }

    #[test]
    fn test_snapshot_precedes_post_barrier_records() {
        // Channel 0's post-barrier record must not reach the consumer before
        // channel 1's pre-barrier record: alignment holds it back.
        let (producers, consumer, _hook, _gauge, mut task) =
            task_with_channels(2, CheckpointConfig::default());

        producers[0].send_record(vec![1]).unwrap();
        producers[0].send_barrier(7).unwrap();
        producers[0].send_record(vec![2]).unwrap();
        producers[0].send_end().unwrap();
        producers[1].send_record(vec![3]).unwrap();
        producers[1].send_barrier(7).unwrap();
        producers[1].send_end().unwrap();

        task.run().unwrap();

        let records = consumer.records();
        // Channel order within each channel is preserved, and the blocked
        // record [2] comes out after alignment, hence after [3].
        let pos2 = records.iter().position(|r| r == &vec![2u8]).unwrap();
        let pos3 = records.iter().position(|r| r == &vec![3u8]).unwrap();
        assert!(pos3 < pos2, "post-barrier record leaked early: {records:?}");
    }

    #[test]
    fn test_cancel_wakes_suspended_loop() {
        let (_producers, _consumer, _hook, _gauge, mut task) =
            task_with_channels(1, CheckpointConfig::default());
        let mailbox = task.mailbox();

        let handle = std::thread::spawn(move || task.run());
        // Give the loop a moment to reach its suspend point.
        std::thread::sleep(Duration::from_millis(20));
        mailbox.cancel();

        let termination = handle.join().unwrap().unwrap();
        assert_eq!(termination, Termination::Cancelled);
    }

    #[test]
    fn test_abort_checkpoint_releases_buffered_records() {
        let (producers, consumer, _hook, _gauge, mut task) =
            task_with_channels(2, CheckpointConfig::default());
        let mailbox = task.mailbox();

        producers[0].send_barrier(3).unwrap();
        producers[0].send_record(vec![9]).unwrap(); // blocked behind barrier 3

        let handle = std::thread::spawn(move || task.run());
        std::thread::sleep(Duration::from_millis(20));
        assert!(consumer.records().is_empty());

        mailbox.abort_checkpoint(3);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(consumer.records(), vec![vec![9]]);

        mailbox.cancel();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_mailbox_runs_deferred_work_on_processing_thread() {
        let (_producers, _consumer, _hook, _gauge, mut task) =
            task_with_channels(1, CheckpointConfig::default());
        let mailbox = task.mailbox();

        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        mailbox.execute(move || *fired_clone.lock().unwrap() = true);
        mailbox.cancel();

        task.run().unwrap();
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn test_alignment_timeout_reported_while_idle() {
        let config = CheckpointConfig {
            alignment_timeout: Some(Duration::from_millis(10)),
            ..CheckpointConfig::default()
        };
        let (producers, _consumer, hook, _gauge, mut task) = task_with_channels(2, config);
        let mailbox = task.mailbox();

        // Barrier on one channel only: alignment can never complete.
        producers[0].send_barrier(4).unwrap();

        let handle = std::thread::spawn(move || task.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if hook.timeouts.lock().unwrap().contains(&4) {
                break;
            }
            assert!(Instant::now() < deadline, "timeout was never reported");
            std::thread::sleep(Duration::from_millis(5));
        }

        mailbox.cancel();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_idle_channel_does_not_stall_watermarks() {
        let (producers, consumer, _hook, _gauge, mut task) =
            task_with_channels(2, CheckpointConfig::default());

        producers[0].send_watermark(10).unwrap();
        producers[0].send_record(vec![1]).unwrap();
        producers[0].send_end().unwrap();
        producers[1].send_watermark(5).unwrap();
        producers[1].send_status(ChannelStatus::Idle).unwrap();
        producers[1].send_end().unwrap();

        task.run().unwrap();
        // Channel 1 going idle leaves channel 0 alone in the min set, so the
        // merged watermark advances from 5 to 10 without new channel 0 input.
        assert_eq!(consumer.watermarks(), vec![5, 10]);
    }
}
