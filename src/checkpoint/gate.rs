use super::*;

/// One observable effect of feeding an element through the gate.
///
/// `process` returns effects in delivery order: a completed checkpoint's
/// [`Snapshot`](GateEvent::Snapshot) always precedes the flushed post-barrier
/// elements it unblocked.
#[derive(Debug)]
pub enum GateEvent<T> {
    /// Deliver this element downstream, tagged with its origin channel.
    Forward(ChannelIndex, StreamElement<T>),
    /// Alignment for this barrier completed; trigger the snapshot now.
    Snapshot(Barrier),
    /// This checkpoint was abandoned (buffer overflow or subsumed by a newer
    /// completed checkpoint).
    Aborted(CheckpointId),
}

/// Per-checkpoint alignment bookkeeping. Transient: created on the first
/// barrier for an id, destroyed on completion or abort.
struct AlignmentState {
    arrived: Vec<bool>,
    arrived_count: usize,
    started_at: Instant,
    timeout_reported: bool,
}

impl AlignmentState {
    fn new(ended: &[bool]) -> Self {
        // Channels that already delivered their end marker can contribute no
        // more data, so they count as arrived from the start.
        let arrived = ended.to_vec();
        let arrived_count = arrived.iter().filter(|a| **a).count();
        Self {
            arrived,
            arrived_count,
            started_at: Instant::now(),
            timeout_reported: false,
        }
    }
}

/// Aligns checkpoint barriers across all input channels.
///
/// Barrier arrivals (and the implicit arrival carried by an end marker) take
/// effect immediately, even on blocked channels; only element delivery is
/// held back. Blocking is therefore cumulative across outstanding checkpoint
/// ids: a channel's buffer flushes only once no pending alignment holds the
/// channel. Buffers are bounded per-channel queues indexed by channel id.
pub struct BarrierGate<T> {
    num_channels: usize,
    config: CheckpointConfig,
    alignments: AHashMap<CheckpointId, AlignmentState>,
    /// Elements held back per blocked channel, in arrival order. Never
    /// contains barriers: those act on arrival, not on delivery.
    buffered: Vec<VecDeque<StreamElement<T>>>,
    /// Channels whose end marker has reached the gate.
    ended: Vec<bool>,
    /// Highest checkpoint id ever completed or aborted. Barriers at or below
    /// this id are stale and ignored.
    last_cleared: Option<CheckpointId>,
}

impl<T> BarrierGate<T> {
    pub fn new(num_channels: usize, config: CheckpointConfig) -> Self {
        Self {
            num_channels,
            config,
            alignments: AHashMap::new(),
            buffered: (0..num_channels).map(|_| VecDeque::new()).collect(),
            ended: vec![false; num_channels],
            last_cleared: None,
        }
    }

    /// Feed one element from `channel` through the gate.
    pub fn process(
        &mut self,
        channel: ChannelIndex,
        element: StreamElement<T>,
    ) -> Result<Vec<GateEvent<T>>> {
        if channel >= self.num_channels {
            return Err(anyhow!("channel index {} out of bounds", channel));
        }
        let mut events = Vec::with_capacity(1);
        match element {
            StreamElement::CheckpointBarrier(barrier) => {
                self.process_barrier(channel, barrier, &mut events)?;
            }
            StreamElement::End => {
                self.process_end(channel, &mut events)?;
                self.deliver(channel, StreamElement::End, &mut events);
            }
            other => self.deliver(channel, other, &mut events),
        }
        self.flush_unblocked(&mut events);
        Ok(events)
    }

    /// Externally abort checkpoint `checkpoint_id`, discarding its alignment
    /// state and releasing the channels it blocked. The returned events carry
    /// the buffered elements that became deliverable; the caller already
    /// knows about `checkpoint_id` itself, so only older pending checkpoints
    /// it drags down produce [`GateEvent::Aborted`].
    ///
    /// The id is staled out even when no barrier for it has arrived yet, so
    /// a late barrier cannot start a fresh alignment for a checkpoint the
    /// coordinator already cancelled.
    pub fn abort(&mut self, checkpoint_id: CheckpointId) -> Vec<GateEvent<T>> {
        let mut events = Vec::new();
        let mut cancelled: Vec<CheckpointId> = self
            .alignments
            .keys()
            .copied()
            .filter(|id| *id <= checkpoint_id)
            .collect();
        cancelled.sort_unstable();
        for id in cancelled {
            self.alignments.remove(&id);
            if id == checkpoint_id {
                tracing::info!("checkpoint {} alignment cancelled", id);
            } else {
                // Staling out checkpoint_id makes this one unfinishable too.
                tracing::warn!(
                    "checkpoint {} subsumed by aborted checkpoint {}",
                    id,
                    checkpoint_id
                );
                events.push(GateEvent::Aborted(id));
            }
        }
        self.mark_cleared(checkpoint_id);
        self.flush_unblocked(&mut events);
        events
    }

    /// Report alignments that exceeded the configured timeout. Each pending
    /// checkpoint is reported at most once; resolution is up to the caller.
    pub fn expired(&mut self, now: Instant) -> Vec<CheckpointId> {
        let Some(timeout) = self.config.alignment_timeout else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        for (id, state) in self.alignments.iter_mut() {
            if !state.timeout_reported && now.duration_since(state.started_at) >= timeout {
                state.timeout_reported = true;
                tracing::warn!("checkpoint {} alignment timed out", id);
                expired.push(*id);
            }
        }
        expired.sort_unstable();
        expired
    }

    /// Instant by which the nearest pending alignment will time out, if any.
    /// Lets the driver bound its suspend so timeouts are detected while idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.config.alignment_timeout?;
        self.alignments
            .values()
            .filter(|state| !state.timeout_reported)
            .map(|state| state.started_at + timeout)
            .min()
    }

    /// Number of alignments currently pending.
    pub fn pending_alignments(&self) -> usize {
        self.alignments.len()
    }

    /// True while any channel holds buffered (unflushed) elements.
    pub fn has_buffered_input(&self) -> bool {
        self.buffered.iter().any(|queue| !queue.is_empty())
    }

    fn aligned_mode(&self) -> bool {
        self.config.mode == AlignmentMode::Aligned
    }

    /// A channel is blocked while any pending alignment has seen its barrier.
    fn blocked(&self, channel: ChannelIndex) -> bool {
        self.aligned_mode()
            && self
                .alignments
                .values()
                .any(|state| state.arrived[channel])
    }

    fn oldest_blocking_id(&self, channel: ChannelIndex) -> Option<CheckpointId> {
        self.alignments
            .iter()
            .filter(|(_, state)| state.arrived[channel])
            .map(|(id, _)| *id)
            .min()
    }

    fn process_barrier(
        &mut self,
        channel: ChannelIndex,
        barrier: Barrier,
        events: &mut Vec<GateEvent<T>>,
    ) -> Result<()> {
        if self
            .last_cleared
            .is_some_and(|cleared| barrier.checkpoint_id <= cleared)
        {
            // Late barrier from a checkpoint that already completed or
            // aborted. Ignoring it keeps re-delivery idempotent.
            tracing::debug!(
                "ignoring stale barrier {} on channel {}",
                barrier.checkpoint_id,
                channel
            );
            return Ok(());
        }

        let ended = &self.ended;
        let state = self
            .alignments
            .entry(barrier.checkpoint_id)
            .or_insert_with(|| AlignmentState::new(ended));

        if state.arrived[channel] {
            return Err(anyhow!(
                "duplicate barrier {} on channel {}",
                barrier.checkpoint_id,
                channel
            ));
        }
        state.arrived[channel] = true;
        state.arrived_count += 1;

        if state.arrived_count == self.num_channels {
            self.complete(barrier, events);
        }
        Ok(())
    }

    /// An end marker is an implicit barrier arrival: the channel can deliver
    /// no more data, so it cannot hold back any pending alignment.
    fn process_end(&mut self, channel: ChannelIndex, events: &mut Vec<GateEvent<T>>) -> Result<()> {
        self.ended[channel] = true;

        let mut pending: Vec<CheckpointId> = self.alignments.keys().copied().collect();
        pending.sort_unstable();
        for id in pending {
            let Some(state) = self.alignments.get_mut(&id) else {
                // Subsumed by an earlier completion in this same loop.
                continue;
            };
            if state.arrived[channel] {
                continue;
            }
            state.arrived[channel] = true;
            state.arrived_count += 1;
            if state.arrived_count == self.num_channels {
                self.complete(Barrier::new(id), events);
            }
        }
        Ok(())
    }

    fn complete(&mut self, barrier: Barrier, events: &mut Vec<GateEvent<T>>) {
        self.alignments.remove(&barrier.checkpoint_id);
        self.mark_cleared(barrier.checkpoint_id);
        events.push(GateEvent::Snapshot(barrier));

        // A completed checkpoint subsumes older pending ones: their barriers
        // are now stale and can never finish aligning.
        let mut subsumed: Vec<CheckpointId> = self
            .alignments
            .keys()
            .copied()
            .filter(|id| *id < barrier.checkpoint_id)
            .collect();
        subsumed.sort_unstable();
        for id in subsumed {
            self.alignments.remove(&id);
            tracing::warn!(
                "checkpoint {} subsumed by completed checkpoint {}",
                id,
                barrier.checkpoint_id
            );
            events.push(GateEvent::Aborted(id));
        }
    }

    /// Forward immediately, or hold back while the channel is blocked. A
    /// buffer overflow aborts the blocking checkpoint(s) rather than the
    /// task: the channel's data is still valid, the snapshot is not.
    fn deliver(
        &mut self,
        channel: ChannelIndex,
        element: StreamElement<T>,
        events: &mut Vec<GateEvent<T>>,
    ) {
        if !self.blocked(channel) {
            events.push(GateEvent::Forward(channel, element));
            return;
        }
        while self.blocked(channel)
            && self.buffered[channel].len() >= self.config.max_buffered_per_channel
        {
            // blocked() implies at least one alignment holds this channel.
            let Some(id) = self.oldest_blocking_id(channel) else {
                break;
            };
            tracing::warn!(
                "channel {} buffer overflow, aborting checkpoint {}",
                channel,
                id
            );
            self.alignments.remove(&id);
            self.mark_cleared(id);
            events.push(GateEvent::Aborted(id));
        }
        // The channel may have unblocked above; queueing regardless keeps
        // per-channel order, the flush below empties it.
        self.buffered[channel].push_back(element);
    }

    /// Flush buffers of channels no pending alignment holds any more.
    fn flush_unblocked(&mut self, events: &mut Vec<GateEvent<T>>) {
        for channel in 0..self.num_channels {
            if !self.blocked(channel) {
                while let Some(element) = self.buffered[channel].pop_front() {
                    events.push(GateEvent::Forward(channel, element));
                }
            }
        }
    }

    fn mark_cleared(&mut self, checkpoint_id: CheckpointId) {
        self.last_cleared = Some(
            self.last_cleared
                .map_or(checkpoint_id, |prev| prev.max(checkpoint_id)),
        );
    }
}
