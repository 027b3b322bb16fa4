use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::ReliabilityConfig;
use crate::error::TransportError;
use crate::message_dispatcher::MessageDispatcher;
use crate::metrics::ReliabilityMetrics;
use crate::reorder::OrderedReassembler;
use crate::rtt::RttEstimator;
use crate::send_unit::{ResendReason, SendUnit};
use crate::send_window::{SendWindow, Slot};
use crate::seq::{SeqNr, SeqRange};
use crate::socket::DatagramSocket;
use crate::wire::{AckRange, AckRanges, DataUnit, Datagram, Message, MessageOrdering, Reliability, ORDERING_CHANNELS};

struct EngineInner {
    config: Arc<ReliabilityConfig>,
    socket: Arc<dyn DatagramSocket>,
    dispatcher: Arc<dyn MessageDispatcher>,

    // send side
    send_queue: VecDeque<Message>,
    snd_window: SendWindow,
    rtt: RttEstimator,
    next_order_index: [SeqNr; ORDERING_CHANNELS as usize],
    flush_scheduled: bool,
    flush_handle: Option<JoinHandle<()>>,

    // receive side
    /// highest accepted sequence number; gaps up to it have been NACK'ed
    ///  already. Starts one before 0 in the circular space.
    last_accepted_seq: SeqNr,
    reassemblers: [OrderedReassembler; ORDERING_CHANNELS as usize],

    metrics: ReliabilityMetrics,
    /// cleared on teardown so late-firing timer callbacks become no-ops
    active: bool,
}

impl EngineInner {
    async fn emit(&self, datagram: Datagram) {
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        self.socket.send_datagram(&buf).await;
    }

    /// Drains the queue into send units and puts them on the wire, stopping at
    ///  the configured window size. Messages that don't fit stay queued for the
    ///  next flush triggered by acks freeing up space.
    async fn flush_queue(&mut self, now: Instant) -> Result<(), TransportError> {
        let limit = self.config.unit_payload_limit();
        loop {
            if self.send_queue.is_empty() {
                break;
            }
            if self.snd_window.length() >= self.config.send_window_size {
                trace!("send window occupied up to the configured size - leaving {} messages queued", self.send_queue.len());
                break;
            }
            let unit = self.next_send_unit(limit);
            self.send_unit(unit, now).await?;
        }
        self.flush_scheduled = false;
        Ok(())
    }

    /// Packs the head of the queue into one unit, appending further messages
    ///  while they fit the size limit.
    fn next_send_unit(&mut self, limit: usize) -> SendUnit {
        let first_message = self.send_queue.pop_front()
            .expect("flushing an empty send queue");
        let mut unit = SendUnit::new(first_message);

        while let Some(next) = self.send_queue.front() {
            if unit.encoded_len() >= limit || unit.encoded_len() + next.encoded_len() >= limit {
                break;
            }
            let next = self.send_queue.pop_front().expect("peeked message vanished");
            unit.append(next);
        }

        self.metrics.msg_to_unit += 1;
        unit
    }

    /// Assigns the next sequence number to the unit and puts it on the wire.
    ///  Used for first sends and resends alike; the retransmission bound is the
    ///  engine's only fatal send-path condition.
    async fn send_unit(&mut self, unit: SendUnit, now: Instant) -> Result<(), TransportError> {
        let initial_rto = self.rtt.rx_rto() + self.config.rto_first_send_slack;

        let (seq, attempt, buf) = {
            let (seq, unit) = self.snd_window.insert(unit)
                .expect("send window capacity exhausted");
            unit.mark_sent(seq, initial_rto, now);

            let mut buf = BytesMut::new();
            DataUnit::ser_slice(seq, unit.messages(), &mut buf);
            (seq, unit.attempt_count(), buf)
        };

        if attempt >= self.config.max_retransmissions {
            return Err(TransportError::RetransmissionExhausted { attempts: attempt });
        }

        if attempt > 1 {
            self.metrics.units_resent += 1;
        }
        self.metrics.units_sent += 1;

        trace!("sending data unit {} (attempt {})", seq, attempt);
        self.socket.send_datagram(&buf).await;
        Ok(())
    }

    /// Moves every unit marked due out of its slot and resends it under a fresh
    ///  sequence number, as long as the window has spare capacity.
    async fn resend_due_units(&mut self, now: Instant) -> Result<(), TransportError> {
        if self.snd_window.is_empty() {
            return Ok(());
        }
        let begin = self.snd_window.first();
        let bound = self.snd_window.next_seq();

        for seq in SeqRange::new(begin, bound) {
            if self.snd_window.is_full() {
                break;
            }
            let due = match self.snd_window.slot_mut(seq) {
                Some(Slot::Live(unit)) if !unit.is_acknowledged() => unit.due_reason(),
                _ => None,
            };
            let Some(reason) = due else { continue };

            let unit = self.snd_window.extract(seq)
                .expect("due unit vanished from its slot");
            match reason {
                ResendReason::Rto => self.metrics.rto_resends += 1,
                ResendReason::Nack => self.metrics.nack_resends += 1,
                ResendReason::FastAck => self.metrics.fast_resends += 1,
            }
            debug!("resending unit previously sent as {} ({:?})", seq, reason);
            self.send_unit(unit, now).await?;
        }
        Ok(())
    }

    fn check_timeouts(&mut self, now: Instant) {
        let rx_rto = self.rtt.rx_rto();
        let threshold = self.config.fast_resend_threshold;
        let begin = self.snd_window.first();
        let bound = self.snd_window.next_seq();

        for seq in SeqRange::new(begin, bound) {
            if let Some(Slot::Live(unit)) = self.snd_window.slot_mut(seq) {
                if !unit.is_acknowledged() {
                    unit.tick(rx_rto, threshold, now);
                }
            }
        }
    }

    /// The periodic retransmission check.
    async fn on_tick(&mut self, now: Instant) -> Result<(), TransportError> {
        if self.snd_window.is_empty() {
            return Ok(());
        }
        self.check_timeouts(now);
        self.resend_due_units(now).await?;
        self.snd_window.reclaim_prefix();
        if !self.flush_scheduled {
            self.flush_queue(now).await?;
        }
        Ok(())
    }

    async fn on_ack(&mut self, ranges: AckRanges, now: Instant) -> Result<(), TransportError> {
        for range in &ranges.0 {
            if !self.snd_window.contains(range.end) {
                debug!("ack range [{}, {}] is outside the window - ignoring", range.start, range.end);
                continue;
            }
            self.apply_ack_range(range.start, range.end, now);
        }
        self.snd_window.reclaim_prefix();
        self.flush_queue(now).await
    }

    /// Walks the window from its head so that units below the acked span
    ///  collect duplicate-ack credit while units inside it are acknowledged.
    fn apply_ack_range(&mut self, start: SeqNr, end: SeqNr, now: Instant) {
        let bound = end.add(1);
        let first = self.snd_window.first();

        for seq in SeqRange::new(first, bound) {
            match self.snd_window.slot_mut(seq) {
                Some(Slot::Live(unit)) => {
                    if unit.is_acknowledged() {
                        continue;
                    }
                    if SeqNr::between(start, bound, seq) {
                        unit.mark_acknowledged();
                        if unit.attempt_count() == 1 {
                            // sample only unambiguous round trips: a resent
                            //  unit's ack cannot be attributed to one send
                            let sample = unit.rtt_sample(now);
                            self.rtt.update(sample);
                        }
                    }
                    else {
                        unit.register_fast_ack();
                    }
                }
                Some(Slot::Retired) => {
                    if SeqNr::between(start, bound, seq) {
                        // ack for a transmission that was resent in the
                        //  meantime - informational only
                        self.metrics.unneeded_resends += 1;
                    }
                }
                _ => {}
            }
        }
    }

    async fn on_nack(&mut self, ranges: AckRanges, now: Instant) -> Result<(), TransportError> {
        for range in &ranges.0 {
            if !self.snd_window.contains(range.end) {
                debug!("nack range [{}, {}] is outside the window - ignoring", range.start, range.end);
                continue;
            }
            let begin = if self.snd_window.contains(range.start) { range.start } else { self.snd_window.first() };
            for seq in SeqRange::new(begin, range.end.add(1)) {
                if let Some(Slot::Live(unit)) = self.snd_window.slot_mut(seq) {
                    if !unit.is_acknowledged() {
                        unit.mark_nacked();
                    }
                }
            }
        }
        self.resend_due_units(now).await?;
        self.snd_window.reclaim_prefix();
        self.flush_queue(now).await
    }

    async fn on_data_unit(&mut self, unit: DataUnit, _now: Instant) -> Result<(), TransportError> {
        let seq = unit.seq;
        let delta = self.last_accepted_seq.delta(seq);

        if delta < 1 || delta > self.config.max_out_of_order_span {
            trace!("data unit {} is a duplicate or too far ahead (delta {}) - dropping", seq, delta);
            self.metrics.duplicate_units_dropped += 1;
            return Ok(());
        }

        if delta > 1 {
            let nack_start = self.last_accepted_seq.add(1);
            let nack_end = seq.add(-1);
            debug!("gap before data unit {} - requesting [{}, {}]", seq, nack_start, nack_end);
            self.emit(Datagram::Nack(AckRanges(vec![AckRange { start: nack_start, end: nack_end }]))).await;
        }

        self.emit(Datagram::Ack(AckRanges(vec![AckRange::single(seq)]))).await;
        self.last_accepted_seq = seq;

        for message in unit.messages {
            self.release_message(message).await?;
        }
        Ok(())
    }

    async fn release_message(&mut self, message: Message) -> Result<(), TransportError> {
        if let Some(MessageOrdering { channel, order_index }) = message.ordering {
            let released = self.reassemblers[channel as usize].submit(order_index, message)?;
            for released in released {
                self.dispatcher.deliver(&released.payload).await;
            }
        }
        else {
            self.dispatcher.deliver(&message.payload).await;
        }
        Ok(())
    }

    /// All fatal conditions funnel through here: tear down once, notify once.
    async fn fail_connection(&mut self, error: TransportError) {
        if !self.active {
            return;
        }
        warn!("closing connection: {}", error);
        self.teardown();
        self.dispatcher.on_connection_failed(error).await;
    }

    fn teardown(&mut self) {
        self.active = false;
        if let Some(handle) = self.flush_handle.take() {
            handle.abort();
        }
        self.send_queue.clear();
        self.snd_window.reset();
        self.flush_scheduled = false;
    }
}

/// The per-connection reliability state machine: outbound batching and
///  windowed retransmission on the send side, duplicate/gap tracking with
///  ACK/NACK emission and ordered reassembly on the receive side.
///
/// All state lives behind one lock and is only ever touched from the
///  connection's execution context; the periodic retransmission check and the
///  coalescing flush are spawned tasks on that same context.
pub struct ReliabilityEngine {
    config: Arc<ReliabilityConfig>,
    inner: Arc<RwLock<EngineInner>>,
    rto_loop_handle: Option<JoinHandle<()>>,
}

impl Drop for ReliabilityEngine {
    fn drop(&mut self) {
        if let Some(handle) = &self.rto_loop_handle {
            handle.abort();
        }
    }
}

impl ReliabilityEngine {
    pub fn new(
        config: Arc<ReliabilityConfig>,
        socket: Arc<dyn DatagramSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> ReliabilityEngine {
        let max_ordering_loss = config.max_ordering_loss;
        let inner = EngineInner {
            config: config.clone(),
            socket,
            dispatcher,
            send_queue: VecDeque::new(),
            snd_window: SendWindow::new(config.window_capacity_power()),
            rtt: RttEstimator::new(config.rto_interval, config.rto_min, config.rto_max),
            next_order_index: [SeqNr::ZERO; ORDERING_CHANNELS as usize],
            flush_scheduled: false,
            flush_handle: None,
            last_accepted_seq: SeqNr::MAX,
            reassemblers: std::array::from_fn(|channel| OrderedReassembler::new(channel as u8, max_ordering_loss)),
            metrics: ReliabilityMetrics::default(),
            active: true,
        };

        ReliabilityEngine {
            config,
            inner: Arc::new(RwLock::new(inner)),
            rto_loop_handle: None,
        }
    }

    /// Starts the periodic retransmission check. Runs until the connection is
    ///  torn down; aborted on drop.
    pub fn spawn_rto_loop(&mut self) {
        let rto_interval = self.config.rto_interval;
        let inner_arc = self.inner.clone();

        self.rto_loop_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + rto_interval, rto_interval);
            loop {
                interval.tick().await;

                let mut inner = inner_arc.write().await;
                if !inner.active {
                    break;
                }
                if let Err(error) = inner.on_tick(Instant::now()).await {
                    inner.fail_connection(error).await;
                    break;
                }
            }
        }));
    }

    /// Queues one message for reliable transmission. Ordered messages get
    ///  their per-channel order index stamped here.
    ///
    /// The actual send is coalesced: the first submission arms a one-shot
    ///  flush a tenth of a round trip away, so rapid submissions share a
    ///  data unit.
    pub async fn submit(&self, reliability: Reliability, order_channel: u8, payload: &[u8]) -> anyhow::Result<()> {
        if order_channel >= ORDERING_CHANNELS {
            bail!("ordering channel {} out of range", order_channel);
        }
        if payload.len() > u16::MAX as usize {
            bail!("message of {} bytes does not fit a single record - splitting is the fragmentation layer's job", payload.len());
        }

        let mut inner = self.inner.write().await;
        if !inner.active {
            bail!("connection is closed");
        }

        let ordering = match reliability {
            Reliability::ReliableOrdered => {
                let order_index = inner.next_order_index[order_channel as usize];
                inner.next_order_index[order_channel as usize] = order_index.add(1);
                Some(MessageOrdering { channel: order_channel, order_index })
            }
            _ => None,
        };
        trace!("queueing message of {} bytes ({:?})", payload.len(), reliability);
        inner.send_queue.push_back(Message {
            reliability,
            ordering,
            payload: Bytes::copy_from_slice(payload),
        });
        inner.metrics.msg_queued += 1;

        if !inner.flush_scheduled && inner.snd_window.length() < self.config.send_window_size {
            inner.flush_scheduled = true;
            let delay = (inner.rtt.smoothed_rtt() / 10).max(self.config.min_flush_delay);
            let inner_arc = self.inner.clone();

            inner.flush_handle = Some(tokio::spawn(async move {
                time::sleep(delay).await;

                let mut inner = inner_arc.write().await;
                if !inner.active {
                    // the connection went away while we were waiting
                    return;
                }
                if let Err(error) = inner.flush_queue(Instant::now()).await {
                    inner.fail_connection(error).await;
                }
            }));
        }
        Ok(())
    }

    /// Entry point for every datagram the reactor delivers for this
    ///  connection.
    pub async fn on_datagram(&self, datagram_buf: &[u8]) {
        let mut buf = datagram_buf;
        let datagram = match Datagram::deser(&mut buf) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => {
                debug!("datagram of unknown kind - dropping");
                return;
            }
            Err(e) => {
                self.inner.write().await
                    .fail_connection(TransportError::MalformedWireData(e)).await;
                return;
            }
        };
        if buf.has_remaining() {
            self.inner.write().await
                .fail_connection(TransportError::MalformedWireData(anyhow!("{} trailing bytes after datagram", buf.remaining()))).await;
            return;
        }

        let mut inner = self.inner.write().await;
        if !inner.active {
            return;
        }
        let now = Instant::now();
        let result = match datagram {
            Datagram::Data(unit) => inner.on_data_unit(unit, now).await,
            Datagram::Ack(ranges) => inner.on_ack(ranges, now).await,
            Datagram::Nack(ranges) => inner.on_nack(ranges, now).await,
        };
        if let Err(error) = result {
            inner.fail_connection(error).await;
        }
    }

    /// Application-initiated teardown: cancels the timers, clears all queued
    ///  and in-flight state. No notification is sent.
    pub async fn close(&self) {
        if let Some(handle) = &self.rto_loop_handle {
            handle.abort();
        }
        let mut inner = self.inner.write().await;
        if inner.active {
            debug!("closing connection");
            inner.teardown();
        }
    }

    pub async fn metrics(&self) -> ReliabilityMetrics {
        self.inner.read().await.metrics.snapshot()
    }
}
