//! Demand-gated delivery of source bytes to a consumer.
//!
//! A subscription sits between one [`StreamSource`] and one [`Subscriber`].
//! It reacts to source events on the [`AssetQueue`] and hands bytes to the
//! consumer only while the consumer has outstanding [`Demand`]. Bytes that
//! arrive while demand is zero are parked in a tail buffer and delivered, in
//! order, as soon as demand is raised again. Nothing is ever dropped.
//!
//! The consumer receives at most one [`Completion`], and receives nothing at
//! all after [`Subscription::cancel`].
//!
//! Bookkeeping and the consumer sit behind two separate locks that are never
//! held together. Consumer callbacks run with only the consumer lock held, so
//! a callback may inspect its own subscription.

mod stream;

pub use stream::{ChunkStream, SinkSubscriber};

use crate::{
    AssetQueue, ByteQueue, Demand, FetchError,
    error::contract_violation,
    source::{DelegateRef, Event, StreamDelegate, StreamSource},
};
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Terminal signal of a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Failed(FetchError),
}

impl Completion {
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Self::Finished => Ok(()),
            Self::Failed(err) => Err(err),
        }
    }
}

/// A consumer of chunked bytes.
///
/// All three callbacks run on the [`AssetQueue`], one at a time. A callback
/// may call any [`Subscription`] method, including on its own subscription.
pub trait Subscriber: Send + 'static {
    /// Called once, before any other callback. Keep the handle to request
    /// demand or cancel.
    fn on_subscribe(&mut self, subscription: Subscription);

    /// Receives the next chunk. The returned demand is added to what is
    /// still outstanding.
    fn on_next(&mut self, chunk: Bytes) -> Demand;

    fn on_complete(&mut self, completion: Completion);
}

/// Byte counters of one subscription.
///
/// `delivered + parked == read` holds whenever no callback is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Bytes read from the source.
    pub read: u64,
    /// Bytes handed to the consumer.
    pub delivered: u64,
    /// Bytes currently parked waiting for demand.
    pub parked: usize,
    /// Demand not yet satisfied.
    pub demand: Demand,
}

/// Handle to a running subscription. Cheap to clone; every clone controls
/// the same subscription.
///
/// A subscription runs until it completes, is cancelled or its environment
/// shuts down, whether or not any handle is still held.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.shared.label)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Live subscriptions of one environment.
#[derive(Default)]
pub(crate) struct Subscriptions {
    live: Mutex<Vec<Weak<Shared>>>,
}

impl Subscriptions {
    fn track(&self, shared: &Arc<Shared>) {
        let mut live = self.live.lock();
        live.retain(|entry| entry.strong_count() > 0);
        live.push(Arc::downgrade(shared));
    }

    /// Fails every subscription that has not completed yet with
    /// [`FetchError::Shutdown`]. Must run on the queue.
    pub(crate) fn shutdown_all(&self) {
        let live: Vec<_> = self
            .live
            .lock()
            .drain(..)
            .filter_map(|entry| entry.upgrade())
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(count = live.len(), "Failing live subscriptions");

        for shared in live {
            shared.abort(FetchError::Shutdown);
        }
    }
}

struct Shared {
    label: String,
    queue: AssetQueue,
    chunk_size: usize,
    cancelled: AtomicBool,
    state: Mutex<State>,
    /// Held for the duration of each callback. Never locked together with
    /// `state`.
    consumer: Mutex<Option<Box<dyn Subscriber>>>,
}

struct State {
    source: Option<Box<dyn StreamSource>>,
    running_demand: Demand,
    saved_tail: ByteQueue,
    /// The source ended but parked bytes still await demand.
    pending_finish: bool,
    completed: bool,
    read: u64,
    delivered: u64,
    /// Keeps the subscription running without any outside handle. Released
    /// on completion or cancel.
    running: Option<Arc<Shared>>,
}

/// What woke the delivery loop up.
#[derive(Clone, Copy)]
enum Trigger {
    /// Demand was raised. The source is read only once the tail is empty.
    Request,
    /// The source has bytes. They are read even without demand and parked.
    Readiness,
}

/// The next thing to hand to the consumer, decided under the state lock and
/// carried out after releasing it.
enum Step {
    Deliver(Bytes),
    Complete(Completion),
    Idle,
}

impl Subscription {
    /// Wires `consumer` to the source built by `make_source` and starts the
    /// fetch on the next queue turn.
    ///
    /// `make_source` receives the non-owning delegate link the source must
    /// report to. If the queue is already stopped the consumer is subscribed
    /// and failed with [`FetchError::Shutdown`] right away.
    pub(crate) fn start<F>(
        label: String,
        queue: AssetQueue,
        tracker: &Subscriptions,
        chunk_size: usize,
        consumer: Box<dyn Subscriber>,
        make_source: F,
    ) -> Self
    where
        F: FnOnce(DelegateRef) -> Box<dyn StreamSource>,
    {
        let shared = Arc::new_cyclic(|me: &Weak<Shared>| {
            let delegate: DelegateRef = me.clone();
            Shared {
                label,
                queue,
                chunk_size: chunk_size.max(1),
                cancelled: AtomicBool::new(false),
                state: Mutex::new(State {
                    source: Some(make_source(delegate)),
                    running_demand: Demand::none(),
                    saved_tail: ByteQueue::new(),
                    pending_finish: false,
                    completed: false,
                    read: 0,
                    delivered: 0,
                    running: None,
                }),
                consumer: Mutex::new(Some(consumer)),
            }
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(label = %shared.label, "Subscription created");

        shared.state.lock().running = Some(Arc::clone(&shared));
        tracker.track(&shared);

        let subscription = Self { shared };
        let handle = subscription.clone();
        let shared = Arc::clone(&subscription.shared);
        if !subscription.shared.queue.dispatch(move || shared.begin(handle)) {
            let handle = subscription.clone();
            subscription
                .shared
                .with_consumer(move |consumer| consumer.on_subscribe(handle));
            subscription.shared.abort(FetchError::Shutdown);
        }
        subscription
    }

    /// Adds `demand` to what the consumer is willing to receive.
    ///
    /// Always handed off to the queue, so it is safe to call from inside
    /// [`Subscriber::on_next`]. A zero demand is ignored.
    pub fn request(&self, demand: impl Into<Demand>) {
        let demand = demand.into();
        if demand.is_zero() || self.is_cancelled() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared
            .queue
            .dispatch(move || shared.handle_request(demand));
    }

    /// Stops delivery and releases the source.
    ///
    /// After this returns no callback of the consumer starts. Called off the
    /// queue, it waits for a callback that is already running to return.
    /// Idempotent, and safe from any thread or from inside a consumer
    /// callback.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(label = %self.shared.label, "Subscription cancelled");

        if self.shared.queue.is_current() {
            // A consumer callback may be holding the consumer lock further up
            // this stack.
            let shared = Arc::clone(&self.shared);
            if !self.shared.queue.dispatch(move || shared.teardown(true)) {
                self.shared.teardown(false);
            }
        } else {
            self.shared.teardown(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SubscriptionStats {
        let state = self.shared.state.lock();
        SubscriptionStats {
            read: state.read,
            delivered: state.delivered,
            parked: state.saved_tail.len(),
            demand: state.running_demand,
        }
    }

    /// Whether the subscription reached its completion.
    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().completed
    }
}

impl Shared {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Runs `f` on the consumer unless the subscription was cancelled or the
    /// consumer is gone.
    fn with_consumer<R>(&self, f: impl FnOnce(&mut dyn Subscriber) -> R) -> Option<R> {
        let mut consumer = self.consumer.lock();
        if self.is_cancelled() {
            return None;
        }
        match consumer.as_mut() {
            Some(consumer) => Some(f(&mut **consumer)),
            None => None,
        }
    }

    fn begin(&self, handle: Subscription) {
        self.with_consumer(move |consumer| consumer.on_subscribe(handle));
        if self.is_cancelled() {
            return;
        }
        let state = self.state.lock();
        if state.completed {
            return;
        }
        if let Some(source) = state.source.as_ref() {
            source.open();
        }
    }

    /// Releases the source and the consumer. With `wait_for_consumer`, blocks
    /// until a running callback returns; otherwise a busy consumer is left to
    /// be dropped with the subscription.
    fn teardown(&self, wait_for_consumer: bool) {
        let (source, running) = {
            let mut state = self.state.lock();
            state.saved_tail.clear();
            state.pending_finish = false;
            (state.source.take(), state.running.take())
        };
        if let Some(source) = source {
            source.close();
        }

        let consumer = if wait_for_consumer {
            self.consumer.lock().take()
        } else {
            self.consumer.try_lock().and_then(|mut slot| slot.take())
        };
        drop(consumer);
        drop(running);
    }

    fn handle_request(&self, demand: Demand) {
        if self.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.running_demand += demand;
        }
        self.flush(Trigger::Request);
    }

    /// Delivers parked bytes, then the source's bytes, until demand or data
    /// runs out.
    fn flush(&self, trigger: Trigger) {
        let mut trigger = Some(trigger);
        loop {
            let step = {
                let mut state = self.state.lock();
                if self.is_cancelled() || state.completed {
                    return;
                }
                self.next_step(&mut state, &mut trigger)
            };

            match step {
                Step::Deliver(chunk) => self.deliver(chunk),
                Step::Complete(completion) => return self.complete(completion),
                Step::Idle => return,
            }
        }
    }

    fn next_step(&self, state: &mut State, trigger: &mut Option<Trigger>) -> Step {
        if !state.saved_tail.is_empty() && !state.running_demand.is_zero() {
            let take = state.running_demand.clamp(state.saved_tail.len());
            let chunk = state.saved_tail.take(take);
            return Self::account(state, chunk);
        }

        if state.pending_finish {
            if state.saved_tail.is_empty() && self.mark_finished(state) {
                return Step::Complete(Completion::Finished);
            }
            return Step::Idle;
        }

        match trigger.take() {
            Some(Trigger::Readiness) => self.pull(state),
            Some(Trigger::Request)
                if state.saved_tail.is_empty() && !state.running_demand.is_zero() =>
            {
                self.pull(state)
            }
            _ => Step::Idle,
        }
    }

    /// Moves whatever the source has buffered towards the consumer.
    fn pull(&self, state: &mut State) -> Step {
        let Some(source) = state.source.as_ref() else {
            return Step::Idle;
        };
        if !source.has_available() {
            return Step::Idle;
        }

        let available = source.peek().map_or(self.chunk_size, |view| view.len());
        let ask = state.running_demand.clamp(available);
        if ask > 0 && state.saved_tail.is_empty() {
            let chunk = source.read(ask);
            state.read += chunk.len() as u64;
            Self::account(state, chunk)
        } else {
            let chunk = source.read(available);
            state.read += chunk.len() as u64;
            state.saved_tail.push(chunk);
            Step::Idle
        }
    }

    /// Charges `chunk` against demand before it is handed over.
    fn account(state: &mut State, chunk: Bytes) -> Step {
        if chunk.is_empty() {
            return Step::Idle;
        }
        state.running_demand.consume(chunk.len());
        state.delivered += chunk.len() as u64;
        Step::Deliver(chunk)
    }

    /// Hands `chunk` to the consumer and folds the demand it returns back in.
    fn deliver(&self, chunk: Bytes) {
        let Some(more) = self.with_consumer(|consumer| consumer.on_next(chunk)) else {
            return;
        };
        if !more.is_zero() {
            self.state.lock().running_demand += more;
        }
    }

    /// Returns whether the subscription finished right away.
    fn handle_end(&self, state: &mut State) -> bool {
        if let Some(source) = state.source.take() {
            source.close();
        }
        if state.saved_tail.is_empty() {
            return self.mark_finished(state);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(
            label = %self.label,
            parked = state.saved_tail.len(),
            "Source ended, waiting for demand to flush"
        );
        state.pending_finish = true;
        false
    }

    /// Settles the bookkeeping of a completion. Returns `false` if the
    /// subscription had already completed.
    fn mark_finished(&self, state: &mut State) -> bool {
        if state.completed {
            contract_violation("subscription completed twice");
            return false;
        }
        state.completed = true;
        state.pending_finish = false;
        if let Some(source) = state.source.take() {
            source.close();
        }
        state.saved_tail.clear();
        state.running = None;
        true
    }

    /// Hands the completion to the consumer, which is released afterwards.
    fn complete(&self, completion: Completion) {
        #[cfg(feature = "tracing")]
        match &completion {
            Completion::Finished => tracing::debug!(
                label = %self.label,
                delivered = self.state.lock().delivered,
                "Subscription finished"
            ),
            Completion::Failed(err) => tracing::warn!(
                label = %self.label,
                error = %err,
                "Subscription failed"
            ),
        }

        let consumer = {
            let mut slot = self.consumer.lock();
            if self.is_cancelled() {
                return;
            }
            slot.take()
        };
        if let Some(mut consumer) = consumer {
            consumer.on_complete(completion);
        }
    }

    /// Fails the subscription unless it already completed or was cancelled.
    fn abort(&self, err: FetchError) {
        if self.is_cancelled() {
            return;
        }
        let finished = {
            let mut state = self.state.lock();
            !state.completed && self.mark_finished(&mut state)
        };
        if finished {
            self.complete(Completion::Failed(err));
        }
    }
}

impl StreamDelegate for Shared {
    fn handle_event(&self, event: Event) {
        if self.is_cancelled() {
            return;
        }
        self.queue.assert_current("source event delivered off the queue");

        let mut state = self.state.lock();
        if state.completed || state.pending_finish {
            contract_violation("source event after the source ended");
            return;
        }

        match event {
            Event::Opened => {
                #[cfg(feature = "tracing")]
                tracing::trace!(label = %self.label, "Source opened");
            }
            Event::BytesAvailable => {
                drop(state);
                self.flush(Trigger::Readiness);
            }
            Event::EndReached => {
                if self.handle_end(&mut state) {
                    drop(state);
                    self.complete(Completion::Finished);
                }
            }
            Event::Errored(err) => {
                if self.mark_finished(&mut state) {
                    drop(state);
                    self.complete(Completion::Failed(err));
                }
            }
        }
    }
}
