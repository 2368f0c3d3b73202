//! # Stream Primitive
//!
//! `Flux<T>` yields zero or more values followed by exactly one terminal signal,
//! under credit-based flow control.
//!
//! ## Philosophy
//!
//! - **Credit is a Semaphore**: `request(n)` adds permits and every value a
//!   producer pushes consumes one, so a Flux never carries more values than the
//!   cumulative credit. Sources without a producer (`from_iter`, `from_stream`)
//!   take a permit before each value instead.
//! - **Cooperative Producers**: `FluxSink::next` waits for a permit.
//!   `FluxSink::try_next` is the non-waiting variant used for frames arriving from
//!   the remote side, where overrunning credit is a protocol violation.
//! - **One Terminal**: `complete` / `error` succeed once. Queued values are still
//!   delivered before the terminal; anything after it is refused.
//! - **Cancel Wins**: after `cancel` the consumer sees the end of the stream and
//!   queued values are dropped with it. Producers observe cancellation through
//!   `is_cancelled`, `cancelled().await` and failing `next` calls.
//!
//! ## Wire Credit
//! Outstanding credit saturates at `MAX_CREDIT` so that any grant can be forwarded
//! as one RequestN frame.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::task::AtomicWaker;
use tokio::sync::AcquireError;
use tokio::sync::Notify;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::SemaphorePermit;
use tokio::sync::TryAcquireError;
use tokio::sync::mpsc;
use tokio::sync::watch;

use rxrpc::Error;
use rxrpc::Result;

/// Upper bound on outstanding credit, the largest count one RequestN frame carries.
pub const MAX_CREDIT: u64 = u32::MAX as u64;

enum Signal<T> {
    Next(T),
    Complete,
    Failed(Error),
}

/// Demand and cancellation state shared by a Flux, its sinks, its `Demand`
/// handles and any Flux mapped from it.
struct Control {
    /// Credit not yet claimed by a value. Closed on cancel.
    credit: Arc<Semaphore>,
    /// Credit granted and not yet used by a delivered value.
    outstanding: AtomicU64,
    /// Credit requested by the consumer that no producer has picked up via `demand`.
    demand: AtomicU64,
    /// New demand, a terminal or a cancel.
    changed: Notify,
    cancel: watch::Sender<bool>,
    /// The consumer has seen the end of the stream.
    drained: AtomicBool,
    consumer: AtomicWaker,
}

impl Control {
    fn new() -> Self {
        Self {
            credit: Arc::new(Semaphore::new(0)),
            outstanding: AtomicU64::new(0),
            demand: AtomicU64::new(0),
            changed: Notify::new(),
            cancel: watch::Sender::new(false),
            drained: AtomicBool::new(false),
            consumer: AtomicWaker::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn is_closed(&self) -> bool {
        self.is_cancelled() || self.drained.load(Ordering::Acquire)
    }

    /// Adds up to `n` permits without exceeding `MAX_CREDIT` outstanding.
    fn add_credit(&self, n: u64) -> u64 {
        let ceiling = MAX_CREDIT.min(Semaphore::MAX_PERMITS as u64);
        let mut added = 0;
        let _ = self.outstanding.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            added = n.min(ceiling.saturating_sub(current));
            (added > 0).then(|| current + added)
        });
        if added > 0 {
            self.credit.add_permits(added as usize);
        }
        added
    }

    fn request(&self, n: u64) {
        if n == 0 || self.is_closed() {
            return;
        }
        let added = self.add_credit(n);
        if added > 0 {
            self.demand.fetch_add(added, Ordering::AcqRel);
            self.changed.notify_waiters();
        }
    }

    fn grant(&self, n: u64) {
        if !self.is_closed() {
            self.add_credit(n);
        }
    }

    fn cancel(&self) {
        if self.drained.load(Ordering::Acquire) || self.cancel.send_replace(true) {
            return;
        }
        self.credit.close();
        self.changed.notify_waiters();
        self.consumer.wake();
    }

    fn delivered(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1));
    }
}

/// Holds one permit for a source that has no producer to claim it.
#[derive(Default)]
struct Gate {
    acquire: Option<BoxFuture<'static, std::result::Result<OwnedSemaphorePermit, AcquireError>>>,
    held: bool,
}

impl Gate {
    /// `false` once the semaphore is closed.
    fn poll_permit(&mut self, credit: &Arc<Semaphore>, cx: &mut Context<'_>) -> Poll<bool> {
        if self.held {
            return Poll::Ready(true);
        }
        let acquire = self
            .acquire
            .get_or_insert_with(|| credit.clone().acquire_owned().boxed());
        let acquired = ready!(acquire.poll_unpin(cx));
        self.acquire = None;
        match acquired {
            Ok(permit) => {
                permit.forget();
                self.held = true;
                Poll::Ready(true)
            }
            Err(_) => Poll::Ready(false),
        }
    }
}

enum Source<T> {
    /// Fed by `FluxSink`s; values arrive already paid for.
    Queue(mpsc::UnboundedReceiver<Signal<T>>),
    Items {
        items: VecDeque<T>,
        end: Option<Error>,
        gate: Gate,
    },
    Stream {
        stream: BoxStream<'static, Result<T>>,
        gate: Gate,
    },
    /// An adapter over another Flux that shares its control block.
    Mapped(BoxStream<'static, Result<T>>),
}

fn poll_queue<T>(
    control: &Control,
    rx: &mut mpsc::UnboundedReceiver<Signal<T>>,
    cx: &mut Context<'_>,
) -> Poll<Option<Result<T>>> {
    match ready!(rx.poll_recv(cx)) {
        Some(Signal::Next(value)) => {
            control.delivered();
            Poll::Ready(Some(Ok(value)))
        }
        Some(Signal::Complete) => Poll::Ready(None),
        Some(Signal::Failed(error)) => Poll::Ready(Some(Err(error))),
        // Every sink was dropped without a terminal.
        None => Poll::Ready(Some(Err(Error::cancelled()))),
    }
}

/// A credit-gated stream of values ending in one terminal signal.
///
/// Implements `Stream<Item = Result<T>>`: values, then a single `Err` item if the
/// stream failed, then the end. Single use.
pub struct Flux<T> {
    control: Arc<Control>,
    source: Source<T>,
    finished: bool,
}

// Values are only ever moved out of the source, never pinned in place.
impl<T> Unpin for Flux<T> {}

impl<T: Send + 'static> Flux<T> {
    /// Creates an empty Flux and the sink that feeds it.
    pub fn channel() -> (FluxSink<T>, Flux<T>) {
        let control = Arc::new(Control::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = FluxSink {
            control: control.clone(),
            outlet: Arc::new(Mutex::new(Some(tx))),
        };
        (sink, Self::with_source(control, Source::Queue(rx)))
    }

    fn with_source(control: Arc<Control>, source: Source<T>) -> Self {
        Self { control, source, finished: false }
    }

    fn settled(items: VecDeque<T>, end: Option<Error>) -> Self {
        let source = Source::Items { items, end, gate: Gate::default() };
        Self::with_source(Arc::new(Control::new()), source)
    }

    /// A Flux that yields `items` as credit allows, then completes.
    pub fn from_iter<I: IntoIterator<Item = T>>(items: I) -> Self {
        Self::settled(items.into_iter().collect(), None)
    }

    pub fn empty() -> Self {
        Self::settled(VecDeque::new(), None)
    }

    pub fn error(error: Error) -> Self {
        Self::settled(VecDeque::new(), Some(error))
    }

    /// The default outcome of a streaming handler stub that was never filled in.
    pub fn unimplemented() -> Self {
        Self::error(Error::unimplemented())
    }

    /// Wraps an arbitrary stream. Items are pulled only while credit is available;
    /// the first `Err` item terminates the Flux.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        let source = Source::Stream { stream: stream.boxed(), gate: Gate::default() };
        Self::with_source(Arc::new(Control::new()), source)
    }

    /// A handle that grants credit or cancels from elsewhere, e.g. from frames
    /// arriving for the exchange this Flux feeds.
    pub fn demand_handle(&self) -> Demand {
        Demand { control: self.control.clone() }
    }

    /// Transforms each value; an `Err` from `f` terminates the result and
    /// cancels this Flux. Credit and cancellation on the result act on this
    /// Flux directly.
    pub fn and_then<U, F>(self, mut f: F) -> Flux<U>
    where
        F: FnMut(T) -> Result<U> + Send + 'static,
        U: Send + 'static,
    {
        let control = self.control.clone();
        let stream = StreamExt::map(self, move |item| item.and_then(&mut f));
        Flux::with_source(control, Source::Mapped(stream.boxed()))
    }

    pub fn map<U, F>(self, mut f: F) -> Flux<U>
    where
        F: FnMut(T) -> U + Send + 'static,
        U: Send + 'static,
    {
        self.and_then(move |value| Ok(f(value)))
    }

    /// Grants maximum credit and gathers every value. Fails with the stream's error.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        self.request(MAX_CREDIT);
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl<T> Flux<T> {
    /// Grants `n` more values of credit.
    pub fn request(&self, n: u64) {
        self.control.request(n);
    }

    /// Stops the stream. Idempotent; a no-op once the end was observed.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    fn poll_source(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        let control = &self.control;
        match &mut self.source {
            Source::Queue(rx) => poll_queue(control, rx, cx),
            Source::Items { items, end, gate } => {
                if items.is_empty() {
                    return Poll::Ready(end.take().map(Err));
                }
                if !ready!(gate.poll_permit(&control.credit, cx)) {
                    return Poll::Ready(None);
                }
                gate.held = false;
                control.delivered();
                Poll::Ready(items.pop_front().map(Ok))
            }
            Source::Stream { stream, gate } => {
                if !ready!(gate.poll_permit(&control.credit, cx)) {
                    return Poll::Ready(None);
                }
                let item = ready!(stream.poll_next_unpin(cx));
                if let Some(Ok(_)) = item {
                    gate.held = false;
                    control.delivered();
                }
                Poll::Ready(item)
            }
            Source::Mapped(stream) => stream.poll_next_unpin(cx),
        }
    }
}

impl<T> Stream for Flux<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if this.control.is_cancelled() {
            this.finished = true;
            return Poll::Ready(None);
        }
        this.control.consumer.register(cx.waker());

        match ready!(this.poll_source(cx)) {
            Some(Ok(value)) => Poll::Ready(Some(Ok(value))),
            end => {
                if let (Source::Mapped(_), Some(Err(_))) = (&this.source, &end) {
                    // The adapter failed; its source still has to stop.
                    this.control.cancel();
                }
                this.finished = true;
                this.control.drained.store(true, Ordering::Release);
                Poll::Ready(end)
            }
        }
    }
}

impl<T> Drop for Flux<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.control.cancel();
        }
    }
}

impl<T> std::fmt::Debug for Flux<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flux")
            .field("credit", &self.control.credit.available_permits())
            .field("cancelled", &self.control.is_cancelled())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Take-once slot for the queue sender. Empty once a terminal was sent.
type Outlet<T> = Mutex<Option<mpsc::UnboundedSender<Signal<T>>>>;

/// Producer half of a `Flux`. Cloneable; the consumer is cancelled once every
/// clone is dropped without a terminal.
pub struct FluxSink<T> {
    control: Arc<Control>,
    outlet: Arc<Outlet<T>>,
}

impl<T> FluxSink<T> {
    fn outlet(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Signal<T>>>> {
        self.outlet.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<()> {
        if self.control.is_cancelled() {
            return Err(Error::cancelled());
        }
        if self.outlet().is_none() {
            return Err(after_terminal());
        }
        Ok(())
    }

    /// Queues one value against a permit. The permit goes back to the
    /// semaphore if the value is refused.
    fn push(&self, permit: SemaphorePermit<'_>, value: T) -> Result<()> {
        let outlet = self.outlet();
        let Some(tx) = outlet.as_ref() else {
            return Err(after_terminal());
        };
        if self.control.is_cancelled() {
            return Err(Error::cancelled());
        }
        permit.forget();
        tx.send(Signal::Next(value)).map_err(|_| Error::cancelled())
    }

    /// Emits one value, waiting for credit.
    pub async fn next(&self, value: T) -> Result<()> {
        self.check_open()?;
        let permit = self.control.credit.acquire().await.map_err(|_| Error::cancelled())?;
        self.push(permit, value)
    }

    /// Emits one value without waiting. Fails with `ProtocolViolation` when the
    /// consumer has not granted credit for it.
    pub fn try_next(&self, value: T) -> Result<()> {
        self.check_open()?;
        match self.control.credit.try_acquire() {
            Ok(permit) => self.push(permit, value),
            Err(TryAcquireError::Closed) => Err(Error::cancelled()),
            Err(TryAcquireError::NoPermits) => Err(Error::protocol_violation("stream credit exhausted")),
        }
    }

    pub fn complete(&self) -> Result<()> {
        self.terminate(Signal::Complete)
    }

    pub fn error(&self, error: Error) -> Result<()> {
        self.terminate(Signal::Failed(error))
    }

    fn terminate(&self, signal: Signal<T>) -> Result<()> {
        if self.control.is_cancelled() {
            return Err(Error::cancelled());
        }
        let tx = self.outlet().take().ok_or_else(after_terminal)?;
        // A dropped consumer already cancelled.
        let _ = tx.send(signal);
        self.control.changed.notify_waiters();
        Ok(())
    }

    /// Seeds credit the consumer is assumed to have granted, without recording
    /// it as new demand.
    pub fn grant(&self, n: u64) {
        self.control.grant(n);
    }

    /// Waits for credit the consumer requested since the last call.
    /// Returns `None` once the stream is terminated or cancelled.
    pub async fn demand(&self) -> Option<u64> {
        loop {
            let changed = self.control.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.control.is_cancelled() || self.outlet().is_none() {
                return None;
            }
            let n = self.control.demand.swap(0, Ordering::AcqRel);
            if n > 0 {
                return Some(n);
            }
            changed.await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Completes once the consumer has cancelled. Never completes otherwise.
    pub async fn cancelled(&self) {
        let mut cancel = self.control.cancel.subscribe();
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    /// Credit not yet claimed by a queued value.
    pub fn credit(&self) -> u64 {
        self.control.credit.available_permits() as u64
    }
}

fn after_terminal() -> Error {
    Error::protocol_violation("stream already terminated")
}

impl<T> Clone for FluxSink<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            outlet: self.outlet.clone(),
        }
    }
}

/// Grants credit to, or cancels, a Flux owned by someone else.
#[derive(Clone)]
pub struct Demand {
    control: Arc<Control>,
}

impl Demand {
    pub fn request(&self, n: u64) {
        self.control.request(n);
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }
}

impl std::fmt::Debug for Demand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Demand")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use rxrpc::ErrorKind;

    #[test]
    fn values_wait_for_credit() {
        let mut flux = Flux::from_iter(vec![1, 2, 3]);
        assert!(flux.next().now_or_never().is_none());

        flux.request(2);
        assert_eq!(flux.next().now_or_never().unwrap().unwrap().unwrap(), 1);
        assert_eq!(flux.next().now_or_never().unwrap().unwrap().unwrap(), 2);
        assert!(flux.next().now_or_never().is_none());

        flux.request(5);
        assert_eq!(flux.next().now_or_never().unwrap().unwrap().unwrap(), 3);
        assert!(flux.next().now_or_never().unwrap().is_none());
    }

    #[test]
    fn terminal_needs_no_credit() {
        let mut flux = Flux::<u8>::error(Error::application("nope"));
        let item = flux.next().now_or_never().unwrap().unwrap();
        assert!(item.unwrap_err().is(ErrorKind::Application));
        assert!(flux.next().now_or_never().unwrap().is_none());
    }

    #[test]
    fn try_next_enforces_credit() {
        let (sink, flux) = Flux::channel();
        let err = sink.try_next(1).unwrap_err();
        assert!(err.is(ErrorKind::ProtocolViolation));

        sink.grant(1);
        sink.try_next(1).unwrap();
        assert!(sink.try_next(2).is_err());
        assert_eq!(sink.credit(), 0);

        flux.request(1);
        assert_eq!(sink.credit(), 1);
        sink.try_next(2).unwrap();
    }

    #[test]
    fn grant_is_not_demand() {
        let (sink, flux) = Flux::<u8>::channel();
        sink.grant(3);
        assert!(sink.demand().now_or_never().is_none());

        flux.request(2);
        assert_eq!(sink.demand().now_or_never().unwrap(), Some(2));
        assert!(sink.demand().now_or_never().is_none());
    }

    #[test]
    fn second_terminal_is_refused() {
        let (sink, _flux) = Flux::<u8>::channel();
        sink.complete().unwrap();
        assert!(sink.complete().unwrap_err().is(ErrorKind::ProtocolViolation));
        assert!(sink.error(Error::application("x")).is_err());
        assert!(sink.try_next(1).is_err());
        assert_eq!(sink.demand().now_or_never().unwrap(), None);
    }

    #[test]
    fn queued_values_precede_terminal() {
        let (sink, mut flux) = Flux::channel();
        sink.grant(2);
        sink.try_next("a").unwrap();
        sink.try_next("b").unwrap();
        sink.error(Error::application("late")).unwrap();

        assert_eq!(flux.next().now_or_never().unwrap().unwrap().unwrap(), "a");
        assert_eq!(flux.next().now_or_never().unwrap().unwrap().unwrap(), "b");
        assert!(flux.next().now_or_never().unwrap().unwrap().is_err());
        assert!(flux.next().now_or_never().unwrap().is_none());
    }

    #[test]
    fn cancel_discards_queue_and_reaches_producer() {
        let (sink, mut flux) = Flux::channel();
        sink.grant(2);
        sink.try_next(1).unwrap();

        flux.demand_handle().cancel();
        flux.cancel();

        assert!(sink.is_cancelled());
        assert!(sink.cancelled().now_or_never().is_some());
        assert!(sink.try_next(2).unwrap_err().is(ErrorKind::Cancelled));
        assert!(flux.next().now_or_never().unwrap().is_none());
    }

    #[test]
    fn dropping_consumer_cancels() {
        let (sink, flux) = Flux::<u8>::channel();
        drop(flux);
        assert!(sink.is_cancelled());
    }

    #[test]
    fn abandoned_sinks_cancel_consumer() {
        let (sink, mut flux) = Flux::<u8>::channel();
        drop(sink.clone());
        assert!(flux.next().now_or_never().is_none());
        drop(sink);
        let item = flux.next().now_or_never().unwrap().unwrap();
        assert!(item.unwrap_err().is(ErrorKind::Cancelled));
    }

    #[test]
    fn credit_saturates() {
        let (sink, flux) = Flux::<u8>::channel();
        flux.request(u64::MAX);
        flux.request(10);
        assert_eq!(sink.credit(), MAX_CREDIT);
        assert_eq!(sink.demand().now_or_never().unwrap(), Some(MAX_CREDIT));
    }

    #[tokio::test]
    async fn producer_suspends_until_requested() {
        let (sink, mut flux) = Flux::channel();
        let producer = tokio::spawn(async move {
            for i in 0..3u32 {
                sink.next(i).await?;
            }
            sink.complete()
        });

        tokio::task::yield_now().await;
        assert!(flux.next().now_or_never().is_none());

        flux.request(1);
        assert_eq!(flux.next().await.unwrap().unwrap(), 0);
        flux.request(2);
        assert_eq!(flux.next().await.unwrap().unwrap(), 1);
        assert_eq!(flux.next().await.unwrap().unwrap(), 2);
        assert!(flux.next().await.is_none());
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cloned_producers_share_credit() {
        let (sink, mut flux) = Flux::channel();
        let producers: Vec<_> = (0..4u32)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.next(i).await })
            })
            .collect();

        flux.request(3);
        for _ in 0..3 {
            assert!(flux.next().await.unwrap().is_ok());
        }
        tokio::task::yield_now().await;
        assert!(flux.next().now_or_never().is_none());
        assert_eq!(sink.credit(), 0);

        flux.cancel();
        let mut delivered = 0;
        for producer in producers {
            match producer.await.unwrap() {
                Ok(()) => delivered += 1,
                Err(e) => assert!(e.is(ErrorKind::Cancelled)),
            }
        }
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn map_propagates_demand_and_cancel() {
        let (sink, flux) = Flux::<u32>::channel();
        let mut doubled = flux.map(|v| v * 2);

        doubled.request(2);
        assert_eq!(sink.demand().await, Some(2));

        sink.next(5).await.unwrap();
        assert_eq!(doubled.next().await.unwrap().unwrap(), 10);

        doubled.cancel();
        assert!(sink.is_cancelled());
    }

    #[tokio::test]
    async fn and_then_error_terminates_and_cancels_source() {
        let (sink, flux) = Flux::<u32>::channel();
        let mut checked = flux.and_then(|v| match v {
            0 => Err(Error::application("zero")),
            v => Ok(v),
        });
        checked.request(3);
        sink.next(1).await.unwrap();
        sink.next(0).await.unwrap();

        assert_eq!(checked.next().await.unwrap().unwrap(), 1);
        assert!(checked.next().await.unwrap().is_err());
        assert!(checked.next().await.is_none());
        assert!(sink.is_cancelled());
    }

    #[tokio::test]
    async fn from_stream_is_gated() {
        let mut flux = Flux::from_stream(futures::stream::iter(vec![Ok(1u8), Ok(2)]));
        assert!(flux.next().now_or_never().is_none());
        assert_eq!(flux.collect_all().await.unwrap(), vec![1, 2]);
    }
}
