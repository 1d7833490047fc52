//! Non-blocking handoff between a background worker and the audio thread.
//!
//! A worker computes results off the real-time thread and pushes them into a
//! bounded SPSC ring. The audio side drains the ring without blocking and
//! keeps the newest value it has seen; when nothing new arrived it keeps
//! using the last one.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::{Consumer, Producer, PushError, RingBuffer};

/// Shared flag telling a worker whether its module still exists.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn retire(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The value is in the ring.
    Delivered,
    /// The ring was full; the value is parked and retried on the next
    /// publish or flush, replacing anything parked earlier.
    Parked,
    /// The receiving module is gone; the value was dropped.
    Abandoned,
}

/// Worker side of a handoff.
pub struct ResultPublisher<T> {
    producer: Producer<T>,
    parked: Option<T>,
    liveness: Liveness,
    superseded: u64,
}

/// Audio side of a handoff.
pub struct ResultReceiver<T> {
    consumer: Consumer<T>,
    latest: Option<T>,
    liveness: Liveness,
}

/// Creates a handoff ring holding at most `capacity` undelivered results.
pub fn handoff<T: Send>(capacity: usize) -> (ResultPublisher<T>, ResultReceiver<T>) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let liveness = Liveness::new();
    (
        ResultPublisher {
            producer,
            parked: None,
            liveness: liveness.clone(),
            superseded: 0,
        },
        ResultReceiver {
            consumer,
            latest: None,
            liveness,
        },
    )
}

impl<T> ResultPublisher<T> {
    pub fn is_abandoned(&self) -> bool {
        !self.liveness.is_alive()
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Results replaced while parked, never seen by the audio side.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    pub fn publish(&mut self, value: T) -> Publish {
        if self.is_abandoned() {
            self.parked = None;
            return Publish::Abandoned;
        }
        if self.parked.replace(value).is_some() {
            self.superseded = self.superseded.wrapping_add(1);
        }
        self.flush()
    }

    /// Retries a parked value.
    pub fn flush(&mut self) -> Publish {
        if self.is_abandoned() {
            self.parked = None;
            return Publish::Abandoned;
        }
        let Some(value) = self.parked.take() else {
            return Publish::Delivered;
        };
        match self.producer.push(value) {
            Ok(()) => Publish::Delivered,
            Err(PushError::Full(value)) => {
                self.parked = Some(value);
                Publish::Parked
            }
        }
    }
}

impl<T> ResultReceiver<T> {
    /// Drains everything the worker delivered and keeps the newest. Returns
    /// `true` when a new value was adopted. Never blocks.
    pub fn poll(&mut self) -> bool {
        let mut adopted = false;
        while let Ok(value) = self.consumer.pop() {
            self.latest = Some(value);
            adopted = true;
        }
        adopted
    }

    pub fn latest(&self) -> Option<&T> {
        self.latest.as_ref()
    }

    /// Drops everything delivered so far, including the retained value.
    pub fn discard(&mut self) {
        while self.consumer.pop().is_ok() {}
        self.latest = None;
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }
}

impl<T> Drop for ResultReceiver<T> {
    fn drop(&mut self) {
        self.liveness.retire();
    }
}

/// Opaque source id a worker should follow, written by the audio thread.
/// Zero means unset.
#[derive(Debug, Clone, Default)]
pub struct SourceSelector(Arc<AtomicU64>);

impl SourceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, source: u64) {
        self.0.store(source, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// External producer of results a worker can follow, e.g. a video decoder.
pub trait LatestSource<T>: Send + Sync {
    /// Newest result for `source`, or `None` when nothing is ready. Must not
    /// block and must accept an unset id.
    fn latest(&self, source: u64) -> Option<T>;

    /// Ids of every source of the expected kind currently known.
    fn known_sources(&self) -> Vec<u64> {
        Vec::new()
    }
}

/// Fetches the newest result for `source`. An unset id falls back to the
/// first known source that has something ready.
pub fn fetch_latest<T>(provider: &dyn LatestSource<T>, source: u64) -> Option<(u64, T)> {
    if source != 0 {
        return provider.latest(source).map(|value| (source, value));
    }
    provider
        .known_sources()
        .into_iter()
        .filter(|id| *id != 0)
        .find_map(|id| provider.latest(id).map(|value| (id, value)))
}

/// What the worker loop does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFlow {
    Continue,
    Finished,
}

/// Dedicated thread running a poll/sleep loop. Step errors and panics are
/// logged and treated as "no result this cycle". Dropping the worker stops
/// and joins the thread.
pub struct BackgroundWorker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut step: F) -> anyhow::Result<Self>
    where
        F: FnMut() -> anyhow::Result<WorkerFlow> + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match panic::catch_unwind(AssertUnwindSafe(&mut step)) {
                        Ok(Ok(WorkerFlow::Continue)) => {}
                        Ok(Ok(WorkerFlow::Finished)) => break,
                        Ok(Err(err)) => {
                            tracing::warn!(worker = %thread_name, ?err, "background step failed");
                        }
                        Err(_) => {
                            tracing::error!(worker = %thread_name, "background step panicked");
                        }
                    }
                    thread::sleep(interval);
                }
                tracing::debug!(worker = %thread_name, "background worker exiting");
            })?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "background worker thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn receiver_keeps_last_value_when_ring_is_empty() {
        let (mut publisher, mut receiver) = handoff::<u32>(4);
        assert!(!receiver.poll());
        assert_eq!(receiver.latest(), None);

        publisher.publish(1);
        publisher.publish(2);
        assert!(receiver.poll());
        assert_eq!(receiver.latest(), Some(&2));
        assert!(!receiver.poll());
        assert_eq!(receiver.latest(), Some(&2));
    }

    #[test]
    fn full_ring_parks_newest_value() {
        let (mut publisher, mut receiver) = handoff::<u32>(1);
        assert_eq!(publisher.publish(1), Publish::Delivered);
        assert_eq!(publisher.publish(2), Publish::Parked);
        assert_eq!(publisher.publish(3), Publish::Parked);
        assert_eq!(publisher.superseded(), 1);

        receiver.poll();
        assert_eq!(receiver.latest(), Some(&1));
        assert_eq!(publisher.flush(), Publish::Delivered);
        receiver.poll();
        assert_eq!(receiver.latest(), Some(&3));
    }

    #[test]
    fn discard_forgets_queued_and_retained_values() {
        let (mut publisher, mut receiver) = handoff::<u32>(2);
        publisher.publish(1);
        receiver.poll();
        publisher.publish(2);
        receiver.discard();
        assert_eq!(receiver.latest(), None);
        assert!(!receiver.poll());
    }

    #[test]
    fn dropped_receiver_abandons_publisher() {
        let (mut publisher, receiver) = handoff::<u32>(1);
        drop(receiver);
        assert!(publisher.is_abandoned());
        assert_eq!(publisher.publish(7), Publish::Abandoned);
    }

    struct Frames;

    impl LatestSource<u32> for Frames {
        fn latest(&self, source: u64) -> Option<u32> {
            (source == 42).then_some(99)
        }

        fn known_sources(&self) -> Vec<u64> {
            vec![0, 7, 42]
        }
    }

    #[test]
    fn unset_source_scans_known_sources() {
        assert_eq!(fetch_latest(&Frames, 0), Some((42, 99)));
        assert_eq!(fetch_latest(&Frames, 7), None);
        assert_eq!(fetch_latest(&Frames, 42), Some((42, 99)));
    }

    #[test]
    fn worker_survives_failing_steps() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&steps);
        let mut worker = BackgroundWorker::spawn("flaky", Duration::from_millis(1), move || {
            let step = counter.fetch_add(1, Ordering::SeqCst);
            match step {
                0 => anyhow::bail!("transient"),
                1 => panic!("boom"),
                _ if step >= 5 => Ok(WorkerFlow::Finished),
                _ => Ok(WorkerFlow::Continue),
            }
        })
        .expect("spawn worker");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        assert!(steps.load(Ordering::SeqCst) >= 6);
    }
}
