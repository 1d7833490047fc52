use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use patchbay_rt::{handoff, BackgroundWorker, Publish, WorkerFlow};

#[test]
fn audio_side_only_sees_newest_results() {
    let (mut publisher, mut receiver) = handoff::<u64>(1);
    let delivered = Arc::new(AtomicU64::new(0));
    let worker_delivered = Arc::clone(&delivered);

    let period = Duration::from_millis(1000 / 15);
    let mut next_due = Instant::now();
    let mut seq = 0u64;
    let mut pending_seq = None;
    let worker = BackgroundWorker::spawn("handoff-rate", Duration::from_millis(1), move || {
        if publisher.is_abandoned() {
            return Ok(WorkerFlow::Finished);
        }
        let outcome = if Instant::now() >= next_due {
            next_due += period;
            seq += 1;
            pending_seq = Some(seq);
            publisher.publish(seq)
        } else {
            publisher.flush()
        };
        if outcome == Publish::Delivered {
            if let Some(seq) = pending_seq.take() {
                worker_delivered.store(seq, Ordering::Release);
            }
        }
        Ok(WorkerFlow::Continue)
    })
    .expect("spawn worker");

    let started = Instant::now();
    let mut last_seen = 0u64;
    let mut changes = 0;
    let mut slowest_poll = Duration::ZERO;
    while started.elapsed() < Duration::from_millis(800) {
        let floor = delivered.load(Ordering::Acquire);
        let poll_started = Instant::now();
        if receiver.poll() {
            changes += 1;
        }
        slowest_poll = slowest_poll.max(poll_started.elapsed());
        let seen = receiver.latest().copied().unwrap_or(0);
        assert!(seen >= last_seen, "went backwards: {seen} < {last_seen}");
        assert!(seen >= floor, "stale result {seen}, {floor} already delivered");
        last_seen = seen;
        thread::sleep(Duration::from_millis(1));
    }
    drop(receiver);
    drop(worker);

    assert!(changes >= 5, "only {changes} results adopted");
    assert!(slowest_poll < Duration::from_millis(50));
}
