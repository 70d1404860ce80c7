//! Parking under contention: wakes are never lost and lazy semaphore
//! creation publishes exactly one semaphore.

use raya_os::futex;
use raya_os::{ParkHandle, ParkResult, SemaParker, WordParker};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ROUNDS: usize = 2_000;

#[test]
fn test_every_wake_releases_one_sleep() {
    let park = Arc::new(ParkHandle::Semaphore(SemaParker::new()));
    let woken = Arc::new(AtomicUsize::new(0));

    let sleeper = {
        let park = park.clone();
        let woken = woken.clone();
        std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                assert_eq!(park.sleep(-1), ParkResult::Woken);
                woken.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    for _ in 0..ROUNDS {
        park.wake();
    }
    sleeper.join().unwrap();
    assert_eq!(woken.load(Ordering::Relaxed), ROUNDS);

    // Every post was consumed: a bounded sleep now times out
    assert_eq!(park.sleep(5_000_000), ParkResult::TimedOut);
}

#[test]
fn test_concurrent_create_shares_one_semaphore() {
    let parker = SemaParker::new();
    let (tx, rx) = crossbeam::channel::unbounded();

    crossbeam::scope(|s| {
        for _ in 0..8 {
            let tx = tx.clone();
            let parker = &parker;
            s.spawn(move |_| {
                tx.send(parker.create() as usize).unwrap();
            });
        }
    })
    .unwrap();
    drop(tx);

    let handles: Vec<usize> = rx.iter().collect();
    assert_eq!(handles.len(), 8);
    assert!(handles.iter().all(|&h| h == handles[0] && h != 0));
}

#[test]
fn test_word_parker_wake_before_sleep() {
    let park = ParkHandle::Word(WordParker::new());
    park.wake();
    let start = Instant::now();
    assert_eq!(park.sleep(1_000_000_000), ParkResult::Woken);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_futex_handoff_between_threads() {
    let word = Arc::new(AtomicU32::new(0));
    let (tx, rx) = crossbeam::channel::bounded(1);

    let waiter = {
        let word = word.clone();
        std::thread::spawn(move || {
            tx.send(()).unwrap();
            while word.load(Ordering::Acquire) == 0 {
                futex::wait(&word, 0, 50_000_000);
            }
        })
    };

    rx.recv().unwrap();
    word.store(1, Ordering::Release);
    futex::wake_all(&word);
    waiter.join().unwrap();
}

#[test]
fn test_futex_counter_with_many_waiters() {
    const WAITERS: usize = 4;
    const PRODUCERS: u32 = 2;
    const PER_PRODUCER: u32 = 1_000;
    const TOTAL: u32 = PRODUCERS * PER_PRODUCER;

    let word = Arc::new(AtomicU32::new(0));
    let (done_tx, done_rx) = crossbeam::channel::unbounded();

    for _ in 0..WAITERS {
        let word = word.clone();
        let done_tx = done_tx.clone();
        std::thread::spawn(move || {
            loop {
                let cur = word.load(Ordering::Acquire);
                if cur >= TOTAL {
                    break;
                }
                // No timeout: a lost wake leaves this waiter stuck
                futex::wait(&word, cur, -1);
            }
            done_tx.send(word.load(Ordering::Acquire)).unwrap();
        });
    }

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let word = word.clone();
            std::thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    word.fetch_add(1, Ordering::Release);
                    futex::wake(&word, 1);
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    futex::wake_all(&word);

    for _ in 0..WAITERS {
        let seen = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(seen, TOTAL);
    }
}

#[test]
fn test_word_parker_ping_pong() {
    let ping = Arc::new(ParkHandle::Word(WordParker::new()));
    let pong = Arc::new(ParkHandle::Word(WordParker::new()));
    let rounds = Arc::new(AtomicUsize::new(0));

    let ponger = {
        let ping = ping.clone();
        let pong = pong.clone();
        let rounds = rounds.clone();
        std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                assert_eq!(ping.sleep(5_000_000_000), ParkResult::Woken);
                rounds.fetch_add(1, Ordering::Relaxed);
                pong.wake();
            }
        })
    };

    for _ in 0..ROUNDS {
        ping.wake();
        assert_eq!(pong.sleep(5_000_000_000), ParkResult::Woken);
    }
    ponger.join().unwrap();
    assert_eq!(rounds.load(Ordering::Relaxed), ROUNDS);
}
