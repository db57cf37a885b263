use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{panic, thread};

/// A bounded mailbox like the per-CPU TLB update queue.
struct Mailbox {
    items: [u64; 4],
    len: usize,
    generation: u64,
}

impl Mailbox {
    const fn new() -> Self {
        Self {
            items: [0; 4],
            len: 0,
            generation: 0,
        }
    }

    fn post(&mut self, value: u64) -> u64 {
        if self.len < self.items.len() {
            self.items[self.len] = value;
            self.len += 1;
        } else {
            self.items[self.len - 1] = u64::MAX;
        }
        self.generation += 1;
        self.generation
    }

    fn take(&mut self) -> (Vec<u64>, u64) {
        let drained = self.items[..self.len].to_vec();
        self.len = 0;
        (drained, self.generation)
    }
}

#[test]
fn guard_scopes_the_critical_section() {
    let map_lock = SpinLock::new(());

    let guard = map_lock.lock();
    assert!(map_lock.is_locked());
    assert!(map_lock.try_lock().is_none());
    drop(guard);

    assert!(!map_lock.is_locked());
    assert!(map_lock.try_lock().is_some());
}

#[test]
fn guard_can_be_let_go_and_retaken() {
    let map_lock = SpinLock::new(());
    let mut held = Some(map_lock.lock());

    // Released around an allocation, then taken again.
    drop(held.take());
    assert!(map_lock.try_lock().is_some());
    held = Some(map_lock.lock());

    assert!(held.is_some() && map_lock.is_locked());
    drop(held);
    assert!(!map_lock.is_locked());
}

#[test]
fn with_lock_posts_and_drains_a_mailbox() {
    let queue = SpinLock::new(Mailbox::new());

    assert_eq!(queue.with_lock(|q| q.post(10)), 1);
    assert_eq!(queue.with_lock(|q| q.post(11)), 2);
    let (items, generation) = queue.with_lock(Mailbox::take);
    assert_eq!(items, vec![10, 11]);
    assert_eq!(generation, 2);

    for n in 0..6 {
        queue.with_lock(|q| q.post(n));
    }
    let (items, generation) = queue.with_lock(Mailbox::take);
    assert_eq!(items, vec![0, 1, 2, u64::MAX]);
    assert_eq!(generation, 8);
    assert!(!queue.is_locked());
}

#[test]
fn concurrent_posts_all_count() {
    const SENDERS: usize = 6;
    const POSTS: usize = 2_000;

    let queue = SpinLock::new(Mailbox::new());
    let drained = SpinLock::new(0usize);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let receiver = s.spawn(|| {
            loop {
                let finished = done.load(Ordering::Acquire);
                let (items, _) = queue.with_lock(Mailbox::take);
                drained.with_lock(|d| *d += items.len());
                if finished {
                    break;
                }
                thread::yield_now();
            }
        });

        let senders: Vec<_> = (0..SENDERS)
            .map(|t| {
                let queue = &queue;
                s.spawn(move || {
                    for n in 0..POSTS {
                        queue.with_lock(|q| q.post((t * POSTS + n) as u64));
                    }
                })
            })
            .collect();
        for h in senders {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);
        receiver.join().unwrap();
    });

    let generation = queue.with_lock(|q| q.generation);
    assert_eq!(generation, (SENDERS * POSTS) as u64);
    // Overflow folds posts into the last slot, so fewer may be drained.
    let drained = drained.with_lock(|d| *d);
    assert!(drained > 0 && drained <= SENDERS * POSTS);
}

#[test]
fn contended_map_lock_serializes_updates() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    // Two counters that must always move together under the lock.
    let counters = SpinLock::new((0usize, 0usize));
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let mut g = counters.lock();
                    assert_eq!(g.0, g.1, "update observed half-done");
                    g.0 += 1;
                    thread::yield_now();
                    g.1 += 1;
                }
            });
        }
    });
    assert_eq!(counters.with_lock(|c| *c), (THREADS * ROUNDS, THREADS * ROUNDS));
}

#[test]
fn a_panicking_holder_releases_the_lock() {
    let queue = SpinLock::new(Mailbox::new());

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        queue.with_lock(|q| {
            q.post(1);
            panic!("handler failed");
        });
    }));
    assert!(res.is_err());
    assert!(!queue.is_locked());
    assert_eq!(queue.with_lock(|q| q.generation), 1);
}

#[test]
fn debug_shows_the_lock_state() {
    let l = SpinLock::new(());
    assert!(format!("{l:?}").contains("locked: false"));
    let _g = l.lock();
    assert!(format!("{l:?}").contains("locked: true"));
}
