use kernel_sync::RwSpinLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn readers_share_the_lock() {
    let l = RwSpinLock::new(5u32);
    let a = l.read();
    let b = l.read();
    assert_eq!(*a + *b, 10);
    assert_eq!(l.reader_count(), 2);
    assert!(l.try_write().is_none());
    drop((a, b));
    assert_eq!(l.reader_count(), 0);
    assert!(l.try_write().is_some());
}

#[test]
fn writer_is_exclusive() {
    let l = RwSpinLock::new(Vec::<u8>::new());
    let mut w = l.write();
    w.push(1);
    assert!(l.is_write_locked());
    assert!(l.try_read().is_none());
    assert!(l.try_write().is_none());
    drop(w);
    assert!(!l.is_write_locked());
    assert_eq!(l.read().as_slice(), &[1]);
}

#[test]
fn waiting_writer_blocks_new_readers() {
    let l = Arc::new(RwSpinLock::new(0u32));
    let first = l.read();

    let writer_done = Arc::new(AtomicBool::new(false));
    let handle = {
        let l = Arc::clone(&l);
        let writer_done = Arc::clone(&writer_done);
        thread::spawn(move || {
            *l.write() = 1;
            writer_done.store(true, Ordering::SeqCst);
        })
    };

    // Wait until the writer has announced itself.
    while l.try_read().is_some() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!writer_done.load(Ordering::SeqCst));

    drop(first);
    handle.join().unwrap();
    assert!(writer_done.load(Ordering::SeqCst));
    assert_eq!(*l.read(), 1);
}

#[test]
fn contended_readers_and_writers_stay_consistent() {
    let threads = 6;
    let iters = 2_000;

    // Two counters that writers always bump together.
    let lock = Arc::new(RwSpinLock::new((0usize, 0usize)));
    let writers_in = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::new();
    for t in 0..threads {
        let lock = Arc::clone(&lock);
        let writers_in = Arc::clone(&writers_in);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                if t % 2 == 0 {
                    let mut g = lock.write();
                    assert_eq!(writers_in.fetch_add(1, Ordering::SeqCst), 0);
                    g.0 += 1;
                    g.1 += 1;
                    writers_in.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let g = lock.read();
                    assert_eq!(writers_in.load(Ordering::SeqCst), 0);
                    assert_eq!(g.0, g.1, "reader saw a torn update");
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let g = lock.read();
    assert_eq!(g.0, (threads / 2) * iters);
}
