use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use petek_stm::mv::{atomically, TVar};

#[test]
fn single_thread_counter() {
    let counter = TVar::new(0i64);

    for _ in 0..1000 {
        atomically(|tx| {
            let v = tx.load(&counter)?;
            tx.store(&counter, v + 1);
            Ok(())
        });
    }

    assert_eq!(atomically(|tx| tx.load(&counter)), 1000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_counter() {
    let counter = Arc::new(TVar::new(0i64));
    let threads = 8;
    let increments = 1000;

    let mut handles = vec![];
    for _ in 0..threads {
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..increments {
                atomically(|tx| {
                    let v = tx.load(&counter)?;
                    tx.store(&counter, v + 1);
                    Ok(())
                });
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(atomically(|tx| tx.load(&counter)), threads * increments);
}

#[test]
fn read_your_own_writes() {
    let var = TVar::new(10);

    atomically(|tx| {
        assert_eq!(tx.load(&var)?, 10);
        tx.store(&var, 20);
        assert_eq!(tx.load(&var)?, 20);
        tx.store(&var, 30);
        assert_eq!(tx.load(&var)?, 30);
        Ok(())
    });

    assert_eq!(atomically(|tx| tx.load(&var)), 30);
}

#[test]
fn empty_transaction_always_succeeds() {
    let value = atomically(|_tx| Ok(7));
    assert_eq!(value, 7);
}

#[test]
fn multi_var_transfer_is_atomic() {
    let from = TVar::new(100i64);
    let to = TVar::new(0i64);

    atomically(|tx| {
        let a = tx.load(&from)?;
        let b = tx.load(&to)?;
        tx.store(&from, a - 50);
        tx.store(&to, b + 50);
        Ok(())
    });

    let (a, b) = atomically(|tx| Ok((tx.load(&from)?, tx.load(&to)?)));
    assert_eq!(a, 50);
    assert_eq!(b, 50);
}

/// Two transactions read the same initial value; the one that commits
/// second must abort its first attempt and retry against the fresh value.
#[test]
#[cfg_attr(miri, ignore)]
fn lost_update_is_prevented() {
    let counter = Arc::new(TVar::new(0i64));
    let rollbacks = Arc::new(AtomicUsize::new(0));

    let slow_read_done = Arc::new(AtomicBool::new(false));
    let fast_committed = Arc::new(AtomicBool::new(false));

    let slow = {
        let counter = Arc::clone(&counter);
        let rollbacks = Arc::clone(&rollbacks);
        let slow_read_done = Arc::clone(&slow_read_done);
        let fast_committed = Arc::clone(&fast_committed);
        thread::spawn(move || {
            atomically(|tx| {
                let v = tx.load(&counter)?;

                let rollbacks = Arc::clone(&rollbacks);
                tx.on_rollback(move || {
                    rollbacks.fetch_add(1, Ordering::SeqCst);
                });

                // Let the fast transaction commit between our read and our
                // commit. On the retry the flag is already set.
                slow_read_done.store(true, Ordering::SeqCst);
                while !fast_committed.load(Ordering::SeqCst) {
                    thread::yield_now();
                }

                tx.store(&counter, v + 200);
                Ok(())
            });
        })
    };

    while !slow_read_done.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    atomically(|tx| {
        let v = tx.load(&counter)?;
        tx.store(&counter, v + 100);
        Ok(())
    });
    fast_committed.store(true, Ordering::SeqCst);

    slow.join().unwrap();

    assert!(
        rollbacks.load(Ordering::SeqCst) >= 1,
        "the slow transaction should have rolled back at least once"
    );
    assert_eq!(
        atomically(|tx| tx.load(&counter)),
        300,
        "both increments must survive"
    );
}

/// A panic inside the closure propagates, and the attempt's writes are
/// rolled back.
#[test]
fn panic_rolls_back_writes() {
    let var = TVar::new(String::from("Clean"));

    let result: Result<(), _> = catch_unwind(AssertUnwindSafe(|| {
        atomically(|tx| {
            tx.store(&var, String::from("Dirty"));
            panic!("user error inside the atomic block");
        })
    }));

    assert!(result.is_err());
    assert_eq!(atomically(|tx| tx.load(&var)), "Clean");
}

#[test]
fn commit_hooks_fire_once_rollback_hooks_on_conflict() {
    let var = TVar::new(0);
    let commits = Arc::new(AtomicUsize::new(0));
    let rollbacks = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&commits);
    let r = Arc::clone(&rollbacks);
    atomically(|tx| {
        tx.store(&var, 1);
        let c = Arc::clone(&c);
        let r = Arc::clone(&r);
        tx.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tx.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    });

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn bank_transfer_conserves_money() {
    let accounts: Arc<Vec<TVar<i64>>> =
        Arc::new((0..10).map(|_| TVar::new(1000)).collect());
    let threads = 4;
    let transfers = 200;

    let mut handles = vec![];
    for t in 0..threads {
        let accounts = Arc::clone(&accounts);
        handles.push(thread::spawn(move || {
            for i in 0..transfers {
                let from = (t * 3 + i) % accounts.len();
                let to = (t * 3 + i + 1) % accounts.len();
                atomically(|tx| {
                    let a = tx.load(&accounts[from])?;
                    let b = tx.load(&accounts[to])?;
                    if a >= 1 {
                        tx.store(&accounts[from], a - 1);
                        tx.store(&accounts[to], b + 1);
                    }
                    Ok(())
                });
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let total: i64 = atomically(|tx| {
        let mut sum = 0;
        for account in accounts.iter() {
            sum += tx.load(account)?;
        }
        Ok(sum)
    });
    assert_eq!(total, 10_000, "money must be conserved");
}

/// The transactional allocator: aborts destroy fresh allocations, commits
/// hand them over; `free` is deferred until the commit and routed through
/// the reclamation system.
#[test]
fn alloc_and_free_follow_the_transaction_outcome() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Payload;
    impl Drop for Payload {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Copy)]
    struct Ptr(*mut Payload);
    unsafe impl Send for Ptr {}
    unsafe impl Sync for Ptr {}

    let holder = TVar::new(Ptr(std::ptr::null_mut()));

    // Aborted attempt: the allocation must be destroyed by the rollback.
    let result: Result<(), _> = catch_unwind(AssertUnwindSafe(|| {
        atomically(|tx| {
            let p = tx.alloc(Payload);
            tx.store(&holder, Ptr(p));
            panic!("abort after alloc");
        })
    }));
    assert!(result.is_err());
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);

    // Committed attempt: the allocation survives and is published.
    atomically(|tx| {
        let p = tx.alloc(Payload);
        tx.store(&holder, Ptr(p));
        Ok(())
    });
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);

    // Unlink and free: destruction is deferred through reclamation.
    atomically(|tx| {
        let p = tx.load(&holder)?;
        tx.store(&holder, Ptr(std::ptr::null_mut()));
        unsafe { tx.free(p.0) };
        Ok(())
    });
    for _ in 0..20 {
        petek::flush();
        if DROPS.load(Ordering::SeqCst) == 2 {
            break;
        }
        thread::yield_now();
    }
    assert_eq!(DROPS.load(Ordering::SeqCst), 2);
}

/// Snapshot isolation: a transaction that begins before a writer commits
/// must not observe the writer's value.
#[test]
#[cfg_attr(miri, ignore)]
fn reader_sees_consistent_snapshot() {
    let a = Arc::new(TVar::new(0i64));
    let b = Arc::new(TVar::new(0i64));
    let stop = Arc::new(AtomicBool::new(false));

    // Writer keeps `a` and `b` equal, bumping both in one transaction.
    let writer = {
        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                atomically(|tx| {
                    let va = tx.load(&a)?;
                    let vb = tx.load(&b)?;
                    tx.store(&a, va + 1);
                    tx.store(&b, vb + 1);
                    Ok(())
                });
            }
        })
    };

    for _ in 0..2000 {
        let (va, vb) = atomically(|tx| Ok((tx.load(&a)?, tx.load(&b)?)));
        assert_eq!(va, vb, "torn snapshot: a={} b={}", va, vb);
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}
