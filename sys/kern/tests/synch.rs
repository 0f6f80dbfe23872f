// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use simkern::cell::KernelCell;
use simkern::{
    run, Condition, ConditionH, Config, HaltReason, Kernel, Lock, Monitor,
    Policy, Semaphore, SynchList,
};

/// Time slicing with randomized intervals, so threads get interrupted at
/// awkward moments. Set `RUST_LOG=simkern=trace` to watch.
fn chaotic(seed: u64) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config {
        timer: true,
        random_seed: Some(seed),
        timer_ticks: 15,
        ..Config::default()
    }
}

#[test]
fn forked_thread_signals_its_parent() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    let report = run(Config::default(), move |k| {
        let sem = Arc::new(Semaphore::new(k, "b done", 0));
        let s = Arc::clone(&sem);
        let c2 = Arc::clone(&c);
        k.spawn("b", move |k| {
            c2.fetch_add(1, Ordering::SeqCst);
            s.v();
            k.finish();
        });
        sem.p();
        assert_eq!(c.load(Ordering::SeqCst), 1);
    })
    .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(report.reason, HaltReason::Idle);
}

#[test]
fn v_without_waiters_is_remembered() {
    run(Config::default(), |k| {
        let sem = Semaphore::new(k, "s", 0);
        sem.v();
        sem.v();
        assert_eq!(sem.value(), 2);
        sem.p();
        sem.p();
        assert_eq!(sem.value(), 0);
    })
    .unwrap();
}

#[test]
fn completed_p_never_outruns_initial_plus_v() {
    const INITIAL: u32 = 2;
    const CONSUMERS: usize = 4;
    const PER_CONSUMER: usize = 5;

    let p_done = Arc::new(AtomicUsize::new(0));
    let v_done = Arc::new(AtomicUsize::new(0));
    let (pd, vd) = (Arc::clone(&p_done), Arc::clone(&v_done));

    let report = run(chaotic(11), move |k| {
        let sem = Arc::new(Semaphore::new(k, "tokens", INITIAL));
        for i in 0..CONSUMERS {
            let (sem, pd, vd) = (Arc::clone(&sem), Arc::clone(&pd), Arc::clone(&vd));
            k.spawn(&format!("consumer {i}"), move |k| {
                for _ in 0..PER_CONSUMER {
                    sem.p();
                    let p = pd.fetch_add(1, Ordering::SeqCst) + 1;
                    let v = vd.load(Ordering::SeqCst);
                    assert!(p <= INITIAL as usize + v, "{p} P's after {v} V's");
                    k.burn_ticks(2);
                }
            });
        }
        let total = CONSUMERS * PER_CONSUMER - INITIAL as usize;
        for _ in 0..total {
            k.burn_ticks(3);
            vd.fetch_add(1, Ordering::SeqCst);
            sem.v();
        }
    })
    .unwrap();

    assert_eq!(report.reason, HaltReason::Idle);
    assert_eq!(p_done.load(Ordering::SeqCst), CONSUMERS * PER_CONSUMER);
}

#[test]
fn lock_excludes_under_preemption() {
    let inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));
    let (i, e) = (Arc::clone(&inside), Arc::clone(&entries));

    let report = run(chaotic(3), move |k| {
        let lock = Arc::new(Lock::new(k, "lock"));
        for t in 0..4 {
            let (lock, i, e) = (Arc::clone(&lock), Arc::clone(&i), Arc::clone(&e));
            k.spawn(&format!("racer {t}"), move |k| {
                for _ in 0..5 {
                    lock.acquire();
                    assert!(lock.is_held_by_current_thread());
                    assert_eq!(i.fetch_add(1, Ordering::SeqCst), 0);
                    k.burn_ticks(7);
                    assert_eq!(i.fetch_sub(1, Ordering::SeqCst), 1);
                    e.fetch_add(1, Ordering::SeqCst);
                    lock.release();
                    assert!(!lock.is_held_by_current_thread());
                    k.burn_ticks(1);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(entries.load(Ordering::SeqCst), 20);
    assert!(report.stats.context_switches > 20);
}

/// A bounded buffer with Mesa conditions. `take` and `put` both re-check in a
/// loop, and the asserts after the loops are what's being tested.
struct MesaBuffer {
    lock: Lock,
    not_empty: Condition,
    not_full: Condition,
    items: KernelCell<VecDeque<u32>>,
    capacity: usize,
}

impl MesaBuffer {
    fn new(k: &Kernel, capacity: usize) -> Self {
        Self {
            lock: Lock::new(k, "buffer"),
            not_empty: Condition::new(k, "not empty"),
            not_full: Condition::new(k, "not full"),
            items: KernelCell::new(VecDeque::new()),
            capacity,
        }
    }

    fn put(&self, k: &Kernel, v: u32) {
        self.lock.acquire();
        while self.items.with(|q| q.len()) == self.capacity {
            self.not_full.wait(&self.lock);
        }
        assert!(self.items.with(|q| q.len()) < self.capacity);
        k.burn_ticks(1);
        self.items.with(|q| q.push_back(v));
        self.not_empty.signal(&self.lock);
        self.lock.release();
    }

    fn take(&self, k: &Kernel) -> u32 {
        self.lock.acquire();
        while self.items.with(|q| q.is_empty()) {
            self.not_empty.wait(&self.lock);
        }
        k.burn_ticks(1);
        let v = self.items.with(|q| q.pop_front());
        self.not_full.broadcast(&self.lock);
        self.lock.release();
        v.expect("predicate held, so the buffer is nonempty")
    }
}

#[test]
fn mesa_waiters_recheck_their_predicate() {
    let taken = Arc::new(Mutex::new(Vec::new()));
    let t = Arc::clone(&taken);

    run(chaotic(7), move |k| {
        let buf = Arc::new(MesaBuffer::new(k, 2));
        for c in 0..3 {
            let (buf, t) = (Arc::clone(&buf), Arc::clone(&t));
            k.spawn(&format!("consumer {c}"), move |k| {
                for _ in 0..4 {
                    let v = buf.take(k);
                    t.lock().unwrap().push(v);
                }
            });
        }
        for p in 0..2 {
            let buf = Arc::clone(&buf);
            k.spawn(&format!("producer {p}"), move |k| {
                for i in 0..6 {
                    buf.put(k, p * 100 + i);
                }
            });
        }
    })
    .unwrap();

    let mut taken = taken.lock().unwrap().clone();
    taken.sort_unstable();
    let mut expected: Vec<u32> = (0..6).chain(100..106).collect();
    expected.sort_unstable();
    assert_eq!(taken, expected);
}

#[test]
fn mesa_signal_does_not_hand_over_the_lock() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    run(Config::default(), move |k| {
        let lock = Arc::new(Lock::new(k, "lock"));
        let cond = Arc::new(Condition::new(k, "cond"));
        let (lock2, cond2, l2) = (Arc::clone(&lock), Arc::clone(&cond), Arc::clone(&l));
        k.spawn("waiter", move |_| {
            lock2.acquire();
            cond2.wait(&lock2);
            l2.lock().unwrap().push("waiter woke");
            lock2.release();
        });
        k.yield_now();
        assert_eq!(cond.waiting(), 1);

        lock.acquire();
        cond.signal(&lock);
        l.lock().unwrap().push("signaler continues");
        k.yield_now();
        l.lock().unwrap().push("signaler still holds the lock");
        lock.release();
    })
    .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            "signaler continues",
            "signaler still holds the lock",
            "waiter woke"
        ]
    );
}

/// A ring buffer guarded by a Hoare monitor. Waits are guarded with `if`,
/// not `while`: a Hoare signal guarantees the condition on wakeup.
struct HoareRing {
    monitor: Monitor,
    not_full: ConditionH,
    not_empty: ConditionH,
    items: KernelCell<VecDeque<u32>>,
    capacity: usize,
}

impl HoareRing {
    fn new(k: &Kernel, capacity: usize) -> Self {
        Self {
            monitor: Monitor::new(k, "ring"),
            not_full: ConditionH::new(k, "not full"),
            not_empty: ConditionH::new(k, "not empty"),
            items: KernelCell::new(VecDeque::new()),
            capacity,
        }
    }

    fn put(&self, k: &Kernel, v: u32) {
        self.monitor.enter();
        if self.items.with(|q| q.len()) == self.capacity {
            self.not_full.wait(&self.monitor);
        }
        assert!(self.items.with(|q| q.len()) < self.capacity, "ring full");
        k.burn_ticks(1);
        self.items.with(|q| q.push_back(v));
        self.not_empty.signal(&self.monitor);
        self.monitor.leave();
    }

    fn take(&self, k: &Kernel) -> u32 {
        self.monitor.enter();
        if self.items.with(|q| q.is_empty()) {
            self.not_empty.wait(&self.monitor);
        }
        k.burn_ticks(1);
        let v = self.items.with(|q| q.pop_front());
        self.not_full.signal(&self.monitor);
        self.monitor.leave();
        v.expect("ring empty after a Hoare signal")
    }
}

#[test]
fn hoare_signal_guarantees_the_condition() {
    for seed in [1, 2, 3] {
        let taken = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&taken);
        run(chaotic(seed), move |k| {
            let ring = Arc::new(HoareRing::new(k, 2));
            for c in 0..2 {
                let (ring, t) = (Arc::clone(&ring), Arc::clone(&t));
                k.spawn(&format!("consumer {c}"), move |k| {
                    for _ in 0..6 {
                        ring.take(k);
                        t.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            for p in 0..2 {
                let ring = Arc::clone(&ring);
                k.spawn(&format!("producer {p}"), move |k| {
                    for i in 0..6 {
                        ring.put(k, i);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(taken.load(Ordering::SeqCst), 12, "seed {seed}");
    }
}

#[test]
fn hoare_signal_runs_the_waiter_first() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    run(Config::default(), move |k| {
        let m = Arc::new(Monitor::new(k, "m"));
        let c = Arc::new(ConditionH::new(k, "c"));
        let (m2, c2, l2) = (Arc::clone(&m), Arc::clone(&c), Arc::clone(&l));
        k.spawn("waiter", move |_| {
            m2.enter();
            c2.wait(&m2);
            l2.lock().unwrap().push("waiter");
            m2.leave();
        });
        k.yield_now();
        assert_eq!(c.waiting(), 1);

        m.enter();
        c.signal(&m);
        l.lock().unwrap().push("signaler");
        assert_eq!(m.urgent_count(), 0);
        m.leave();
    })
    .unwrap();
    assert_eq!(*log.lock().unwrap(), ["waiter", "signaler"]);
}

#[test]
fn hoare_broadcast_wakes_every_waiter_once() {
    let woke = Arc::new(AtomicUsize::new(0));
    let w = Arc::clone(&woke);
    run(Config::default(), move |k| {
        let m = Arc::new(Monitor::new(k, "m"));
        let c = Arc::new(ConditionH::new(k, "c"));
        for i in 0..3 {
            let (m, c, w) = (Arc::clone(&m), Arc::clone(&c), Arc::clone(&w));
            k.spawn(&format!("waiter {i}"), move |_| {
                m.enter();
                c.wait(&m);
                w.fetch_add(1, Ordering::SeqCst);
                m.leave();
            });
        }
        k.yield_now();
        assert_eq!(c.waiting(), 3);

        m.enter();
        c.broadcast(&m);
        // Every waiter has had its turn in the monitor by now.
        assert_eq!(w.load(Ordering::SeqCst), 3);
        assert_eq!(c.waiting(), 0);
        m.leave();

        m.enter();
        c.broadcast(&m);
        m.leave();
    })
    .unwrap();
    assert_eq!(woke.load(Ordering::SeqCst), 3);
}

#[test]
fn synch_list_hands_items_over_in_order() {
    let got = Arc::new(Mutex::new(Vec::new()));
    let g = Arc::clone(&got);
    let cfg = Config {
        policy: Policy::Priority,
        ..chaotic(5)
    };
    run(cfg, move |k| {
        let list = Arc::new(SynchList::new(k, "work"));
        let (l2, g2) = (Arc::clone(&list), Arc::clone(&g));
        k.spawn("consumer", move |_| {
            for _ in 0..10 {
                let v: u32 = l2.remove();
                g2.lock().unwrap().push(v);
            }
            assert!(l2.is_empty());
        });
        for v in 0..10 {
            list.append(v);
            k.burn_ticks(2);
        }
    })
    .unwrap();
    assert_eq!(*got.lock().unwrap(), (0..10).collect::<Vec<u32>>());
}

#[test]
fn synch_list_for_each_sees_every_item() {
    run(Config::default(), |k| {
        let list = SynchList::new(k, "items");
        for v in [3, 1, 2] {
            list.append(v);
        }
        let mut seen = Vec::new();
        list.for_each(|v| seen.push(*v));
        assert_eq!(seen, [3, 1, 2]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.remove(), 3);
    })
    .unwrap();
}
