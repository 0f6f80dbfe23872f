// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use simkern::trace::Trace;
use simkern::{
    run, AddressSpace, Config, HaltReason, Kernel, Policy, Priority,
    Semaphore, ThreadStatus,
};

fn config(policy: Policy) -> Config {
    Config {
        policy,
        ..Config::default()
    }
}

/// Forks one thread per priority, in order, then lets them all run and
/// returns the order they ran in.
fn dispatch_order(policy: Policy, priorities: &[u8]) -> Vec<u8> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let priorities = priorities.to_vec();
    let report = run(config(policy), move |k| {
        for p in priorities {
            let o = Arc::clone(&o);
            k.spawn_with_priority(&format!("p{p}"), Priority(p), move |_| {
                o.lock().unwrap().push(p);
            });
        }
    })
    .unwrap();
    assert_eq!(report.reason, HaltReason::Idle);
    let order = order.lock().unwrap().clone();
    order
}

#[test]
fn priority_policy_runs_most_important_first() {
    assert_eq!(dispatch_order(Policy::Priority, &[5, 1, 9, 1]), [1, 1, 5, 9]);
}

#[test]
fn fifo_policy_runs_in_fork_order() {
    assert_eq!(dispatch_order(Policy::Fifo, &[5, 1, 9, 1]), [5, 1, 9, 1]);
}

#[test]
fn yield_alternates_between_threads() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    run(Config::default(), move |k| {
        let l2 = Arc::clone(&l);
        k.spawn("forked", move |k| {
            for i in 0..3 {
                l2.lock().unwrap().push(format!("forked {i}"));
                k.yield_now();
            }
        });
        for i in 0..3 {
            l.lock().unwrap().push(format!("main {i}"));
            k.yield_now();
        }
    })
    .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            "main 0", "forked 0", "main 1", "forked 1", "main 2", "forked 2"
        ]
    );
}

#[test]
fn yield_with_nothing_ready_returns() {
    let report = run(Config::default(), |k| {
        let me = k.current_thread();
        assert_eq!(k.ready_count(), 0);
        k.yield_now();
        assert_eq!(k.current_thread(), me);
        assert_eq!(k.thread_status(me), Some(ThreadStatus::Running));
    })
    .unwrap();
    assert_eq!(report.stats.context_switches, 0);
}

#[test]
fn new_thread_does_not_run_until_forked() {
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    run(Config::default(), move |k| {
        let t = k.new_thread("lazy");
        assert_eq!(k.thread_status(t), Some(ThreadStatus::JustCreated));
        k.yield_now();
        assert_eq!(r.load(Ordering::SeqCst), 0);

        let r2 = Arc::clone(&r);
        k.fork(t, move |_| {
            r2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(k.thread_status(t), Some(ThreadStatus::Ready));
        assert_eq!(k.ready_count(), 1);
        k.yield_now();
        assert_eq!(r.load(Ordering::SeqCst), 1);
    })
    .unwrap();
}

#[test]
fn finished_threads_are_reclaimed() {
    let live = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&live);
    run(Config::default(), move |k| {
        let t = k.spawn("short", |_| {});
        l.lock().unwrap().push(k.live_threads());
        k.yield_now();
        // `short` has finished, and we reclaimed it on the way back in.
        l.lock().unwrap().push(k.live_threads());
        assert_eq!(k.thread_status(t), None);
        assert_eq!(k.thread_name(t), None);
    })
    .unwrap();
    assert_eq!(*live.lock().unwrap(), [2, 1]);
}

/// Something a thread owns that calls into the kernel when it's dropped.
struct SignalOnDrop {
    kernel: Kernel,
    sem: Arc<Semaphore>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.log.lock().unwrap().push("dropping".to_string());
        let me = self.kernel.current_thread();
        let name = self.kernel.thread_name(me).map(|n| n.to_string());
        let name = name.unwrap_or_default();
        self.sem.v();
        self.log.lock().unwrap().push(format!("dropped on {name}"));
    }
}

#[test]
fn finish_drops_locals_while_still_running() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    let report = run(Config::default(), move |k| {
        let sem = Arc::new(Semaphore::new(k, "dropped", 0));
        let guard = SignalOnDrop {
            kernel: k.clone(),
            sem: Arc::clone(&sem),
            log: Arc::clone(&l),
        };
        k.spawn("b", move |k| {
            let _guard = guard;
            k.finish();
        });
        sem.p();
        assert_eq!(sem.value(), 0);
        l.lock().unwrap().push("main woke".to_string());
    })
    .unwrap();
    assert_eq!(report.reason, HaltReason::Idle);
    assert_eq!(*log.lock().unwrap(), ["dropping", "dropped on b", "main woke"]);
}

/// Runs `main`, which leaves behind a thread holding a `SignalOnDrop` that
/// never gets dropped while the thread is running, and returns the drop log.
fn stranded_guard(
    main: impl FnOnce(&Kernel, SignalOnDrop) + Send + 'static,
) -> (HaltReason, Vec<String>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    let report = run(Config::default(), move |k| {
        let guard = SignalOnDrop {
            kernel: k.clone(),
            sem: Arc::new(Semaphore::new(k, "never", 0)),
            log: l,
        };
        main(k, guard);
    })
    .unwrap();
    let log = log.lock().unwrap().clone();
    (report.reason, log)
}

#[test]
fn blocked_thread_released_at_teardown_stays_out_of_the_kernel() {
    let (reason, log) = stranded_guard(|k, guard| {
        k.spawn("stuck", move |k| {
            let guard = guard;
            let never = Semaphore::new(k, "never", 0);
            never.p();
            drop(guard);
        });
    });
    assert_eq!(reason, HaltReason::Idle);
    // Its destructor started, but was stopped at the first kernel call.
    assert_eq!(log, ["dropping"]);
}

#[test]
fn halting_thread_stays_out_of_the_kernel() {
    let (reason, log) = stranded_guard(|k, guard| {
        let _guard = guard;
        k.halt();
    });
    assert_eq!(reason, HaltReason::Requested);
    assert_eq!(log, ["dropping"]);
}

#[test]
fn halt_ends_the_run_early() {
    let after = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&after);
    let report = run(Config::default(), move |k| {
        k.spawn("never", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        k.halt();
    })
    .unwrap();
    assert_eq!(report.reason, HaltReason::Requested);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(report.trace.last().map(|e| e.payload), Some(Trace::Halt));
}

#[test]
fn idle_machine_with_only_the_timer_halts() {
    let cfg = Config {
        timer: true,
        ..Config::default()
    };
    let report = run(cfg, |k| {
        assert_eq!(k.pending_interrupts(), 1);
    })
    .unwrap();
    assert_eq!(report.reason, HaltReason::Idle);
    // The idle loop looked at the timer but put it back unfired.
    assert_eq!(report.stats.interrupts, 0);
    assert_eq!(report.stats.total_ticks, 100);
}

#[test]
fn trace_records_dispatches() {
    let report = run(Config::default(), |k| {
        k.spawn("other", |_| {});
        k.yield_now();
    })
    .unwrap();
    let dispatches = report
        .trace
        .iter()
        .filter(|e| matches!(e.payload, Trace::Dispatch { .. }))
        .count();
    assert!(dispatches >= 2, "trace: {:?}", report.trace);
    assert_eq!(report.trace.first().map(|e| e.payload), Some(Trace::Boot));
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn note(&self, what: &str) {
        self.log.lock().unwrap().push(format!("{} {what}", self.name));
    }
}

impl AddressSpace for Recorder {
    fn save_state(&self) {
        self.note("save");
    }

    fn restore_state(&self) {
        self.note("restore");
    }

    fn save_user_state(&self) {
        self.note("save user");
    }

    fn restore_user_state(&self) {
        self.note("restore user");
    }
}

#[test]
fn address_space_hooks_bracket_switches() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    run(Config::default(), move |k| {
        let t = k.new_thread("user");
        k.set_address_space(
            t,
            Some(Arc::new(Recorder {
                name: "user",
                log: Arc::clone(&l),
            })),
        );
        let l2 = Arc::clone(&l);
        k.fork(t, move |k| {
            l2.lock().unwrap().push("user runs".to_string());
            k.yield_now();
            l2.lock().unwrap().push("user resumes".to_string());
        });
        k.yield_now();
        l.lock().unwrap().push("main runs".to_string());
    })
    .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            "user restore user",
            "user restore",
            "user runs",
            "user save user",
            "user save",
            "main runs",
            "user restore user",
            "user restore",
            "user resumes",
        ]
    );
}

#[derive(Clone, Debug)]
struct Plan {
    priority: u8,
    yields: usize,
    children: usize,
}

fn plan() -> impl Strategy<Value = Plan> {
    (0u8..100, 0usize..4, 0usize..3).prop_map(|(priority, yields, children)| {
        Plan {
            priority,
            yields,
            children,
        }
    })
}

/// Each planned thread yields a few times and forks a few short-lived
/// children of its own.
fn body(
    plan: Plan,
    done: Arc<AtomicUsize>,
) -> impl FnOnce(&Kernel) + Send + 'static {
    move |k| {
        for i in 0..plan.children {
            let done = Arc::clone(&done);
            k.spawn(&format!("child {i}"), move |k| {
                k.yield_now();
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..plan.yields {
            k.yield_now();
        }
        done.fetch_add(1, Ordering::SeqCst);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn unsynchronized_programs_always_halt(
        plans in prop::collection::vec(plan(), 0..6),
        priority in any::<bool>(),
        timer in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let expected: usize =
            plans.iter().map(|p| 1 + p.children).sum();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let cfg = Config {
            policy: if priority { Policy::Priority } else { Policy::Fifo },
            timer,
            random_seed: Some(seed),
            ..Config::default()
        };
        let report = run(cfg, move |k| {
            for (i, p) in plans.into_iter().enumerate() {
                let prio = Priority(p.priority);
                k.spawn_with_priority(&format!("t{i}"), prio, body(p, Arc::clone(&d)));
            }
        });
        let report = report.map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(report.reason, HaltReason::Idle);
        prop_assert_eq!(done.load(Ordering::SeqCst), expected);
    }
}
