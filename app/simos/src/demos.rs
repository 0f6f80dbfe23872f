// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The smaller exercises.

use std::sync::Arc;

use simkern::cell::KernelCell;
use simkern::{IntKind, Kernel, Priority, Semaphore, SynchList};

fn simple_thread(k: &Kernel, which: usize) {
    for num in 0..5 {
        println!("*** thread {which} looped {num} times");
        k.yield_now();
    }
}

pub fn threads(k: &Kernel) {
    for which in 1..=3 {
        k.spawn(&format!("forked thread {which}"), move |k| {
            simple_thread(k, which)
        });
    }
    simple_thread(k, 0);
}

fn prioritized_thread(k: &Kernel, which: usize) {
    let me = k.current_thread();
    let priority = k.priority(me).unwrap_or_default();
    for num in 0..5 {
        println!(
            "*** thread {which} looped {num} times, priority {}",
            priority.0
        );
        if num != 4 {
            k.yield_now();
        }
    }
}

/// Under the priority policy, each yield hands the CPU to the most important
/// thread waiting. Main, at the default priority, waits behind all three.
pub fn priority(k: &Kernel) {
    let threads: Vec<_> = (1..=3u8)
        .map(|which| (which, k.new_thread(&format!("thread {which}"))))
        .collect();
    for &(which, t) in &threads {
        k.set_priority(t, Priority(which));
    }
    for (which, t) in threads {
        k.fork(t, move |k| prioritized_thread(k, usize::from(which)));
    }
    prioritized_thread(k, 0);
}

/// Simulated time each thread burns before reaching the barrier.
const BARRIER_TICKS: u64 = 1000;

struct Barrier {
    parties: usize,
    mutex: Semaphore,
    gate: Semaphore,
    arrived: KernelCell<usize>,
}

impl Barrier {
    fn new(k: &Kernel, parties: usize) -> Self {
        Self {
            parties,
            mutex: Semaphore::new(k, "barrier mutex", 1),
            gate: Semaphore::new(k, "barrier", 0),
            arrived: KernelCell::new(0),
        }
    }

    /// Waits for everybody to arrive. Returns true in the last thread to get
    /// here, which is the one that lets the rest through.
    fn wait(&self) -> bool {
        self.mutex.p();
        let n = self.arrived.with(|a| {
            *a += 1;
            *a
        });
        self.mutex.v();

        if n == self.parties {
            for _ in 1..self.parties {
                self.gate.v();
            }
            true
        } else {
            self.gate.p();
            false
        }
    }
}

pub fn barrier(k: &Kernel, threads: usize) {
    let barrier = Arc::new(Barrier::new(k, threads));
    for which in 0..threads {
        let barrier = Arc::clone(&barrier);
        k.spawn(&format!("thread {which}"), move |k| {
            k.burn_ticks(BARRIER_TICKS);
            println!("thread {which} rendezvous at tick {}", k.now());
            if barrier.wait() {
                println!("thread {which} is the last");
            }
            println!("thread {which} critical point");
        });
    }
}

const WORKERS: usize = 2;

/// Main hands out jobs of increasing size; each worker burns as many ticks
/// as its job says. `None` means there's no more work.
pub fn synchlist(k: &Kernel) {
    let jobs = Arc::new(SynchList::new(k, "jobs"));

    for w in 0..WORKERS {
        let jobs = Arc::clone(&jobs);
        k.spawn(&format!("worker {w}"), move |k| {
            while let Some(job) = jobs.remove() {
                println!("worker {w} took job {job} at tick {}", k.now());
                k.burn_ticks(job);
            }
            println!("worker {w} done");
        });
    }

    for job in 1..=6 {
        jobs.append(Some(job * 3));
        k.yield_now();
    }
    for _ in 0..WORKERS {
        jobs.append(None);
    }
}

/// Devices that each complete one operation some fixed time after it's
/// started. Main starts them all and waits for each to finish; the machine
/// idles forward to each completion in turn.
pub fn clock(k: &Kernel) {
    let devices = [
        (IntKind::NetworkSend, 300),
        (IntKind::Disk, 50),
        (IntKind::ConsoleWrite, 120),
    ];
    let done = Arc::new(Semaphore::new(k, "device done", 0));
    let start = k.now();

    for (kind, latency) in devices {
        let done = Arc::clone(&done);
        k.schedule(
            move |k| {
                println!("{kind} done at tick {}", k.now());
                done.v();
            },
            latency,
            kind,
        );
        println!("{kind} started at tick {}, takes {latency} ticks", k.now());
    }
    for _ in 0..devices.len() {
        done.p();
    }
    println!("all devices done after {} ticks", k.now().since(start));
}
