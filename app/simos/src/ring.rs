// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Producers and consumers sharing a ring buffer, two ways.
//!
//! Producers each send `MESSAGES` messages and finish. Consumers never
//! finish; once everything has been delivered they block for good, and with
//! nothing else to do the machine halts.

use std::sync::Arc;

use simkern::cell::KernelCell;
use simkern::{ConditionH, Kernel, Monitor, Semaphore};

const BUFF_SIZE: usize = 2;
const PRODUCERS: usize = 2;
const CONSUMERS: usize = 2;
const MESSAGES: usize = 3;

#[derive(Copy, Clone, Debug, Default)]
struct Slot {
    producer: usize,
    value: usize,
}

/// Fixed-size circular buffer. Does no synchronization of its own.
struct Ring {
    buffer: Vec<Slot>,
    input: usize,
    output: usize,
    current: usize,
}

impl Ring {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![Slot::default(); size],
            input: 0,
            output: 0,
            current: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.current == self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.current == 0
    }

    fn put(&mut self, slot: Slot) {
        assert!(!self.is_full(), "put into a full ring");
        self.buffer[self.input] = slot;
        self.input = (self.input + 1) % self.buffer.len();
        self.current += 1;
    }

    fn get(&mut self) -> Slot {
        assert!(!self.is_empty(), "get from an empty ring");
        let slot = self.buffer[self.output];
        self.output = (self.output + 1) % self.buffer.len();
        self.current -= 1;
        slot
    }
}

/// Common shape of both versions.
trait Channel: Send + Sync + 'static {
    fn put(&self, slot: Slot);
    fn get(&self) -> Slot;
}

fn start<C: Channel>(k: &Kernel, channel: C) {
    let channel = Arc::new(channel);
    for which in 0..PRODUCERS {
        let channel = Arc::clone(&channel);
        k.spawn(&format!("producer {which}"), move |k| {
            for value in 0..MESSAGES {
                channel.put(Slot {
                    producer: which,
                    value,
                });
                k.yield_now();
            }
        });
    }
    for which in 0..CONSUMERS {
        let channel = Arc::clone(&channel);
        k.spawn(&format!("consumer {which}"), move |k| loop {
            let slot = channel.get();
            println!(
                "consumer {which}: producer {} message {}",
                slot.producer, slot.value
            );
            k.yield_now();
        });
    }
}

/// The textbook bounded buffer: counting semaphores for empty and full
/// slots, and a binary one around the ring itself.
struct Semaphores {
    ring: KernelCell<Ring>,
    empty: Semaphore,
    full: Semaphore,
    mutex: Semaphore,
}

impl Channel for Semaphores {
    fn put(&self, slot: Slot) {
        self.empty.p();
        self.mutex.p();
        self.ring.with(|r| r.put(slot));
        self.mutex.v();
        self.full.v();
    }

    fn get(&self) -> Slot {
        self.full.p();
        self.mutex.p();
        let slot = self.ring.with(Ring::get);
        self.mutex.v();
        self.empty.v();
        slot
    }
}

pub fn prodcons(k: &Kernel) {
    start(
        k,
        Semaphores {
            ring: KernelCell::new(Ring::new(BUFF_SIZE)),
            empty: Semaphore::new(k, "empty slots", BUFF_SIZE as u32),
            full: Semaphore::new(k, "full slots", 0),
            mutex: Semaphore::new(k, "ring mutex", 1),
        },
    );
}

/// The ring as a Hoare monitor. The waits are guarded by `if`: whoever
/// signals hands the monitor straight over, so the condition still holds.
struct HoareRing {
    ring: KernelCell<Ring>,
    monitor: Monitor,
    not_full: ConditionH,
    not_empty: ConditionH,
}

impl Channel for HoareRing {
    fn put(&self, slot: Slot) {
        self.monitor.enter();
        if self.ring.with(|r| r.is_full()) {
            self.not_full.wait(&self.monitor);
        }
        self.ring.with(|r| r.put(slot));
        self.not_empty.signal(&self.monitor);
        self.monitor.leave();
    }

    fn get(&self) -> Slot {
        self.monitor.enter();
        if self.ring.with(|r| r.is_empty()) {
            self.not_empty.wait(&self.monitor);
        }
        let slot = self.ring.with(Ring::get);
        self.not_full.signal(&self.monitor);
        self.monitor.leave();
        slot
    }
}

pub fn monitor(k: &Kernel) {
    start(
        k,
        HoareRing {
            ring: KernelCell::new(Ring::new(BUFF_SIZE)),
            monitor: Monitor::new(k, "ring"),
            not_full: ConditionH::new(k, "not full"),
            not_empty: ConditionH::new(k, "not empty"),
        },
    );
}
